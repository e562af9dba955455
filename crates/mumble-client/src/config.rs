use std::sync::Arc;
use std::time::Duration;

use crate::event::EventListener;

/// Default spacing between outgoing audio packets.
pub const DEFAULT_AUDIO_INTERVAL: Duration = Duration::from_millis(10);
/// Default Opus payload budget per packet (bytes).
pub const DEFAULT_AUDIO_DATA_BYTES: usize = 40;

/// Session configuration handed to [`crate::dial_with_dialer`].
#[derive(Clone)]
pub struct Config {
    pub username: String,
    pub password: String,
    /// Access tokens sent with `Authenticate`.
    pub tokens: Vec<String>,
    pub audio_interval: Duration,
    pub audio_data_bytes: usize,
    pub(crate) listeners: Vec<Arc<dyn EventListener>>,
}

impl Config {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a behavior hook. Hooks run in attach order.
    pub fn attach(&mut self, listener: impl EventListener + 'static) {
        self.listeners.push(Arc::new(listener));
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            username: String::new(),
            password: String::new(),
            tokens: Vec::new(),
            audio_interval: DEFAULT_AUDIO_INTERVAL,
            audio_data_bytes: DEFAULT_AUDIO_DATA_BYTES,
            listeners: Vec::new(),
        }
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("tokens", &self.tokens.len())
            .field("audio_interval", &self.audio_interval)
            .field("audio_data_bytes", &self.audio_data_bytes)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

/// How to open the transport: TCP connect and handshake deadlines.
#[derive(Clone, Debug)]
pub struct Dialer {
    /// Applies to the TCP connect, the TLS handshake, and waiting for `ServerSync` each.
    pub timeout: Duration,
}

impl Default for Dialer {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }
}
