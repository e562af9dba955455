//! Session events and the hooks that receive them.
//!
//! Hooks run on the client's I/O thread. They may call back into [`Client`] (e.g.
//! [`Client::move_self`]), but anything slow delays protocol traffic.

use std::time::Duration;

use crate::channels::{Channel, ChannelChange};
use crate::client::Client;
use crate::users::{User, UserChange};

pub struct ConnectEvent {
    pub client: Client,
    pub welcome_message: Option<String>,
    /// Maximum bandwidth announced in `ServerSync`, in bits per second.
    pub maximum_bitrate: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectType {
    /// Connection lost or protocol error.
    Error,
    Kicked,
    Banned,
    /// [`Client::disconnect`] was called.
    User,
}

pub struct DisconnectEvent {
    pub client: Client,
    pub kind: DisconnectType,
    pub reason: Option<String>,
}

pub struct UserChangeEvent {
    pub client: Client,
    pub user: User,
    pub change: UserChange,
}

pub struct ChannelChangeEvent {
    pub client: Client,
    pub channel: Channel,
    pub change: ChannelChange,
}

pub struct TextMessageEvent {
    pub client: Client,
    pub sender: Option<User>,
    pub channels: Vec<u32>,
    pub message: String,
}

pub struct PermissionDeniedEvent {
    pub client: Client,
    pub channel_id: Option<u32>,
    pub session: Option<u32>,
    pub reason: Option<String>,
}

pub struct ServerConfigEvent {
    pub client: Client,
    pub max_bandwidth: Option<u32>,
    pub welcome_text: Option<String>,
    pub allow_html: Option<bool>,
    pub max_users: Option<u32>,
}

/// A behavior hook attached to a session with [`crate::Config::attach`].
pub trait EventListener: Send + Sync {
    fn on_connect(&self, _event: &ConnectEvent) {}
    fn on_disconnect(&self, _event: &DisconnectEvent) {}
    fn on_user_change(&self, _event: &UserChangeEvent) {}
    fn on_channel_change(&self, _event: &ChannelChangeEvent) {}
    fn on_text_message(&self, _event: &TextMessageEvent) {}
    fn on_permission_denied(&self, _event: &PermissionDeniedEvent) {}
    fn on_server_config(&self, _event: &ServerConfigEvent) {}
}

type Hook<E> = Option<Box<dyn Fn(&E) + Send + Sync>>;

/// Closure-backed [`EventListener`]; unset hooks are no-ops.
#[derive(Default)]
pub struct Listener {
    pub connect: Hook<ConnectEvent>,
    pub disconnect: Hook<DisconnectEvent>,
    pub user_change: Hook<UserChangeEvent>,
    pub channel_change: Hook<ChannelChangeEvent>,
    pub text_message: Hook<TextMessageEvent>,
    pub permission_denied: Hook<PermissionDeniedEvent>,
    pub server_config: Hook<ServerConfigEvent>,
}

impl EventListener for Listener {
    fn on_connect(&self, event: &ConnectEvent) {
        if let Some(f) = &self.connect {
            f(event);
        }
    }

    fn on_disconnect(&self, event: &DisconnectEvent) {
        if let Some(f) = &self.disconnect {
            f(event);
        }
    }

    fn on_user_change(&self, event: &UserChangeEvent) {
        if let Some(f) = &self.user_change {
            f(event);
        }
    }

    fn on_channel_change(&self, event: &ChannelChangeEvent) {
        if let Some(f) = &self.channel_change {
            f(event);
        }
    }

    fn on_text_message(&self, event: &TextMessageEvent) {
        if let Some(f) = &self.text_message {
            f(event);
        }
    }

    fn on_permission_denied(&self, event: &PermissionDeniedEvent) {
        if let Some(f) = &self.permission_denied {
            f(event);
        }
    }

    fn on_server_config(&self, event: &ServerConfigEvent) {
        if let Some(f) = &self.server_config {
            f(event);
        }
    }
}

/// Fits the outgoing Opus packet size to the bandwidth the server allows.
pub struct AutoBitrate;

/// Extra packets per second budgeted on top of the audio frame rate.
const AUTO_BITRATE_SAFETY: i64 = 5;
/// Per-packet overhead (framing + voice header) subtracted from the budget.
const AUTO_BITRATE_OVERHEAD: i64 = 32 + 10;

/// Opus payload bytes per packet that fit in `max_bitrate` bits/s at one packet per `interval`.
///
/// Returns `None` when the budget leaves no room for audio.
pub fn auto_bitrate_data_bytes(max_bitrate: u32, interval: Duration) -> Option<usize> {
    let interval_ns = interval.as_nanos().max(1);
    let packets_per_second = (Duration::from_secs(1).as_nanos() / interval_ns) as i64;
    let data = i64::from(max_bitrate) / (8 * (packets_per_second + AUTO_BITRATE_SAFETY))
        - AUTO_BITRATE_OVERHEAD;
    (data > 0).then_some(data as usize)
}

impl EventListener for AutoBitrate {
    fn on_connect(&self, event: &ConnectEvent) {
        let Some(max_bitrate) = event.maximum_bitrate else {
            return;
        };
        let interval = event.client.audio_interval();
        if let Some(bytes) = auto_bitrate_data_bytes(max_bitrate, interval) {
            tracing::debug!(max_bitrate, data_bytes = bytes, "auto bitrate");
            event.client.set_audio_data_bytes(bytes);
        }
    }
}

/// One Opus frame received from another user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioPacket {
    pub session: u32,
    pub sequence: u64,
    pub opus: Vec<u8>,
    /// True on the final frame of a transmission.
    pub last: bool,
}

/// Receives incoming voice, attached with [`Client::attach_audio`].
pub trait AudioListener: Send + Sync {
    fn on_audio_packet(&self, packet: &AudioPacket);
}
