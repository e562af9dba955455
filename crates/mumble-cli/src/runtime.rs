//! Session lifecycle: dial, join the requested channel, start audio, wait for the end.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use mumble_client::{
    AutoBitrate, ChannelTree, Client, Config, ConnectEvent, Dialer, DisconnectEvent,
    DisconnectType, Listener,
};
use voice_bridge::{AudioBridge, AudioConfig};

use crate::config::ClientOptions;
use crate::tls::build_tls_config;

type BridgeSlot = Arc<Mutex<Option<AudioBridge>>>;

/// How often the wait loop checks that the I/O thread is still alive.
const OUTCOME_POLL: Duration = Duration::from_millis(250);

/// One-shot session outcome. The first signal wins; later ones are dropped.
#[derive(Clone)]
pub struct Completion {
    tx: Sender<Result<()>>,
}

impl Completion {
    pub fn new() -> (Self, Receiver<Result<()>>) {
        let (tx, rx) = crossbeam_channel::bounded(1);
        (Self { tx }, rx)
    }

    /// Returns `false` if an outcome was already recorded.
    pub fn signal(&self, outcome: Result<()>) -> bool {
        self.tx.try_send(outcome).is_ok()
    }
}

/// Resolve `path` from the root channel by exact names.
pub fn find_channel<S: AsRef<str>>(tree: &ChannelTree, path: &[S]) -> Result<u32> {
    tree.find(path).map(|c| c.id).ok_or_else(|| {
        let joined: Vec<&str> = path.iter().map(AsRef::as_ref).collect();
        anyhow!("no such channel: {}", joined.join("/"))
    })
}

/// Connect, stay until the server or the user ends the session, then tear down.
pub fn run(options: ClientOptions) -> Result<()> {
    let tls = build_tls_config(&options.tls)?;
    let (done, outcome) = Completion::new();
    let bridge: BridgeSlot = Arc::default();

    let target = &options.target;
    let mut config = Config::new();
    config.username = target.username.clone().unwrap_or_default();
    config.password = target.password.clone().unwrap_or_default();
    config.attach(AutoBitrate);
    config.attach(session_listener(
        target.channel_path.clone(),
        options.audio.clone(),
        bridge.clone(),
        done.clone(),
    ));

    let addr = target.address();
    tracing::info!(server = %addr, user = %config.username, "connecting");
    let dialer = Dialer {
        timeout: options.connect_timeout,
    };
    let client = mumble_client::dial_with_dialer(&dialer, &target.host, target.port, config, tls)
        .with_context(|| format!("connect {addr}"))?;

    let signal_client = client.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        tracing::info!("interrupted; disconnecting");
        signal_client.disconnect();
    }) {
        tracing::warn!("ctrl-c handler not installed: {e}");
    }

    let result = wait_for_outcome(&outcome, || client.is_io_running(), OUTCOME_POLL);

    let running = bridge.lock().unwrap_or_else(PoisonError::into_inner).take();
    if let Some(running) = running {
        running.shutdown();
    }
    client.disconnect();
    result
}

/// Block until a hook reports the outcome.
///
/// The I/O thread signals before it exits, so once `alive` turns false a missing outcome means
/// the thread died without reporting one.
pub fn wait_for_outcome(
    outcome: &Receiver<Result<()>>,
    alive: impl Fn() -> bool,
    poll: Duration,
) -> Result<()> {
    loop {
        match outcome.recv_timeout(poll) {
            Ok(result) => return result,
            Err(RecvTimeoutError::Timeout) if alive() => {}
            Err(RecvTimeoutError::Timeout) => {
                return outcome
                    .try_recv()
                    .unwrap_or_else(|_| Err(anyhow!("connection thread stopped unexpectedly")));
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(anyhow!("session ended without an outcome"));
            }
        }
    }
}

fn session_listener(
    channel_path: Vec<String>,
    audio: AudioConfig,
    bridge: BridgeSlot,
    done: Completion,
) -> Listener {
    let connect_done = done.clone();
    Listener {
        connect: Some(Box::new(move |event: &ConnectEvent| {
            if let Err(e) = join_and_bridge(event, &channel_path, &audio, &bridge) {
                connect_done.signal(Err(e));
            }
        })),
        disconnect: Some(Box::new(move |event: &DisconnectEvent| {
            log_disconnect(event);
            done.signal(Ok(()));
        })),
        ..Default::default()
    }
}

fn join_and_bridge(
    event: &ConnectEvent,
    channel_path: &[String],
    audio: &AudioConfig,
    bridge: &BridgeSlot,
) -> Result<()> {
    let client = &event.client;
    log_connected(client, event);

    if !channel_path.is_empty() {
        let id = find_channel(&client.channels(), channel_path)?;
        client.move_self(id).context("joining channel")?;
        tracing::info!(channel = %channel_path.join("/"), id, "joining channel");
    }

    // Held across setup so teardown waits for a bridge that is still starting.
    let mut slot = bridge.lock().unwrap_or_else(PoisonError::into_inner);
    let running = voice_bridge::setup(client, audio.clone()).context("starting audio")?;
    *slot = Some(running);
    Ok(())
}

fn log_connected(client: &Client, event: &ConnectEvent) {
    tracing::info!(
        session = ?client.self_session(),
        max_bitrate = ?event.maximum_bitrate,
        "connected"
    );
    if let Some(welcome) = event.welcome_message.as_deref().filter(|w| !w.is_empty()) {
        tracing::info!(%welcome, "server welcome");
    }
}

fn log_disconnect(event: &DisconnectEvent) {
    let reason = event.reason.as_deref().unwrap_or("");
    match event.kind {
        DisconnectType::User => tracing::info!("disconnected"),
        DisconnectType::Kicked => tracing::warn!(reason, "kicked from server"),
        DisconnectType::Banned => tracing::warn!(reason, "banned from server"),
        DisconnectType::Error => tracing::warn!(reason, "connection lost"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mumble_proto::msgs::ChannelState;

    fn channel(id: u32, parent: u32, name: &str) -> ChannelState {
        ChannelState {
            channel_id: Some(id),
            parent: Some(parent),
            name: Some(name.to_string()),
            ..Default::default()
        }
    }

    fn tree() -> ChannelTree {
        let mut tree = ChannelTree::new();
        tree.apply_state(&ChannelState {
            channel_id: Some(0),
            name: Some("Root".to_string()),
            ..Default::default()
        });
        tree.apply_state(&channel(1, 0, "Team"));
        tree.apply_state(&channel(2, 1, "Voice"));
        tree.apply_state(&channel(3, 0, "AFK"));
        tree
    }

    #[test]
    fn channel_path_resolves_by_name() {
        assert_eq!(find_channel(&tree(), &["Team", "Voice"]).unwrap(), 2);
        assert_eq!(find_channel(&tree(), &["AFK"]).unwrap(), 3);
        assert_eq!(find_channel::<&str>(&tree(), &[]).unwrap(), 0);
    }

    #[test]
    fn missing_channel_names_the_path() {
        let err = find_channel(&tree(), &["Team", "Music"]).unwrap_err();
        assert_eq!(err.to_string(), "no such channel: Team/Music");
    }

    #[test]
    fn dead_io_thread_without_outcome_is_an_error() {
        let (_done, outcome) = Completion::new();
        let err = wait_for_outcome(&outcome, || false, Duration::from_millis(1)).unwrap_err();
        assert_eq!(err.to_string(), "connection thread stopped unexpectedly");
    }

    #[test]
    fn outcome_signalled_before_exit_is_kept() {
        let (done, outcome) = Completion::new();
        let signaller = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            done.signal(Ok(()));
        });
        let result = wait_for_outcome(&outcome, || true, Duration::from_millis(5));
        signaller.join().unwrap();
        assert!(result.is_ok());
    }

    #[test]
    fn completion_keeps_first_outcome() {
        let (done, outcome) = Completion::new();
        assert!(done.signal(Err(anyhow!("no such channel: a/b"))));
        assert!(!done.clone().signal(Ok(())));
        let first = outcome.recv().unwrap();
        assert_eq!(first.unwrap_err().to_string(), "no such channel: a/b");
        assert!(outcome.try_recv().is_err());
    }
}
