//! Connection setup and the session I/O loop.
//!
//! One thread owns the TLS stream. Each pass it:
//! 1. flushes queued control frames, then queued voice frames
//! 2. sends a `Ping` every [`PING_INTERVAL`]
//! 3. reads with a short socket timeout and handles every complete frame
//!
//! State updates happen under the session lock; hooks are called after it is released.

use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use mumble_proto::{Frame, FrameDecoder, MessageType, msgs, voice};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, ClientConnection, StreamOwned};

use crate::channels::{ChannelChange, ChannelTree};
use crate::config::{Config, Dialer};
use crate::error::ClientError;
use crate::event::{
    AudioListener, AudioPacket, ChannelChangeEvent, ConnectEvent, DisconnectEvent, DisconnectType,
    EventListener, PermissionDeniedEvent, ServerConfigEvent, TextMessageEvent, UserChangeEvent,
};
use crate::users::{User, UserChange, Users};

/// Servers drop clients that stay silent for 30 s.
pub const PING_INTERVAL: Duration = Duration::from_secs(5);
const READ_POLL: Duration = Duration::from_millis(5);
const WRITE_TIMEOUT: Duration = Duration::from_secs(2);
/// Voice frames queued ahead of the socket before new ones are dropped.
const AUDIO_QUEUE_FRAMES: usize = 64;

type TlsStream = StreamOwned<ClientConnection, TcpStream>;

enum Outgoing {
    Frame(Vec<u8>),
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerVersion {
    pub version: (u16, u8, u8),
    pub release: Option<String>,
    pub os: Option<String>,
}

#[derive(Default)]
struct SessionState {
    channels: ChannelTree,
    users: Users,
    self_session: Option<u32>,
    max_bandwidth: Option<u32>,
    welcome_text: Option<String>,
    server_version: Option<ServerVersion>,
    tcp_ping_ms: Option<f32>,
}

struct Inner {
    control_tx: Sender<Outgoing>,
    audio_tx: Sender<Vec<u8>>,
    state: RwLock<SessionState>,
    listeners: Vec<Arc<dyn EventListener>>,
    audio_listeners: RwLock<Vec<Arc<dyn AudioListener>>>,
    connected: AtomicBool,
    /// Cleared when the I/O thread exits, after the disconnect hooks ran.
    io_running: AtomicBool,
    audio_interval: Duration,
    audio_data_bytes: AtomicUsize,
    audio_sequence: AtomicU64,
}

/// Handle to a live session. Cheap to clone; all clones talk to the same connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

/// Open a session: TCP connect, TLS handshake, `Version` + `Authenticate`, then wait for the
/// server to finish syncing state.
///
/// Returns once `ServerSync` arrives (hooks get `on_connect` from the I/O thread at the same
/// moment), or with the first error: rejection, I/O failure, or `dialer.timeout` elapsing.
pub fn dial_with_dialer(
    dialer: &Dialer,
    host: &str,
    port: u16,
    config: Config,
    tls: Arc<ClientConfig>,
) -> Result<Client, ClientError> {
    let sock = connect_tcp(host, port, dialer.timeout)?;
    let conn = ClientConnection::new(tls, server_name_for(host)?)?;
    let mut stream = StreamOwned::new(conn, sock);
    complete_handshake(&mut stream, dialer.timeout)?;
    tracing::debug!(host, port, "tls established");

    send_hello(&mut stream, &config)?;
    stream.sock.set_read_timeout(Some(READ_POLL))?;
    stream.sock.set_write_timeout(Some(WRITE_TIMEOUT))?;

    let (control_tx, control_rx) = crossbeam_channel::unbounded();
    let (audio_tx, audio_rx) = crossbeam_channel::bounded(AUDIO_QUEUE_FRAMES);
    let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
    let client = Client::new(control_tx, audio_tx, &config);

    let io = IoLoop::new(client.clone(), ready_tx);
    std::thread::Builder::new()
        .name("mumble-io".to_string())
        .spawn(move || io.run(stream, control_rx, audio_rx))?;

    match ready_rx.recv_timeout(dialer.timeout) {
        Ok(Ok(())) => Ok(client),
        Ok(Err(err)) => Err(err),
        Err(RecvTimeoutError::Timeout) => {
            client.disconnect();
            Err(ClientError::Timeout)
        }
        Err(RecvTimeoutError::Disconnected) => Err(ClientError::Closed),
    }
}

impl Client {
    fn new(control_tx: Sender<Outgoing>, audio_tx: Sender<Vec<u8>>, config: &Config) -> Self {
        Self {
            inner: Arc::new(Inner {
                control_tx,
                audio_tx,
                state: RwLock::new(SessionState::default()),
                listeners: config.listeners.clone(),
                audio_listeners: RwLock::new(Vec::new()),
                connected: AtomicBool::new(false),
                io_running: AtomicBool::new(true),
                audio_interval: config.audio_interval,
                audio_data_bytes: AtomicUsize::new(config.audio_data_bytes),
                audio_sequence: AtomicU64::new(0),
            }),
        }
    }

    fn state(&self) -> RwLockReadGuard<'_, SessionState> {
        self.inner.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn state_mut(&self) -> RwLockWriteGuard<'_, SessionState> {
        self.inner.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, f: impl Fn(&dyn EventListener)) {
        for listener in &self.inner.listeners {
            f(listener.as_ref());
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::Acquire)
    }

    /// False once the I/O thread has ended, whether it finished normally or panicked.
    pub fn is_io_running(&self) -> bool {
        self.inner.io_running.load(Ordering::Acquire)
    }

    /// Snapshot of the server's channel tree.
    pub fn channels(&self) -> ChannelTree {
        self.state().channels.clone()
    }

    /// Snapshot of all connected users, including this client.
    pub fn users(&self) -> Vec<User> {
        self.state().users.all()
    }

    pub fn self_session(&self) -> Option<u32> {
        self.state().self_session
    }

    pub fn self_user(&self) -> Option<User> {
        let state = self.state();
        let session = state.self_session?;
        state.users.get(session).cloned()
    }

    pub fn server_version(&self) -> Option<ServerVersion> {
        self.state().server_version.clone()
    }

    /// Maximum bandwidth the server allows, in bits per second.
    pub fn max_bandwidth(&self) -> Option<u32> {
        self.state().max_bandwidth
    }

    pub fn welcome_text(&self) -> Option<String> {
        self.state().welcome_text.clone()
    }

    /// Smoothed control-channel round trip time.
    pub fn tcp_ping_ms(&self) -> Option<f32> {
        self.state().tcp_ping_ms
    }

    /// Ask the server to move this client into `channel_id`.
    pub fn move_self(&self, channel_id: u32) -> Result<(), ClientError> {
        let session = self.self_session().ok_or(ClientError::NotConnected)?;
        let msg = msgs::UserState {
            session: Some(session),
            channel_id: Some(channel_id),
            ..Default::default()
        };
        self.send_message(MessageType::UserState, &msg)
    }

    fn send_message<M: prost::Message>(&self, kind: MessageType, msg: &M) -> Result<(), ClientError> {
        let frame = mumble_proto::encode_message(kind, msg)?;
        self.inner
            .control_tx
            .send(Outgoing::Frame(frame))
            .map_err(|_| ClientError::NotConnected)
    }

    /// Queue one Opus frame for transmission to the current channel.
    ///
    /// Frames are dropped (not queued) while the socket is backed up. Set `last` on the final
    /// frame so receivers can end the speaker's stream.
    pub fn send_audio(&self, opus: &[u8], last: bool) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::NotConnected);
        }
        let sequence = self.inner.audio_sequence.fetch_add(1, Ordering::Relaxed);
        let packet = voice::encode_client_voice(voice::TARGET_NORMAL, sequence, opus, last)?;
        let frame = mumble_proto::encode_frame(MessageType::UdpTunnel, &packet)?;
        match self.inner.audio_tx.try_send(frame) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                tracing::trace!(sequence, "voice queue full; frame dropped");
                Ok(())
            }
            Err(TrySendError::Disconnected(_)) => Err(ClientError::NotConnected),
        }
    }

    /// Register a receiver for incoming voice frames.
    pub fn attach_audio(&self, listener: Arc<dyn AudioListener>) {
        self.inner
            .audio_listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub fn audio_interval(&self) -> Duration {
        self.inner.audio_interval
    }

    /// Current Opus payload budget per packet.
    pub fn audio_data_bytes(&self) -> usize {
        self.inner.audio_data_bytes.load(Ordering::Relaxed)
    }

    pub fn set_audio_data_bytes(&self, bytes: usize) {
        self.inner.audio_data_bytes.store(bytes, Ordering::Relaxed);
    }

    /// Bits per second implied by the packet budget and interval.
    pub fn audio_bitrate(&self) -> u32 {
        let per_second = Duration::from_secs(1).as_nanos() / self.inner.audio_interval.as_nanos().max(1);
        (self.audio_data_bytes() as u128 * 8 * per_second).min(u32::MAX as u128) as u32
    }

    /// Close the connection. `on_disconnect` fires with [`DisconnectType::User`].
    pub fn disconnect(&self) {
        let _ = self.inner.control_tx.send(Outgoing::Close);
    }
}

fn display_addr(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

fn connect_tcp(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, ClientError> {
    let display = display_addr(host, port);
    let addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|source| ClientError::Resolve {
            addr: display.clone(),
            source,
        })?
        .collect();

    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(sock) => {
                sock.set_nodelay(true)?;
                tracing::debug!(%addr, "tcp connected");
                return Ok(sock);
            }
            Err(err) => {
                tracing::debug!(%addr, error = %err, "connect attempt failed");
                last_err = Some(err);
            }
        }
    }
    Err(match last_err {
        Some(err) => ClientError::Io(err),
        None => ClientError::NoAddress(display),
    })
}

fn server_name_for(host: &str) -> Result<ServerName<'static>, ClientError> {
    if let Ok(ip) = host.parse::<std::net::IpAddr>() {
        return Ok(ServerName::IpAddress(ip.into()));
    }
    ServerName::try_from(host.to_string()).map_err(|_| ClientError::ServerName(host.to_string()))
}

fn complete_handshake(stream: &mut TlsStream, timeout: Duration) -> Result<(), ClientError> {
    stream.sock.set_read_timeout(Some(timeout))?;
    stream.sock.set_write_timeout(Some(timeout))?;
    while stream.conn.is_handshaking() {
        stream.conn.complete_io(&mut stream.sock)?;
    }
    Ok(())
}

fn write_message<M: prost::Message>(
    mut w: impl Write,
    kind: MessageType,
    msg: &M,
) -> io::Result<()> {
    let frame = mumble_proto::encode_message(kind, msg)?;
    w.write_all(&frame)
}

fn send_hello(stream: &mut TlsStream, config: &Config) -> io::Result<()> {
    let (major, minor, patch) = mumble_proto::CLIENT_VERSION;
    let version = msgs::Version {
        version: Some(mumble_proto::encode_version(major, minor, patch)),
        release: Some(format!("mumble-client {}", env!("CARGO_PKG_VERSION"))),
        os: Some(std::env::consts::OS.to_string()),
        os_version: Some(std::env::consts::ARCH.to_string()),
    };
    write_message(&mut *stream, MessageType::Version, &version)?;

    let auth = msgs::Authenticate {
        username: Some(config.username.clone()),
        password: (!config.password.is_empty()).then(|| config.password.clone()),
        tokens: config.tokens.clone(),
        opus: Some(true),
        ..Default::default()
    };
    write_message(&mut *stream, MessageType::Authenticate, &auth)?;
    stream.flush()
}

fn close_tls(stream: &mut TlsStream) {
    stream.conn.send_close_notify();
    let _ = stream.conn.complete_io(&mut stream.sock);
    let _ = stream.sock.shutdown(Shutdown::Both);
}

fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

/// Running mean/variance of control-channel round trips (milliseconds).
#[derive(Debug, Default, Clone, Copy)]
struct PingStats {
    samples: u32,
    mean: f32,
    m2: f32,
}

impl PingStats {
    fn record(&mut self, rtt_ms: f32) {
        self.samples = self.samples.saturating_add(1);
        let delta = rtt_ms - self.mean;
        self.mean += delta / self.samples as f32;
        self.m2 += delta * (rtt_ms - self.mean);
    }

    fn mean(&self) -> Option<f32> {
        (self.samples > 0).then_some(self.mean)
    }

    fn variance(&self) -> Option<f32> {
        (self.samples > 1).then(|| self.m2 / (self.samples - 1) as f32)
    }
}

/// Why the I/O loop stopped.
#[derive(Debug)]
enum Ending {
    /// The session had synced; hooks get `on_disconnect`.
    Disconnect(DisconnectType, Option<String>),
    /// The handshake never completed; the error goes back to `dial_with_dialer`.
    Failed(ClientError),
}

struct IoLoop {
    client: Client,
    ready_tx: Option<Sender<Result<(), ClientError>>>,
    decoder: FrameDecoder,
    started: Instant,
    last_ping: Instant,
    received: u32,
    ping: PingStats,
}

impl IoLoop {
    fn new(client: Client, ready_tx: Sender<Result<(), ClientError>>) -> Self {
        Self {
            client,
            ready_tx: Some(ready_tx),
            decoder: FrameDecoder::new(),
            started: Instant::now(),
            last_ping: Instant::now(),
            received: 0,
            ping: PingStats::default(),
        }
    }

    fn run(mut self, mut stream: TlsStream, control_rx: Receiver<Outgoing>, audio_rx: Receiver<Vec<u8>>) {
        let _running = RunningGuard(self.client.clone());
        let ending = self.pump(&mut stream, &control_rx, &audio_rx);
        self.finish(ending);
    }

    fn pump(
        &mut self,
        stream: &mut TlsStream,
        control_rx: &Receiver<Outgoing>,
        audio_rx: &Receiver<Vec<u8>>,
    ) -> Ending {
        loop {
            loop {
                match control_rx.try_recv() {
                    Ok(Outgoing::Frame(frame)) => {
                        if let Err(err) = stream.write_all(&frame) {
                            return self.io_failure(err);
                        }
                    }
                    Ok(Outgoing::Close) | Err(TryRecvError::Disconnected) => {
                        close_tls(stream);
                        return Ending::Disconnect(DisconnectType::User, None);
                    }
                    Err(TryRecvError::Empty) => break,
                }
            }
            while let Ok(frame) = audio_rx.try_recv() {
                if let Err(err) = stream.write_all(&frame) {
                    return self.io_failure(err);
                }
            }

            if self.last_ping.elapsed() >= PING_INTERVAL {
                if let Err(err) = self.send_ping(stream) {
                    return self.io_failure(err);
                }
            }

            match self.decoder.read_from(&mut *stream) {
                Ok(0) => return self.closed_by_peer(),
                Ok(_) => {}
                Err(err) if is_timeout(&err) => {}
                Err(err) => return self.io_failure(err),
            }

            loop {
                match self.decoder.next_frame() {
                    Ok(Some(frame)) => {
                        if let Err(ending) = self.handle_frame(frame) {
                            close_tls(stream);
                            return ending;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => return self.io_failure(err),
                }
            }
        }
    }

    fn finish(mut self, ending: Ending) {
        self.client.inner.connected.store(false, Ordering::Release);
        match ending {
            Ending::Failed(err) => {
                tracing::debug!(error = %err, "handshake failed");
                if let Some(tx) = self.ready_tx.take() {
                    let _ = tx.send(Err(err));
                }
            }
            Ending::Disconnect(kind, reason) => {
                if let Some(tx) = self.ready_tx.take() {
                    let _ = tx.send(Err(ClientError::Closed));
                    return;
                }
                tracing::info!(?kind, reason = reason.as_deref().unwrap_or(""), "disconnected");
                let event = DisconnectEvent {
                    client: self.client.clone(),
                    kind,
                    reason,
                };
                self.client.emit(|l| l.on_disconnect(&event));
            }
        }
    }

    fn synced(&self) -> bool {
        self.ready_tx.is_none()
    }

    fn io_failure(&self, err: io::Error) -> Ending {
        if self.synced() {
            Ending::Disconnect(DisconnectType::Error, Some(err.to_string()))
        } else {
            Ending::Failed(ClientError::Io(err))
        }
    }

    fn closed_by_peer(&self) -> Ending {
        if self.synced() {
            Ending::Disconnect(
                DisconnectType::Error,
                Some("connection closed by server".to_string()),
            )
        } else {
            Ending::Failed(ClientError::Closed)
        }
    }

    fn send_ping(&mut self, stream: &mut TlsStream) -> io::Result<()> {
        let ping = msgs::Ping {
            timestamp: Some(self.started.elapsed().as_micros() as u64),
            tcp_packets: Some(self.received),
            tcp_ping_avg: self.ping.mean(),
            tcp_ping_var: self.ping.variance(),
            ..Default::default()
        };
        write_message(&mut *stream, MessageType::Ping, &ping)?;
        self.last_ping = Instant::now();
        Ok(())
    }

    fn decode<M: prost::Message + Default>(&self, frame: &Frame) -> Result<M, Ending> {
        mumble_proto::decode_message(&frame.payload).map_err(|e| self.io_failure(e))
    }

    fn handle_frame(&mut self, frame: Frame) -> Result<(), Ending> {
        self.received = self.received.wrapping_add(1);
        let kind = match frame.message_type() {
            Ok(kind) => kind,
            Err(_) => {
                tracing::trace!(kind = frame.kind, "skipping unknown message type");
                return Ok(());
            }
        };
        match kind {
            MessageType::UdpTunnel => self.on_voice(&frame.payload),
            MessageType::Ping => {
                let msg: msgs::Ping = self.decode(&frame)?;
                self.on_ping(msg);
            }
            MessageType::Version => {
                let msg: msgs::Version = self.decode(&frame)?;
                self.on_version(msg);
            }
            MessageType::Reject => {
                let msg: msgs::Reject = self.decode(&frame)?;
                return Err(self.on_reject(msg));
            }
            MessageType::ServerSync => {
                let msg: msgs::ServerSync = self.decode(&frame)?;
                self.on_server_sync(msg);
            }
            MessageType::ChannelState => {
                let msg: msgs::ChannelState = self.decode(&frame)?;
                self.on_channel_state(msg);
            }
            MessageType::ChannelRemove => {
                let msg: msgs::ChannelRemove = self.decode(&frame)?;
                self.on_channel_remove(msg);
            }
            MessageType::UserState => {
                let msg: msgs::UserState = self.decode(&frame)?;
                self.on_user_state(msg);
            }
            MessageType::UserRemove => {
                let msg: msgs::UserRemove = self.decode(&frame)?;
                self.on_user_remove(msg)?;
            }
            MessageType::TextMessage => {
                let msg: msgs::TextMessage = self.decode(&frame)?;
                self.on_text_message(msg);
            }
            MessageType::PermissionDenied => {
                let msg: msgs::PermissionDenied = self.decode(&frame)?;
                self.on_permission_denied(msg);
            }
            MessageType::ServerConfig => {
                let msg: msgs::ServerConfig = self.decode(&frame)?;
                self.on_server_config(msg);
            }
            MessageType::CodecVersion => {
                let msg: msgs::CodecVersion = self.decode(&frame)?;
                if msg.opus != Some(true) {
                    tracing::warn!("server did not enable opus; voice may not be heard");
                }
            }
            MessageType::CryptSetup => {
                tracing::debug!("udp crypt setup ignored; voice is tunnelled over tls");
            }
            other => {
                tracing::trace!(?other, "message ignored");
            }
        }
        Ok(())
    }

    fn on_voice(&self, payload: &[u8]) {
        let voice = match voice::decode_server_voice(payload) {
            Ok(v) => v,
            Err(err) if err.kind() == io::ErrorKind::Unsupported => {
                tracing::trace!(error = %err, "voice packet skipped");
                return;
            }
            Err(err) => {
                tracing::debug!(error = %err, "malformed voice packet");
                return;
            }
        };
        let packet = AudioPacket {
            session: voice.session,
            sequence: voice.sequence,
            opus: voice.opus,
            last: voice.last,
        };
        let listeners = self
            .client
            .inner
            .audio_listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            listener.on_audio_packet(&packet);
        }
    }

    fn on_ping(&mut self, msg: msgs::Ping) {
        let Some(sent_us) = msg.timestamp else { return };
        let now_us = self.started.elapsed().as_micros() as u64;
        let rtt_ms = now_us.saturating_sub(sent_us) as f32 / 1000.0;
        self.ping.record(rtt_ms);
        self.client.state_mut().tcp_ping_ms = self.ping.mean();
        tracing::trace!(rtt_ms, "ping");
    }

    fn on_version(&self, msg: msgs::Version) {
        let version = ServerVersion {
            version: mumble_proto::decode_version(msg.version.unwrap_or(0)),
            release: msg.release,
            os: msg.os,
        };
        tracing::info!(
            version = ?version.version,
            release = version.release.as_deref().unwrap_or(""),
            "server version"
        );
        self.client.state_mut().server_version = Some(version);
    }

    fn on_reject(&self, msg: msgs::Reject) -> Ending {
        let kind = msg.reject_type();
        if self.synced() {
            Ending::Disconnect(DisconnectType::Error, msg.reason)
        } else {
            Ending::Failed(ClientError::rejected(kind, msg.reason))
        }
    }

    fn on_server_sync(&mut self, msg: msgs::ServerSync) {
        {
            let mut state = self.client.state_mut();
            state.self_session = msg.session;
            state.max_bandwidth = msg.max_bandwidth;
            state.welcome_text = msg.welcome_text.clone();
        }
        self.client.inner.connected.store(true, Ordering::Release);
        if let Some(tx) = self.ready_tx.take() {
            let _ = tx.send(Ok(()));
        }
        tracing::info!(
            session = msg.session,
            max_bandwidth = msg.max_bandwidth,
            "connected"
        );

        let event = ConnectEvent {
            client: self.client.clone(),
            welcome_message: msg.welcome_text,
            maximum_bitrate: msg.max_bandwidth,
        };
        self.client.emit(|l| l.on_connect(&event));
    }

    fn on_channel_state(&self, msg: msgs::ChannelState) {
        let Some((channel, change)) = self.client.state_mut().channels.apply_state(&msg) else {
            return;
        };
        let event = ChannelChangeEvent {
            client: self.client.clone(),
            channel,
            change,
        };
        self.client.emit(|l| l.on_channel_change(&event));
    }

    fn on_channel_remove(&self, msg: msgs::ChannelRemove) {
        let Some(channel) = self.client.state_mut().channels.remove(msg.channel_id) else {
            return;
        };
        let event = ChannelChangeEvent {
            client: self.client.clone(),
            channel,
            change: ChannelChange::Removed,
        };
        self.client.emit(|l| l.on_channel_change(&event));
    }

    fn on_user_state(&self, msg: msgs::UserState) {
        let Some((user, change)) = self.client.state_mut().users.apply_state(&msg) else {
            return;
        };
        let event = UserChangeEvent {
            client: self.client.clone(),
            user,
            change,
        };
        self.client.emit(|l| l.on_user_change(&event));
    }

    fn on_user_remove(&self, msg: msgs::UserRemove) -> Result<(), Ending> {
        let removed = {
            let mut state = self.client.state_mut();
            if state.self_session == Some(msg.session) {
                let kind = if msg.ban == Some(true) {
                    DisconnectType::Banned
                } else {
                    DisconnectType::Kicked
                };
                return Err(Ending::Disconnect(kind, msg.reason));
            }
            state.users.remove(msg.session)
        };
        if let Some(user) = removed {
            let event = UserChangeEvent {
                client: self.client.clone(),
                user,
                change: UserChange::Disconnected,
            };
            self.client.emit(|l| l.on_user_change(&event));
        }
        Ok(())
    }

    fn on_text_message(&self, msg: msgs::TextMessage) {
        let sender = msg
            .actor
            .and_then(|actor| self.client.state().users.get(actor).cloned());
        let event = TextMessageEvent {
            client: self.client.clone(),
            sender,
            channels: msg.channel_id,
            message: msg.message,
        };
        self.client.emit(|l| l.on_text_message(&event));
    }

    fn on_permission_denied(&self, msg: msgs::PermissionDenied) {
        tracing::warn!(
            channel_id = msg.channel_id,
            reason = msg.reason.as_deref().unwrap_or(""),
            "permission denied"
        );
        let event = PermissionDeniedEvent {
            client: self.client.clone(),
            channel_id: msg.channel_id,
            session: msg.session,
            reason: msg.reason,
        };
        self.client.emit(|l| l.on_permission_denied(&event));
    }

    fn on_server_config(&self, msg: msgs::ServerConfig) {
        if let Some(max_bandwidth) = msg.max_bandwidth {
            self.client.state_mut().max_bandwidth = Some(max_bandwidth);
        }
        let event = ServerConfigEvent {
            client: self.client.clone(),
            max_bandwidth: msg.max_bandwidth,
            welcome_text: msg.welcome_text,
            allow_html: msg.allow_html,
            max_users: msg.max_users,
        };
        self.client.emit(|l| l.on_server_config(&event));
    }
}

/// Clears [`Client::is_io_running`] on drop, so a panicking I/O thread is still observed.
struct RunningGuard(Client);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.inner.io_running.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{AutoBitrate, Listener};
    use std::sync::Mutex;

    struct Harness {
        io: IoLoop,
        client: Client,
        control_rx: Receiver<Outgoing>,
        audio_rx: Receiver<Vec<u8>>,
        ready_rx: Receiver<Result<(), ClientError>>,
    }

    fn harness(config: Config) -> Harness {
        let (control_tx, control_rx) = crossbeam_channel::unbounded();
        let (audio_tx, audio_rx) = crossbeam_channel::bounded(AUDIO_QUEUE_FRAMES);
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
        let client = Client::new(control_tx, audio_tx, &config);
        let io = IoLoop::new(client.clone(), ready_tx);
        Harness {
            io,
            client,
            control_rx,
            audio_rx,
            ready_rx,
        }
    }

    fn frame<M: prost::Message>(kind: MessageType, msg: &M) -> Frame {
        Frame {
            kind: kind as u16,
            payload: msg.encode_to_vec(),
        }
    }

    fn sync(h: &mut Harness, session: u32, max_bandwidth: Option<u32>) {
        let msg = msgs::ServerSync {
            session: Some(session),
            max_bandwidth,
            welcome_text: Some("hi".to_string()),
            permissions: None,
        };
        assert!(h.io.handle_frame(frame(MessageType::ServerSync, &msg)).is_ok());
    }

    fn channel(id: u32, parent: Option<u32>, name: &str) -> Frame {
        frame(
            MessageType::ChannelState,
            &msgs::ChannelState {
                channel_id: Some(id),
                parent,
                name: Some(name.to_string()),
                ..Default::default()
            },
        )
    }

    #[test]
    fn server_sync_marks_connected_and_fires_connect() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_hook = seen.clone();
        let mut config = Config::new();
        config.attach(Listener {
            connect: Some(Box::new(move |e: &ConnectEvent| {
                seen_hook
                    .lock()
                    .unwrap()
                    .push((e.welcome_message.clone(), e.client.self_session()));
            })),
            ..Default::default()
        });
        let mut h = harness(config);
        assert!(!h.client.is_connected());

        sync(&mut h, 42, None);

        assert!(h.client.is_connected());
        assert!(matches!(h.ready_rx.try_recv(), Ok(Ok(()))));
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            &[(Some("hi".to_string()), Some(42))]
        );
    }

    #[test]
    fn auto_bitrate_applies_server_bandwidth_on_connect() {
        let mut config = Config::new();
        config.attach(AutoBitrate);
        let mut h = harness(config);
        assert_eq!(h.client.audio_data_bytes(), 40);
        sync(&mut h, 1, Some(72_000));
        assert_eq!(h.client.audio_data_bytes(), 43);
        assert_eq!(h.client.audio_bitrate(), 43 * 8 * 100);
    }

    #[test]
    fn reject_before_sync_fails_dial() {
        let mut h = harness(Config::new());
        let msg = msgs::Reject {
            r#type: Some(4),
            reason: Some("Wrong server password".to_string()),
        };
        let ending = h.io.handle_frame(frame(MessageType::Reject, &msg)).unwrap_err();
        match ending {
            Ending::Failed(ClientError::Rejected { kind, reason }) => {
                assert_eq!(kind, msgs::RejectType::WrongServerPassword);
                assert_eq!(reason, "Wrong server password");
            }
            _ => panic!("expected rejection"),
        }
    }

    #[test]
    fn channel_state_builds_findable_tree() {
        let mut h = harness(Config::new());
        for f in [channel(0, None, "Root"), channel(1, Some(0), "Team"), channel(2, Some(1), "Voice")] {
            h.io.handle_frame(f).ok().unwrap();
        }
        let tree = h.client.channels();
        assert_eq!(tree.find(&["Team", "Voice"]).map(|c| c.id), Some(2));

        h.io
            .handle_frame(frame(MessageType::ChannelRemove, &msgs::ChannelRemove { channel_id: 2 }))
            .ok()
            .unwrap();
        assert!(h.client.channels().find(&["Team", "Voice"]).is_none());
    }

    #[test]
    fn move_self_requires_session_and_queues_user_state() {
        let mut h = harness(Config::new());
        assert!(matches!(h.client.move_self(3), Err(ClientError::NotConnected)));

        sync(&mut h, 7, None);
        h.client.move_self(3).unwrap();

        let Ok(Outgoing::Frame(bytes)) = h.control_rx.try_recv() else {
            panic!("expected queued frame");
        };
        let mut dec = FrameDecoder::new();
        dec.extend(&bytes);
        let f = dec.next_frame().unwrap().unwrap();
        assert_eq!(f.message_type().unwrap(), MessageType::UserState);
        let msg: msgs::UserState = mumble_proto::decode_message(&f.payload).unwrap();
        assert_eq!(msg.session, Some(7));
        assert_eq!(msg.channel_id, Some(3));
    }

    #[test]
    fn failed_channel_lookup_queues_no_move() {
        let mut h = harness(Config::new());
        h.io.handle_frame(channel(0, None, "Root")).unwrap();
        h.io.handle_frame(channel(1, Some(0), "Team")).unwrap();
        sync(&mut h, 7, None);

        let target = h.client.channels().find(&["Team", "Music"]).map(|c| c.id);
        if let Some(id) = target {
            h.client.move_self(id).unwrap();
        }
        assert_eq!(target, None);
        assert!(h.control_rx.try_recv().is_err());
    }

    #[test]
    fn io_running_clears_when_the_io_thread_panics() {
        let h = harness(Config::new());
        assert!(h.client.is_io_running());
        let client = h.client.clone();
        let joined = std::thread::spawn(move || {
            let _running = RunningGuard(client);
            panic!("hook failure");
        })
        .join();
        assert!(joined.is_err());
        assert!(!h.client.is_io_running());
    }

    #[test]
    fn removal_of_self_is_a_kick_or_ban() {
        let mut h = harness(Config::new());
        sync(&mut h, 5, None);
        let kick = msgs::UserRemove {
            session: 5,
            actor: Some(1),
            reason: Some("bye".to_string()),
            ban: Some(true),
        };
        match h.io.handle_frame(frame(MessageType::UserRemove, &kick)).unwrap_err() {
            Ending::Disconnect(DisconnectType::Banned, Some(reason)) => assert_eq!(reason, "bye"),
            _ => panic!("expected ban"),
        }
    }

    #[test]
    fn other_user_removal_fires_user_change() {
        let changes = Arc::new(Mutex::new(Vec::new()));
        let changes_hook = changes.clone();
        let mut config = Config::new();
        config.attach(Listener {
            user_change: Some(Box::new(move |e: &UserChangeEvent| {
                changes_hook.lock().unwrap().push((e.user.session, e.change));
            })),
            ..Default::default()
        });
        let mut h = harness(config);
        sync(&mut h, 1, None);
        let state = msgs::UserState {
            session: Some(9),
            name: Some("bob".to_string()),
            ..Default::default()
        };
        h.io.handle_frame(frame(MessageType::UserState, &state)).ok().unwrap();
        let remove = msgs::UserRemove {
            session: 9,
            actor: None,
            reason: None,
            ban: None,
        };
        h.io.handle_frame(frame(MessageType::UserRemove, &remove)).ok().unwrap();

        assert_eq!(
            changes.lock().unwrap().as_slice(),
            &[(9, UserChange::Connected), (9, UserChange::Disconnected)]
        );
        assert!(h.client.users().is_empty());
    }

    struct Collect(Mutex<Vec<AudioPacket>>);

    impl AudioListener for Collect {
        fn on_audio_packet(&self, packet: &AudioPacket) {
            self.0.lock().unwrap().push(packet.clone());
        }
    }

    #[test]
    fn voice_frames_reach_audio_listeners() {
        let mut h = harness(Config::new());
        let sink = Arc::new(Collect(Mutex::new(Vec::new())));
        h.client.attach_audio(sink.clone());

        let client_packet = voice::encode_client_voice(0, 11, &[1, 2, 3], false).unwrap();
        let mut payload = vec![client_packet[0]];
        voice::write_varint(&mut payload, 4);
        payload.extend_from_slice(&client_packet[1..]);
        h.io
            .handle_frame(Frame {
                kind: MessageType::UdpTunnel as u16,
                payload,
            })
            .ok()
            .unwrap();

        let got = sink.0.lock().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].session, 4);
        assert_eq!(got[0].sequence, 11);
        assert_eq!(got[0].opus, vec![1, 2, 3]);
    }

    #[test]
    fn send_audio_needs_connection_and_numbers_frames() {
        let mut h = harness(Config::new());
        assert!(matches!(h.client.send_audio(&[0xaa], false), Err(ClientError::NotConnected)));
        sync(&mut h, 2, None);
        h.client.send_audio(&[0xaa], false).unwrap();
        h.client.send_audio(&[0xbb], true).unwrap();

        let first = h.audio_rx.try_recv().unwrap();
        let second = h.audio_rx.try_recv().unwrap();
        // header (6) + voice header byte + sequence varint
        assert_eq!(first[6], voice::CODEC_OPUS << 5);
        assert_eq!(first[7], 0);
        assert_eq!(second[7], 1);
    }

    #[test]
    fn unknown_message_types_are_skipped() {
        let mut h = harness(Config::new());
        let f = Frame {
            kind: 26,
            payload: vec![0xff],
        };
        assert!(h.io.handle_frame(f).is_ok());
    }

    #[test]
    fn ping_stats_track_mean_and_variance() {
        let mut stats = PingStats::default();
        assert_eq!(stats.mean(), None);
        stats.record(10.0);
        assert_eq!(stats.variance(), None);
        stats.record(20.0);
        assert_eq!(stats.mean(), Some(15.0));
        assert_eq!(stats.variance(), Some(50.0));
    }

    #[test]
    fn display_addr_brackets_ipv6() {
        assert_eq!(display_addr("::1", 64738), "[::1]:64738");
        assert_eq!(display_addr("example.org", 1), "example.org:1");
    }

    #[test]
    fn server_name_accepts_ip_and_dns() {
        assert!(matches!(server_name_for("127.0.0.1"), Ok(ServerName::IpAddress(_))));
        assert!(matches!(server_name_for("voice.example.org"), Ok(ServerName::DnsName(_))));
    }
}
