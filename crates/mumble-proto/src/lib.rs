//! Wire primitives for the Mumble control channel.
//!
//! Every control message travels over the TLS stream as a frame:
//! - type: u16 BE (see [`MessageType`])
//! - len:  u32 BE
//! - payload: protobuf-encoded message ([`msgs`]), or a raw voice packet for
//!   [`MessageType::UdpTunnel`] ([`voice`])
//!
//! Reads on the client happen with a socket timeout, so frames are reassembled with
//! [`FrameDecoder`] instead of blocking `read_exact` calls.

pub mod msgs;
pub mod voice;

use std::io::{self, Read, Write};

/// Port used when a server URL does not name one.
pub const DEFAULT_PORT: u16 = 64738;

/// Upper bound on a single frame payload. Larger frames are treated as corrupt.
pub const MAX_FRAME_LEN: usize = 8 * 1024 * 1024;

/// Size of the `type + len` frame header.
pub const HEADER_LEN: usize = 2 + 4;

/// Protocol version advertised by this client (legacy voice packets, tunnelled over TCP).
pub const CLIENT_VERSION: (u16, u8, u8) = (1, 4, 0);

#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Version = 0,
    UdpTunnel = 1,
    Authenticate = 2,
    Ping = 3,
    Reject = 4,
    ServerSync = 5,
    ChannelRemove = 6,
    ChannelState = 7,
    UserRemove = 8,
    UserState = 9,
    BanList = 10,
    TextMessage = 11,
    PermissionDenied = 12,
    Acl = 13,
    QueryUsers = 14,
    CryptSetup = 15,
    ContextActionModify = 16,
    ContextAction = 17,
    UserList = 18,
    VoiceTarget = 19,
    PermissionQuery = 20,
    CodecVersion = 21,
    UserStats = 22,
    RequestBlob = 23,
    ServerConfig = 24,
    SuggestConfig = 25,
}

impl MessageType {
    pub fn from_u16(v: u16) -> io::Result<Self> {
        let t = match v {
            0 => MessageType::Version,
            1 => MessageType::UdpTunnel,
            2 => MessageType::Authenticate,
            3 => MessageType::Ping,
            4 => MessageType::Reject,
            5 => MessageType::ServerSync,
            6 => MessageType::ChannelRemove,
            7 => MessageType::ChannelState,
            8 => MessageType::UserRemove,
            9 => MessageType::UserState,
            10 => MessageType::BanList,
            11 => MessageType::TextMessage,
            12 => MessageType::PermissionDenied,
            13 => MessageType::Acl,
            14 => MessageType::QueryUsers,
            15 => MessageType::CryptSetup,
            16 => MessageType::ContextActionModify,
            17 => MessageType::ContextAction,
            18 => MessageType::UserList,
            19 => MessageType::VoiceTarget,
            20 => MessageType::PermissionQuery,
            21 => MessageType::CodecVersion,
            22 => MessageType::UserStats,
            23 => MessageType::RequestBlob,
            24 => MessageType::ServerConfig,
            25 => MessageType::SuggestConfig,
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown message type {v}"),
                ));
            }
        };
        Ok(t)
    }
}

/// One decoded control frame. The payload is still encoded.
///
/// `kind` is kept raw so that message types newer than [`MessageType`] can be skipped by the
/// caller instead of tearing down the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: u16,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn message_type(&self) -> io::Result<MessageType> {
        MessageType::from_u16(self.kind)
    }
}

/// Pack a `(major, minor, patch)` triple into the legacy 32-bit version field.
pub fn encode_version(major: u16, minor: u8, patch: u8) -> u32 {
    (u32::from(major) << 16) | (u32::from(minor) << 8) | u32::from(patch)
}

/// Split a legacy 32-bit version field into `(major, minor, patch)`.
pub fn decode_version(v: u32) -> (u16, u8, u8) {
    ((v >> 16) as u16, ((v >> 8) & 0xff) as u8, (v & 0xff) as u8)
}

/// Encode a frame into a single buffer (header + payload).
pub fn encode_frame(kind: MessageType, payload: &[u8]) -> io::Result<Vec<u8>> {
    if payload.len() > MAX_FRAME_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "payload too large"));
    }
    let len = payload.len() as u32;

    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    out.extend_from_slice(&(kind as u16).to_be_bytes());
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Write a frame header + payload.
pub fn write_frame(mut w: impl Write, kind: MessageType, payload: &[u8]) -> io::Result<()> {
    let frame = encode_frame(kind, payload)?;
    w.write_all(&frame)?;
    Ok(())
}

/// Encode a protobuf message and wrap it in a frame.
pub fn encode_message<M: prost::Message>(kind: MessageType, msg: &M) -> io::Result<Vec<u8>> {
    encode_frame(kind, &msg.encode_to_vec())
}

/// Decode a protobuf payload, mapping decode failures to `InvalidData`.
pub fn decode_message<M: prost::Message + Default>(payload: &[u8]) -> io::Result<M> {
    M::decode(payload).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Incremental frame reassembly.
///
/// Bytes are appended with [`FrameDecoder::read_from`] (or [`FrameDecoder::extend`]) and complete
/// frames are taken out with [`FrameDecoder::next_frame`]. A frame split across any number of
/// reads is returned once all of its bytes have arrived.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append raw bytes received from the peer.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Perform one `read` into the internal buffer.
    ///
    /// Returns the number of bytes read; `Ok(0)` means the peer closed the stream.
    /// Timeouts are passed through unchanged so the caller can tell them apart.
    pub fn read_from(&mut self, mut r: impl Read) -> io::Result<usize> {
        let mut chunk = [0u8; 16 * 1024];
        let n = r.read(&mut chunk)?;
        self.buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    /// Bytes buffered but not yet returned as a frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Take the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> io::Result<Option<Frame>> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let kind = u16::from_be_bytes([self.buf[0], self.buf[1]]);
        let len = u32::from_be_bytes([self.buf[2], self.buf[3], self.buf[4], self.buf[5]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame too large ({len} bytes)"),
            ));
        }
        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }
        let payload = self.buf[HEADER_LEN..HEADER_LEN + len].to_vec();
        self.buf.drain(..HEADER_LEN + len);
        Ok(Some(Frame { kind, payload }))
    }
}
