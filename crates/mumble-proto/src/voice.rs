//! Legacy voice packets carried inside `UDPTunnel` frames.
//!
//! Layout (all integers are Mumble varints, see [`write_varint`]):
//! - header: u8, `codec << 5 | target`
//! - session: varint (server → client only)
//! - sequence: varint
//! - Opus header: varint, `len | TERMINATOR` on the last frame of a transmission
//! - Opus data: `len` bytes
//! - optional positional data, ignored here

use std::io;

/// Codec id for Opus in the packet header.
pub const CODEC_OPUS: u8 = 4;
/// Codec id for voice pings (UDP connectivity checks; never sent over TCP by this client).
pub const CODEC_PING: u8 = 1;

/// Voice target for normal talking into the current channel.
pub const TARGET_NORMAL: u8 = 0;

/// Set in the Opus length header on the last frame of a transmission.
pub const OPUS_TERMINATOR: u64 = 0x2000;
/// Largest Opus payload a length header can carry.
pub const OPUS_MAX_LEN: usize = 0x1fff;

/// Append `value` as a Mumble varint.
pub fn write_varint(out: &mut Vec<u8>, value: u64) {
    if value < 0x80 {
        out.push(value as u8);
    } else if value < 0x4000 {
        out.push(((value >> 8) as u8) | 0x80);
        out.push(value as u8);
    } else if value < 0x20_0000 {
        out.push(((value >> 16) as u8) | 0xc0);
        out.push((value >> 8) as u8);
        out.push(value as u8);
    } else if value < 0x1000_0000 {
        out.push(((value >> 24) as u8) | 0xe0);
        out.push((value >> 16) as u8);
        out.push((value >> 8) as u8);
        out.push(value as u8);
    } else if value < 0x1_0000_0000 {
        out.push(0xf0);
        out.extend_from_slice(&(value as u32).to_be_bytes());
    } else {
        out.push(0xf4);
        out.extend_from_slice(&value.to_be_bytes());
    }
}

/// Read one Mumble varint from the front of `input`, advancing it.
///
/// Negative encodings (`0xf8`, `0xfc` prefixes) never appear in the fields this client
/// reads and are rejected.
pub fn read_varint(input: &mut &[u8]) -> io::Result<u64> {
    let first = take(input, 1)?[0];
    let value = if first & 0x80 == 0x00 {
        u64::from(first & 0x7f)
    } else if first & 0xc0 == 0x80 {
        let rest = take(input, 1)?;
        (u64::from(first & 0x3f) << 8) | u64::from(rest[0])
    } else if first & 0xf0 == 0xf0 {
        match first & 0xfc {
            0xf0 => {
                let rest = take(input, 4)?;
                u64::from(u32::from_be_bytes([rest[0], rest[1], rest[2], rest[3]]))
            }
            0xf4 => {
                let rest = take(input, 8)?;
                let mut b = [0u8; 8];
                b.copy_from_slice(rest);
                u64::from_be_bytes(b)
            }
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "negative varint not supported",
                ));
            }
        }
    } else if first & 0xf0 == 0xe0 {
        let rest = take(input, 3)?;
        (u64::from(first & 0x0f) << 24)
            | (u64::from(rest[0]) << 16)
            | (u64::from(rest[1]) << 8)
            | u64::from(rest[2])
    } else {
        // 110xxxxx
        let rest = take(input, 2)?;
        (u64::from(first & 0x1f) << 16) | (u64::from(rest[0]) << 8) | u64::from(rest[1])
    };
    Ok(value)
}

fn take<'a>(input: &mut &'a [u8], n: usize) -> io::Result<&'a [u8]> {
    if input.len() < n {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "truncated voice packet"));
    }
    let (head, tail) = input.split_at(n);
    *input = tail;
    Ok(head)
}

/// Build an outgoing (client → server) Opus voice packet.
pub fn encode_client_voice(target: u8, sequence: u64, opus: &[u8], last: bool) -> io::Result<Vec<u8>> {
    if opus.len() > OPUS_MAX_LEN {
        return Err(io::Error::new(io::ErrorKind::InvalidInput, "opus frame too large"));
    }
    let mut out = Vec::with_capacity(1 + 9 + 2 + opus.len());
    out.push((CODEC_OPUS << 5) | (target & 0x1f));
    write_varint(&mut out, sequence);
    let mut header = opus.len() as u64;
    if last {
        header |= OPUS_TERMINATOR;
    }
    write_varint(&mut out, header);
    out.extend_from_slice(opus);
    Ok(out)
}

/// An incoming (server → client) Opus voice packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerVoice {
    pub target: u8,
    /// Session id of the speaking user.
    pub session: u32,
    pub sequence: u64,
    pub opus: Vec<u8>,
    /// True when the speaker stopped transmitting after this frame.
    pub last: bool,
}

/// Parse an incoming voice packet.
///
/// Non-Opus codecs yield `Unsupported` so the caller can drop them quietly.
pub fn decode_server_voice(payload: &[u8]) -> io::Result<ServerVoice> {
    let mut input = payload;
    let header = take(&mut input, 1)?[0];
    let codec = header >> 5;
    if codec != CODEC_OPUS {
        return Err(io::Error::new(
            io::ErrorKind::Unsupported,
            format!("unsupported voice codec {codec}"),
        ));
    }
    let session = read_varint(&mut input)?;
    let session = u32::try_from(session)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "session id out of range"))?;
    let sequence = read_varint(&mut input)?;
    let opus_header = read_varint(&mut input)?;
    let len = (opus_header & OPUS_MAX_LEN as u64) as usize;
    let opus = take(&mut input, len)?.to_vec();
    Ok(ServerVoice {
        target: header & 0x1f,
        session,
        sequence,
        opus,
        last: opus_header & OPUS_TERMINATOR != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(value: u64) -> (usize, u64) {
        let mut buf = Vec::new();
        write_varint(&mut buf, value);
        let len = buf.len();
        let mut input = buf.as_slice();
        let back = read_varint(&mut input).unwrap();
        assert!(input.is_empty());
        (len, back)
    }

    #[test]
    fn varint_size_classes() {
        let cases = [
            (0x00, 1),
            (0x7f, 1),
            (0x80, 2),
            (0x3fff, 2),
            (0x4000, 3),
            (0x1f_ffff, 3),
            (0x20_0000, 4),
            (0x0fff_ffff, 4),
            (0x1000_0000, 5),
            (0xffff_ffff, 5),
            (0x1_0000_0000, 9),
            (u64::MAX, 9),
        ];
        for (value, size) in cases {
            let (len, back) = roundtrip(value);
            assert_eq!(len, size, "size for {value:#x}");
            assert_eq!(back, value);
        }
    }

    #[test]
    fn varint_known_encodings() {
        let mut buf = Vec::new();
        write_varint(&mut buf, 0x2000 | 40);
        assert_eq!(buf, vec![0xa0, 0x28]);
    }

    #[test]
    fn varint_rejects_negative_and_truncated() {
        let mut neg: &[u8] = &[0xfc];
        assert_eq!(read_varint(&mut neg).unwrap_err().kind(), io::ErrorKind::InvalidData);
        let mut short: &[u8] = &[0xf0, 0x01];
        assert_eq!(read_varint(&mut short).unwrap_err().kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn client_packet_parses_as_server_packet_with_session() {
        let opus = vec![0xde, 0xad, 0xbe, 0xef];
        let client = encode_client_voice(TARGET_NORMAL, 300, &opus, true).unwrap();
        assert_eq!(client[0], 0x80);

        let mut server = vec![client[0]];
        write_varint(&mut server, 17);
        server.extend_from_slice(&client[1..]);
        // trailing positional data is ignored
        server.extend_from_slice(&[0u8; 12]);

        let voice = decode_server_voice(&server).unwrap();
        assert_eq!(voice.session, 17);
        assert_eq!(voice.sequence, 300);
        assert_eq!(voice.opus, opus);
        assert!(voice.last);
        assert_eq!(voice.target, TARGET_NORMAL);
    }

    #[test]
    fn server_voice_rejects_other_codecs() {
        let err = decode_server_voice(&[CODEC_PING << 5, 0x01]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }

    #[test]
    fn client_voice_rejects_oversized_frame() {
        let big = vec![0u8; OPUS_MAX_LEN + 1];
        assert!(encode_client_voice(TARGET_NORMAL, 0, &big, false).is_err());
    }
}
