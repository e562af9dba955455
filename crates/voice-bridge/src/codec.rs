//! Opus encode/decode for the 48 kHz mono voice path.

use anyhow::{Context, Result};
use audiopus::coder::{Decoder, Encoder};
use audiopus::{Application, Bitrate, Channels, SampleRate};
use mumble_proto::voice::OPUS_MAX_LEN;

/// Samples per 10 ms frame at 48 kHz.
pub const FRAME_SAMPLES: usize = 480;
/// Longest Opus packet duration (120 ms) in samples.
pub const MAX_PACKET_SAMPLES: usize = 5_760;

const MIN_BITRATE: u32 = 6_000;
const MAX_BITRATE: u32 = 510_000;
/// Smallest payload budget worth encoding into.
const MIN_PACKET_BYTES: usize = 8;

/// Opus bitrate for a per-packet byte budget sent every `frame_ms` milliseconds.
pub fn bitrate_for(packet_bytes: usize, frame_ms: u32) -> u32 {
    let per_second = 1_000 / frame_ms.max(1);
    (packet_bytes as u32)
        .saturating_mul(8)
        .saturating_mul(per_second)
        .clamp(MIN_BITRATE, MAX_BITRATE)
}

/// Mono VOIP encoder that keeps each packet within a byte budget.
pub struct VoiceEncoder {
    inner: Encoder,
    packet_bytes: usize,
    frame_ms: u32,
    out: Vec<u8>,
}

impl VoiceEncoder {
    pub fn new(packet_bytes: usize, frame_ms: u32) -> Result<Self> {
        let inner = Encoder::new(SampleRate::Hz48000, Channels::Mono, Application::Voip)
            .context("Creating Opus encoder")?;
        let mut encoder = Self {
            inner,
            packet_bytes: 0,
            frame_ms,
            out: vec![0; OPUS_MAX_LEN],
        };
        encoder.set_packet_bytes(packet_bytes)?;
        Ok(encoder)
    }

    pub fn packet_bytes(&self) -> usize {
        self.packet_bytes
    }

    /// Change the payload budget; updates the encoder bitrate to match.
    pub fn set_packet_bytes(&mut self, bytes: usize) -> Result<()> {
        let bytes = bytes.clamp(MIN_PACKET_BYTES, OPUS_MAX_LEN);
        if bytes == self.packet_bytes {
            return Ok(());
        }
        let bitrate = bitrate_for(bytes, self.frame_ms);
        self.inner
            .set_bitrate(Bitrate::BitsPerSecond(bitrate as i32))
            .context("Setting Opus bitrate")?;
        tracing::debug!(packet_bytes = bytes, bitrate, "encoder budget");
        self.packet_bytes = bytes;
        Ok(())
    }

    /// Encode one frame of 48 kHz mono samples.
    pub fn encode(&mut self, pcm: &[f32]) -> Result<&[u8]> {
        let budget = self.packet_bytes;
        let len = self
            .inner
            .encode_float(pcm, &mut self.out[..budget])
            .context("Opus encode")?;
        Ok(&self.out[..len])
    }
}

/// Mono decoder for one speaker.
pub struct VoiceDecoder {
    inner: Decoder,
    buf: Vec<f32>,
}

impl VoiceDecoder {
    pub fn new() -> Result<Self> {
        let inner = Decoder::new(SampleRate::Hz48000, Channels::Mono).context("Creating Opus decoder")?;
        Ok(Self {
            inner,
            buf: vec![0.0; MAX_PACKET_SAMPLES],
        })
    }

    /// Decode one packet into 48 kHz mono samples.
    pub fn decode(&mut self, packet: &[u8]) -> Result<&[f32]> {
        let n = self
            .inner
            .decode_float(Some(packet), &mut self.buf[..], false)
            .context("Opus decode")?;
        Ok(&self.buf[..n])
    }

    /// Synthesize `samples` of concealment audio for lost packets.
    pub fn conceal(&mut self, samples: usize) -> Result<&[f32]> {
        let samples = samples.min(MAX_PACKET_SAMPLES);
        let n = self
            .inner
            .decode_float(None::<&[u8]>, &mut self.buf[..samples], false)
            .context("Opus concealment")?;
        Ok(&self.buf[..n])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tone(len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (i as f32 * 2.0 * std::f32::consts::PI * 440.0 / 48_000.0).sin() * 0.3)
            .collect()
    }

    #[test]
    fn bitrate_follows_packet_budget() {
        assert_eq!(bitrate_for(40, 10), 32_000);
        assert_eq!(bitrate_for(43, 10), 34_400);
        assert_eq!(bitrate_for(1, 10), MIN_BITRATE);
        assert_eq!(bitrate_for(8_000, 10), MAX_BITRATE);
    }

    #[test]
    fn encoded_frames_respect_budget_and_decode_to_one_frame() {
        let mut enc = VoiceEncoder::new(40, 10).unwrap();
        let mut dec = VoiceDecoder::new().unwrap();
        let pcm = tone(FRAME_SAMPLES);
        for _ in 0..5 {
            let packet = enc.encode(&pcm).unwrap().to_vec();
            assert!(!packet.is_empty());
            assert!(packet.len() <= 40);
            assert_eq!(dec.decode(&packet).unwrap().len(), FRAME_SAMPLES);
        }
    }

    #[test]
    fn budget_is_clamped() {
        let mut enc = VoiceEncoder::new(1, 10).unwrap();
        assert_eq!(enc.packet_bytes(), MIN_PACKET_BYTES);
        enc.set_packet_bytes(100_000).unwrap();
        assert_eq!(enc.packet_bytes(), OPUS_MAX_LEN);
    }

    #[test]
    fn concealment_fills_requested_length() {
        let mut enc = VoiceEncoder::new(60, 10).unwrap();
        let mut dec = VoiceDecoder::new().unwrap();
        let packet = enc.encode(&tone(FRAME_SAMPLES)).unwrap().to_vec();
        dec.decode(&packet).unwrap();
        assert_eq!(dec.conceal(FRAME_SAMPLES).unwrap().len(), FRAME_SAMPLES);
    }
}
