//! Receive side: per-speaker decode, jitter buffering, and mixing at 48 kHz.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};
use mumble_client::{AudioListener, AudioPacket};

use crate::codec::{FRAME_SAMPLES, VoiceDecoder};
use crate::queue::SharedAudio;

/// Audio held back per speaker before playback starts.
pub const JITTER_PREFILL_MS: u32 = 30;
/// Per-speaker backlog cap; older audio is dropped past this.
const MAX_BACKLOG_MS: u32 = 250;
/// Speakers silent this long are forgotten (decoder state included).
const IDLE_FRAMES: u32 = 100;
/// Largest sequence gap filled with concealment instead of skipped.
const MAX_CONCEAL_FRAMES: u64 = 5;
const INBOX_PACKETS: usize = 512;

fn samples_ms(ms: u32) -> usize {
    ms as usize * FRAME_SAMPLES / 10
}

#[derive(Debug)]
struct Speaker {
    pcm: VecDeque<f32>,
    primed: bool,
    ended: bool,
    idle_frames: u32,
}

impl Speaker {
    fn new() -> Self {
        Self {
            pcm: VecDeque::new(),
            primed: false,
            ended: false,
            idle_frames: 0,
        }
    }
}

/// Sums every active speaker into fixed-size output frames.
#[derive(Debug)]
pub struct Mixer {
    speakers: BTreeMap<u32, Speaker>,
    prefill: usize,
    max_backlog: usize,
}

impl Mixer {
    pub fn new(prefill_ms: u32) -> Self {
        let prefill = samples_ms(prefill_ms);
        Self {
            speakers: BTreeMap::new(),
            prefill,
            max_backlog: samples_ms(MAX_BACKLOG_MS).max(prefill + FRAME_SAMPLES),
        }
    }

    pub fn active_speakers(&self) -> usize {
        self.speakers.len()
    }

    /// Queue decoded audio for `session`. `last` marks the end of a transmission, which
    /// releases the buffered tail without waiting for the prefill.
    pub fn push_pcm(&mut self, session: u32, pcm: &[f32], last: bool) {
        let speaker = self.speakers.entry(session).or_insert_with(Speaker::new);
        speaker.pcm.extend(pcm);
        speaker.idle_frames = 0;
        if speaker.pcm.len() > self.max_backlog {
            let excess = speaker.pcm.len() - self.max_backlog;
            speaker.pcm.drain(..excess);
            tracing::trace!(session, dropped = excess, "speaker backlog trimmed");
        }
        if last {
            speaker.ended = true;
            speaker.primed = true;
        } else {
            speaker.ended = false;
            if speaker.pcm.len() >= self.prefill {
                speaker.primed = true;
            }
        }
    }

    /// Mix one frame into `out` (overwritten), clamped to [-1, 1].
    ///
    /// Returns the sessions that went idle and were dropped.
    pub fn mix_into(&mut self, out: &mut [f32]) -> Vec<u32> {
        out.fill(0.0);
        let mut gone = Vec::new();
        for (&session, speaker) in self.speakers.iter_mut() {
            if !speaker.primed {
                speaker.idle_frames += 1;
                if speaker.idle_frames >= IDLE_FRAMES {
                    gone.push(session);
                }
                continue;
            }
            let take = out.len().min(speaker.pcm.len());
            for (dst, src) in out.iter_mut().zip(speaker.pcm.drain(..take)) {
                *dst += src;
            }
            if speaker.pcm.is_empty() {
                speaker.primed = false;
                if speaker.ended {
                    gone.push(session);
                }
            }
        }
        for session in &gone {
            self.speakers.remove(session);
        }
        for s in out.iter_mut() {
            *s = s.clamp(-1.0, 1.0);
        }
        gone
    }
}

/// Decoder state per speaker, with gap concealment driven by the packet sequence.
struct Decoders {
    by_session: BTreeMap<u32, (VoiceDecoder, Option<u64>)>,
}

impl Decoders {
    fn new() -> Self {
        Self {
            by_session: BTreeMap::new(),
        }
    }

    fn forget(&mut self, session: u32) {
        self.by_session.remove(&session);
    }

    fn decode_into(&mut self, packet: &AudioPacket, mixer: &mut Mixer) -> Result<()> {
        let (decoder, expected) = match self.by_session.entry(packet.session) {
            Entry::Occupied(e) => e.into_mut(),
            Entry::Vacant(e) => e.insert((VoiceDecoder::new()?, None)),
        };

        if let Some(next) = *expected {
            let gap = packet.sequence.saturating_sub(next);
            if gap > 0 && gap <= MAX_CONCEAL_FRAMES {
                let concealed = decoder.conceal(gap as usize * FRAME_SAMPLES)?;
                mixer.push_pcm(packet.session, concealed, false);
            }
        }

        if packet.opus.is_empty() {
            mixer.push_pcm(packet.session, &[], packet.last);
            *expected = None;
            return Ok(());
        }
        let pcm = decoder.decode(&packet.opus)?;
        let frames = (pcm.len() / FRAME_SAMPLES).max(1) as u64;
        mixer.push_pcm(packet.session, pcm, packet.last);
        // Sequence numbers come from the peer and may sit at the top of the range.
        *expected = (!packet.last).then_some(packet.sequence.wrapping_add(frames));
        Ok(())
    }
}

/// [`AudioListener`] that hands packets to the mixer thread without blocking the I/O thread.
pub struct Inbox {
    tx: Sender<AudioPacket>,
}

impl AudioListener for Inbox {
    fn on_audio_packet(&self, packet: &AudioPacket) {
        match self.tx.try_send(packet.clone()) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(_)) => {
                tracing::trace!(session = packet.session, "voice inbox full; packet dropped");
            }
        }
    }
}

pub fn inbox() -> (Arc<Inbox>, Receiver<AudioPacket>) {
    let (tx, rx) = crossbeam_channel::bounded(INBOX_PACKETS);
    (Arc::new(Inbox { tx }), rx)
}

/// Spawn the mixer thread: decode incoming packets, mix 10 ms frames, push into `outq`.
///
/// Pushing blocks while `outq` is full, so playback paces the loop. Stops when `outq` closes.
pub fn start_mixer(
    packets: Receiver<AudioPacket>,
    outq: Arc<SharedAudio>,
    prefill_ms: u32,
) -> Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("voice-mix".to_string())
        .spawn(move || {
            let mut mixer = Mixer::new(prefill_ms);
            let mut decoders = Decoders::new();
            let mut frame = vec![0.0f32; FRAME_SAMPLES];
            loop {
                loop {
                    match packets.try_recv() {
                        Ok(packet) => {
                            if let Err(e) = decoders.decode_into(&packet, &mut mixer) {
                                tracing::debug!(session = packet.session, "voice decode failed: {e:#}");
                            }
                        }
                        // A dropped client keeps the mixer emitting silence until `outq` closes.
                        Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
                    }
                }
                for session in mixer.mix_into(&mut frame) {
                    decoders.forget(session);
                }
                if !outq.push_blocking(&frame) {
                    tracing::debug!("mixer stopped");
                    return;
                }
            }
        })
        .context("Spawning mixer thread")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn frame() -> Vec<f32> {
        vec![0.0; FRAME_SAMPLES]
    }

    #[test]
    fn speaker_waits_for_prefill() {
        let mut mixer = Mixer::new(20);
        mixer.push_pcm(1, &vec![0.5; FRAME_SAMPLES], false);
        let mut out = frame();
        mixer.mix_into(&mut out);
        assert!(out.iter().all(|&s| s == 0.0));

        mixer.push_pcm(1, &vec![0.5; FRAME_SAMPLES], false);
        mixer.mix_into(&mut out);
        assert!(out.iter().all(|&s| s == 0.5));
    }

    #[test]
    fn concurrent_speakers_are_summed_and_clamped() {
        let mut mixer = Mixer::new(10);
        mixer.push_pcm(1, &vec![0.25; FRAME_SAMPLES], false);
        mixer.push_pcm(2, &vec![0.5; FRAME_SAMPLES], false);
        let mut out = frame();
        mixer.mix_into(&mut out);
        assert!(out.iter().all(|&s| (s - 0.75).abs() < 1e-6));

        mixer.push_pcm(1, &vec![0.8; FRAME_SAMPLES], false);
        mixer.push_pcm(2, &vec![0.9; FRAME_SAMPLES], false);
        mixer.push_pcm(3, &vec![-0.2; FRAME_SAMPLES], false);
        mixer.mix_into(&mut out);
        assert!(out.iter().all(|&s| s == 1.0));
    }

    #[test]
    fn sequence_at_top_of_range_wraps() {
        let mut encoder = crate::codec::VoiceEncoder::new(40, 10).unwrap();
        let opus = encoder.encode(&frame()).unwrap().to_vec();
        let mut decoders = Decoders::new();
        let mut mixer = Mixer::new(10);

        let packet = AudioPacket {
            session: 9,
            sequence: u64::MAX,
            opus,
            last: false,
        };
        decoders.decode_into(&packet, &mut mixer).unwrap();
        assert_eq!(decoders.by_session[&9].1, Some(0));

        let next = AudioPacket {
            sequence: 0,
            ..packet
        };
        decoders.decode_into(&next, &mut mixer).unwrap();
        assert_eq!(decoders.by_session[&9].1, Some(1));
        assert_eq!(mixer.active_speakers(), 1);
    }

    #[test]
    fn negative_sum_clamps_to_minus_one() {
        let mut mixer = Mixer::new(10);
        mixer.push_pcm(1, &vec![-0.7; FRAME_SAMPLES], false);
        mixer.push_pcm(2, &vec![-0.7; FRAME_SAMPLES], false);
        let mut out = frame();
        mixer.mix_into(&mut out);
        assert!(out.iter().all(|&s| s == -1.0));
    }

    #[test]
    fn last_frame_flushes_tail_and_removes_speaker() {
        let mut mixer = Mixer::new(100);
        mixer.push_pcm(7, &vec![0.1; 100], true);
        let mut out = frame();
        let gone = mixer.mix_into(&mut out);
        assert_eq!(gone, vec![7]);
        assert_eq!(mixer.active_speakers(), 0);
        assert!(out[..100].iter().all(|&s| (s - 0.1).abs() < 1e-6));
        assert!(out[100..].iter().all(|&s| s == 0.0));
    }

    #[test]
    fn idle_speakers_are_forgotten() {
        let mut mixer = Mixer::new(100);
        mixer.push_pcm(3, &vec![0.1; 10], false);
        let mut out = frame();
        let mut gone = Vec::new();
        for _ in 0..IDLE_FRAMES {
            gone.extend(mixer.mix_into(&mut out));
        }
        assert_eq!(gone, vec![3]);
    }

    #[test]
    fn backlog_is_capped() {
        let mut mixer = Mixer::new(10);
        for _ in 0..100 {
            mixer.push_pcm(1, &vec![0.0; FRAME_SAMPLES], false);
        }
        assert!(mixer.speakers[&1].pcm.len() <= mixer.max_backlog);
    }

    #[test]
    fn inbox_drops_when_full_without_blocking() {
        let (inbox, rx) = inbox();
        let packet = AudioPacket {
            session: 1,
            sequence: 0,
            opus: vec![0],
            last: false,
        };
        for _ in 0..INBOX_PACKETS + 10 {
            inbox.on_audio_packet(&packet);
        }
        assert_eq!(rx.len(), INBOX_PACKETS);
    }

    #[test]
    fn mixer_thread_stops_when_output_closes() {
        let (_inbox, rx) = inbox();
        let outq = Arc::new(SharedAudio::new(1, FRAME_SAMPLES * 2));
        let handle = start_mixer(rx, outq.clone(), JITTER_PREFILL_MS).unwrap();
        assert!(outq.wait_for_any(Duration::from_secs(1)));
        outq.close();
        handle.join().unwrap();
    }
}
