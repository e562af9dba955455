//! Wiring: audio thread owning the CPAL streams, plus encoder, mixer and resampler workers.
//!
//! CPAL streams are not `Send`, so one dedicated thread opens them, starts them, reports the
//! negotiated rates back to [`setup`], and then parks until the bridge stops.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, anyhow};
use cpal::traits::StreamTrait;
use crossbeam_channel::{Receiver, Sender};
use mumble_client::Client;

use crate::capture::open_capture;
use crate::codec::{FRAME_SAMPLES, VoiceEncoder};
use crate::config::AudioConfig;
use crate::device::VOICE_RATE;
use crate::mixer::{self, JITTER_PREFILL_MS};
use crate::playback::open_playback;
use crate::queue::{PopStrategy, SharedAudio, samples_for_ms};
use crate::resample::start_resampler;

/// Queue between the capture resampler and the encoder.
const ENCODE_QUEUE_MS: u32 = 200;

/// Running audio bridge. Dropping it (or calling [`AudioBridge::shutdown`]) stops capture,
/// sends the end-of-transmission frame, and closes the devices.
pub struct AudioBridge {
    stop_tx: Option<Sender<()>>,
    audio_thread: Option<JoinHandle<()>>,
    capture_queues: Vec<Arc<SharedAudio>>,
    playback_queues: Vec<Arc<SharedAudio>>,
    encoder: Option<JoinHandle<()>>,
    workers: Vec<JoinHandle<()>>,
}

/// Queues handed back by the audio thread with their device rates.
struct Opened {
    capture: Option<(Arc<SharedAudio>, u32)>,
    playback: Option<(Arc<SharedAudio>, u32)>,
}

/// Start bridging `client` to the sound devices selected by `config`.
///
/// Returns once the requested streams are running, or with the first device error.
pub fn setup(client: &Client, config: AudioConfig) -> Result<AudioBridge> {
    let mut bridge = AudioBridge::idle();
    if config.mute && config.deafen {
        tracing::info!("muted and deafened; audio devices not opened");
        return Ok(bridge);
    }

    let (ready_tx, ready_rx) = crossbeam_channel::bounded(1);
    let (stop_tx, stop_rx) = crossbeam_channel::bounded(1);
    let thread_config = config.clone();
    let handle = thread::Builder::new()
        .name("voice-audio".to_string())
        .spawn(move || run_audio_thread(&thread_config, ready_tx, stop_rx))
        .context("Spawning audio thread")?;
    bridge.stop_tx = Some(stop_tx);
    bridge.audio_thread = Some(handle);

    let opened = ready_rx
        .recv()
        .map_err(|_| anyhow!("Audio thread exited during setup"))??;

    if let Some((capq, rate)) = opened.capture {
        bridge.capture_queues.push(capq.clone());
        let encq = if rate == VOICE_RATE {
            capq
        } else {
            let encq = Arc::new(SharedAudio::new(1, samples_for_ms(VOICE_RATE, 1, ENCODE_QUEUE_MS)));
            bridge.capture_queues.push(encq.clone());
            let chunk = (rate / 100).max(1) as usize;
            bridge
                .workers
                .push(start_resampler(capq, encq.clone(), rate, VOICE_RATE, chunk)?);
            encq
        };
        bridge.encoder = Some(start_encoder(client.clone(), encq)?);
    }

    if let Some((playq, rate)) = opened.playback {
        bridge.playback_queues.push(playq.clone());
        let mixq = if rate == VOICE_RATE {
            playq
        } else {
            let mixq = Arc::new(SharedAudio::new(1, samples_for_ms(VOICE_RATE, 1, config.buffer_ms)));
            bridge.playback_queues.push(mixq.clone());
            bridge
                .workers
                .push(start_resampler(mixq.clone(), playq, VOICE_RATE, rate, FRAME_SAMPLES)?);
            mixq
        };
        let (inbox, packets) = mixer::inbox();
        bridge
            .workers
            .push(mixer::start_mixer(packets, mixq, JITTER_PREFILL_MS)?);
        client.attach_audio(inbox);
    }

    tracing::info!(
        capture = bridge.is_capturing(),
        playback = bridge.is_playing(),
        "audio bridge running"
    );
    Ok(bridge)
}

fn run_audio_thread(config: &AudioConfig, ready_tx: Sender<Result<Opened>>, stop_rx: Receiver<()>) {
    match open_streams(config) {
        Ok((streams, opened)) => {
            if ready_tx.send(Ok(opened)).is_err() {
                return;
            }
            // Returns on stop or when the bridge is dropped.
            let _ = stop_rx.recv();
            drop(streams);
            tracing::debug!("audio streams closed");
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
        }
    }
}

fn open_streams(config: &AudioConfig) -> Result<(Vec<cpal::Stream>, Opened)> {
    let host = cpal::default_host();
    let mut streams = Vec::new();
    let mut opened = Opened {
        capture: None,
        playback: None,
    };

    if !config.mute {
        let capture = open_capture(&host, config.input_device.as_deref())
            .context("Opening input device")?;
        capture.stream.play().context("Starting input stream")?;
        opened.capture = Some((capture.queue, capture.rate));
        streams.push(capture.stream);
    }
    if !config.deafen {
        let playback = open_playback(&host, config.output_device.as_deref(), config.buffer_ms)
            .context("Opening output device")?;
        playback.stream.play().context("Starting output stream")?;
        opened.playback = Some((playback.queue, playback.rate));
        streams.push(playback.stream);
    }
    Ok((streams, opened))
}

fn start_encoder(client: Client, source: Arc<SharedAudio>) -> Result<JoinHandle<()>> {
    let frame_ms = u32::try_from(client.audio_interval().as_millis())
        .unwrap_or(10)
        .max(1);
    let encoder = VoiceEncoder::new(client.audio_data_bytes(), frame_ms)?;
    thread::Builder::new()
        .name("voice-encode".to_string())
        .spawn(move || {
            let sent = run_encoder(
                &source,
                encoder,
                frame_ms,
                || client.audio_data_bytes(),
                |packet, last| match client.send_audio(packet, last) {
                    Ok(()) => true,
                    Err(e) => {
                        tracing::debug!("voice send stopped: {e}");
                        false
                    }
                },
            );
            tracing::debug!(frames = sent, "encoder stopped");
        })
        .context("Spawning encoder thread")
}

/// Encode `source` in `frame_ms` frames until it closes or `send` refuses a packet.
///
/// After at least one frame went out, a silent frame flagged `last` ends the transmission.
/// Returns the number of frames sent, terminator excluded.
fn run_encoder(
    source: &SharedAudio,
    mut encoder: VoiceEncoder,
    frame_ms: u32,
    budget: impl Fn() -> usize,
    mut send: impl FnMut(&[u8], bool) -> bool,
) -> u64 {
    let frame_samples = FRAME_SAMPLES * frame_ms as usize / 10;
    let mut sent = 0u64;
    while let Some(pcm) = source.pop(PopStrategy::BlockingExact { frames: frame_samples }) {
        if let Err(e) = encoder.set_packet_bytes(budget()) {
            tracing::warn!("encoder budget: {e:#}");
        }
        let packet = match encoder.encode(&pcm) {
            Ok(p) => p,
            Err(e) => {
                tracing::debug!("voice encode failed: {e:#}");
                continue;
            }
        };
        if !send(packet, false) {
            return sent;
        }
        sent += 1;
    }

    if sent > 0 {
        let silence = vec![0.0f32; frame_samples];
        match encoder.encode(&silence) {
            Ok(packet) => {
                send(packet, true);
            }
            Err(e) => tracing::debug!("terminator encode failed: {e:#}"),
        }
    }
    sent
}

impl AudioBridge {
    fn idle() -> Self {
        Self {
            stop_tx: None,
            audio_thread: None,
            capture_queues: Vec::new(),
            playback_queues: Vec::new(),
            encoder: None,
            workers: Vec::new(),
        }
    }

    pub fn is_capturing(&self) -> bool {
        self.encoder.is_some()
    }

    pub fn is_playing(&self) -> bool {
        !self.playback_queues.is_empty()
    }

    /// Stop capture and playback and wait for the worker threads.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        for q in self.capture_queues.drain(..) {
            q.close();
        }
        if let Some(encoder) = self.encoder.take() {
            let _ = encoder.join();
        }
        if let Some(stop_tx) = self.stop_tx.take() {
            let _ = stop_tx.send(());
        }
        if let Some(handle) = self.audio_thread.take() {
            let _ = handle.join();
        }
        for q in self.playback_queues.drain(..) {
            q.close();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for AudioBridge {
    fn drop(&mut self) {
        self.stop();
    }
}
