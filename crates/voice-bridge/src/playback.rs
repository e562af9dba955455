//! Playback stage (CPAL output stream).
//!
//! The callback refills a local buffer from the mono queue without blocking, copies each sample
//! to every output channel, and converts to the device sample format. Underruns play silence.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use cpal::traits::DeviceTrait;

use crate::device;
use crate::queue::{PopStrategy, SharedAudio, samples_for_ms};

/// An open output stream and the mono queue it drains at `rate` Hz.
pub struct Playback {
    pub stream: cpal::Stream,
    pub queue: Arc<SharedAudio>,
    pub rate: u32,
}

/// Open the output device (substring match or default) and build its stream. Not started.
///
/// `buffer_ms` bounds the queue in front of the callback.
pub fn open_playback(host: &cpal::Host, needle: Option<&str>, buffer_ms: u32) -> Result<Playback> {
    let device = device::pick_output_device(host, needle)?;
    let config = device::pick_output_config(&device)?;
    let rate = config.sample_rate();
    let mut stream_config: cpal::StreamConfig = config.clone().into();
    if let Some(buf) = device::pick_buffer_size(&config, rate / 100) {
        stream_config.buffer_size = buf;
    }
    tracing::info!(
        device = %device.description()?,
        rate,
        channels = stream_config.channels,
        format = ?config.sample_format(),
        "output device"
    );

    let queue = Arc::new(SharedAudio::new(1, samples_for_ms(rate, 1, buffer_ms)));
    let stream = build_output_stream(&device, &stream_config, config.sample_format(), &queue)?;
    Ok(Playback { stream, queue, rate })
}

fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    queue: &Arc<SharedAudio>,
) -> Result<cpal::Stream> {
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, queue),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, queue),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, queue),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, queue),
        other => Err(anyhow!("Unsupported output sample format: {other:?}")),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    queue: &Arc<SharedAudio>,
) -> Result<cpal::Stream>
where
    T: cpal::SizedSample + cpal::FromSample<f32>,
{
    let channels = usize::from(config.channels.max(1));
    let queue = queue.clone();
    let mut state = PlaybackState::default();

    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _| {
            let underrun = state.fill(data, channels, |max_frames| {
                queue.pop(PopStrategy::NonBlocking { max_frames })
            });
            if underrun {
                state.underruns += 1;
                tracing::trace!(underruns = state.underruns, "playback underrun");
            }
        },
        |err| tracing::warn!("output stream error: {err}"),
        None,
    )?;
    Ok(stream)
}

/// Local buffer the callback drains before going back to the shared queue.
#[derive(Default)]
struct PlaybackState {
    src: Vec<f32>,
    pos: usize,
    underruns: u64,
}

impl PlaybackState {
    /// Fill `data` with mono samples duplicated across `channels`; returns `true` on underrun.
    fn fill<T, F>(&mut self, data: &mut [T], channels: usize, mut refill: F) -> bool
    where
        T: cpal::Sample + cpal::FromSample<f32>,
        F: FnMut(usize) -> Option<Vec<f32>>,
    {
        let silence = T::from_sample(0.0f32);
        let frames = data.len() / channels;
        for i in 0..frames {
            if self.pos >= self.src.len() {
                self.pos = 0;
                match refill(frames - i) {
                    Some(v) => self.src = v,
                    None => {
                        self.src.clear();
                        data[i * channels..].fill(silence);
                        return true;
                    }
                }
            }
            let sample = T::from_sample(self.src[self.pos]);
            data[i * channels..(i + 1) * channels].fill(sample);
            self.pos += 1;
        }
        false
    }
}
