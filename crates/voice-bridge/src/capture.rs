//! Capture stage (CPAL input stream).
//!
//! The callback downmixes whatever the device delivers to mono `f32` and pushes it into a lossy
//! queue; it never blocks.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use cpal::traits::DeviceTrait;

use crate::device;
use crate::queue::{SharedAudio, samples_for_ms};

/// Capture backlog before the oldest audio is dropped.
const CAPTURE_QUEUE_MS: u32 = 200;

/// An open input stream and the mono queue it feeds at `rate` Hz.
pub struct Capture {
    pub stream: cpal::Stream,
    pub queue: Arc<SharedAudio>,
    pub rate: u32,
}

/// Open the input device (substring match or default) and build its stream. Not started.
pub fn open_capture(host: &cpal::Host, needle: Option<&str>) -> Result<Capture> {
    let device = device::pick_input_device(host, needle)?;
    let config = device::pick_input_config(&device)?;
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
        "input device"
    );

    let queue = Arc::new(SharedAudio::new(1, samples_for_ms(rate, 1, CAPTURE_QUEUE_MS)));
    let stream = build_input_stream(&device, &stream_config, config.sample_format(), &queue)?;
    Ok(Capture { stream, queue, rate })
}

fn build_input_stream(
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
        other => Err(anyhow!("Unsupported input sample format: {other:?}")),
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    queue: &Arc<SharedAudio>,
) -> Result<cpal::Stream>
where
    T: cpal::SizedSample,
    f32: cpal::FromSample<T>,
{
    let channels = usize::from(config.channels.max(1));
    let queue = queue.clone();
    let mut mono = Vec::new();
    let mut dropped_total = 0u64;

    let stream = device.build_input_stream(
        config,
        move |data: &[T], _| {
            downmix_into(data, channels, &mut mono);
            let dropped = queue.push_lossy(&mono);
            if dropped > 0 {
                dropped_total += dropped as u64;
                tracing::trace!(dropped, dropped_total, "capture overrun");
            }
        },
        |err| tracing::warn!("input stream error: {err}"),
        None,
    )?;
    Ok(stream)
}

/// Average interleaved frames down to one channel, replacing the contents of `out`.
fn downmix_into<T>(data: &[T], channels: usize, out: &mut Vec<f32>)
where
    T: cpal::Sample,
    f32: cpal::FromSample<T>,
{
    out.clear();
    if channels <= 1 {
        out.extend(data.iter().map(|s| s.to_sample::<f32>()));
        return;
    }
    let scale = 1.0 / channels as f32;
    out.extend(
        data.chunks_exact(channels)
            .map(|frame| frame.iter().map(|s| s.to_sample::<f32>()).sum::<f32>() * scale),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stereo_frames_are_averaged() {
        let mut out = Vec::new();
        downmix_into(&[0.5f32, 0.1, -1.0, 1.0], 2, &mut out);
        assert_eq!(out.len(), 2);
        assert!((out[0] - 0.3).abs() < 1e-6);
        assert_eq!(out[1], 0.0);
    }

    #[test]
    fn mono_passes_through_and_converts_format() {
        let mut out = vec![9.0];
        downmix_into(&[0i16, i16::MAX], 1, &mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0], 0.0);
        assert!((out[1] - 1.0).abs() < 1e-3);
    }

    #[test]
    fn trailing_partial_frame_is_ignored() {
        let mut out = Vec::new();
        downmix_into(&[0.2f32, 0.2, 0.2, 0.4, 0.4, 0.4, 1.0], 3, &mut out);
        assert_eq!(out.len(), 2);
        assert!((out[1] - 0.4).abs() < 1e-6);
    }
}
