//! Rate conversion stage between two [`SharedAudio`] queues.
//!
//! Used on the capture side (device rate → 48 kHz) and the playback side (48 kHz → device
//! rate) when the device could not be opened at the voice rate.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use anyhow::{Context, Result, anyhow};
use audioadapter_buffers::direct::InterleavedSlice;
use rubato::{
    Async, FixedAsync, Indexing, Resampler, SincInterpolationParameters, SincInterpolationType,
    WindowFunction, calculate_cutoff,
};

use crate::queue::{PopStrategy, SharedAudio};

/// Streaming sinc resampler over interleaved `f32` blocks.
pub struct StreamResampler {
    inner: Async<f32>,
    channels: usize,
    chunk_frames: usize,
    out: Vec<f32>,
    indexing: Indexing,
}

impl StreamResampler {
    pub fn new(src_rate: u32, dst_rate: u32, channels: usize, chunk_frames: usize) -> Result<Self> {
        if src_rate == 0 || dst_rate == 0 {
            return Err(anyhow!("Invalid resample rates {src_rate} -> {dst_rate}"));
        }
        let channels = channels.max(1);
        let chunk_frames = chunk_frames.max(1);
        let ratio = dst_rate as f64 / src_rate as f64;

        // Shorter sinc than music playback would use; voice needs low delay more than a steep cutoff.
        let sinc_len = 64;
        let window = WindowFunction::BlackmanHarris2;
        let params = SincInterpolationParameters {
            sinc_len,
            f_cutoff: calculate_cutoff(sinc_len, window),
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 128,
            window,
        };
        let inner = Async::<f32>::new_sinc(ratio, 1.1, &params, chunk_frames, channels, FixedAsync::Input)
            .context("Creating resampler")?;

        let out_frames = (chunk_frames as f64 * ratio * 1.1).ceil() as usize + 64;
        Ok(Self {
            inner,
            channels,
            chunk_frames,
            out: vec![0.0; out_frames * channels],
            indexing: Indexing {
                input_offset: 0,
                output_offset: 0,
                active_channels_mask: None,
                partial_len: None,
            },
        })
    }

    pub fn chunk_frames(&self) -> usize {
        self.chunk_frames
    }

    /// Resample one block. `input` holds at most `chunk_frames` frames; a shorter block is
    /// treated as the final partial chunk.
    pub fn process(&mut self, input: &[f32]) -> Result<&[f32]> {
        let frames = input.len() / self.channels;
        if frames == 0 {
            return Ok(&[]);
        }
        if frames > self.chunk_frames {
            return Err(anyhow!("Resampler block too large: {frames} > {}", self.chunk_frames));
        }

        // Partial chunks are padded by the resampler itself when `partial_len` is set, but the
        // adapter must still describe a full chunk.
        let padded;
        let input = if frames < self.chunk_frames {
            let mut v = input[..frames * self.channels].to_vec();
            v.resize(self.chunk_frames * self.channels, 0.0);
            padded = v;
            &padded[..]
        } else {
            input
        };

        let input_adapter = InterleavedSlice::new(input, self.channels, self.chunk_frames)
            .map_err(|e| anyhow!("Resampler input: {e}"))?;
        let out_frames = self.out.len() / self.channels;
        let mut output_adapter = InterleavedSlice::new_mut(&mut self.out, self.channels, out_frames)
            .map_err(|e| anyhow!("Resampler output: {e}"))?;

        self.indexing.partial_len = (frames < self.chunk_frames).then_some(frames);
        let (_, produced) = self
            .inner
            .process_into_buffer(&input_adapter, &mut output_adapter, Some(&self.indexing))
            .context("Resampling")?;
        Ok(&self.out[..produced * self.channels])
    }
}

/// Spawn a thread that resamples everything from `srcq` into `dstq`.
///
/// The thread closes `dstq` after `srcq` is closed and drained, or when `dstq` is closed.
pub fn start_resampler(
    srcq: Arc<SharedAudio>,
    dstq: Arc<SharedAudio>,
    src_rate: u32,
    dst_rate: u32,
    chunk_frames: usize,
) -> Result<JoinHandle<()>> {
    if srcq.channels() != dstq.channels() {
        return Err(anyhow!(
            "Resampler channel mismatch: {} -> {}",
            srcq.channels(),
            dstq.channels()
        ));
    }
    let mut resampler = StreamResampler::new(src_rate, dst_rate, srcq.channels(), chunk_frames)?;
    tracing::debug!(src_rate, dst_rate, chunk_frames, "resampler started");

    let handle = thread::Builder::new()
        .name("voice-resample".to_string())
        .spawn(move || {
            let chunk = resampler.chunk_frames();
            while let Some(block) = srcq.pop(PopStrategy::BlockingExact { frames: chunk }) {
                match resampler.process(&block) {
                    Ok(out) => {
                        if !dstq.push_blocking(out) {
                            srcq.close();
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::error!("resampler error: {e:#}");
                        srcq.close();
                        dstq.close();
                        return;
                    }
                }
            }

            while let Some(tail) = srcq.pop(PopStrategy::BlockingUpTo { max_frames: chunk }) {
                match resampler.process(&tail) {
                    Ok(out) => {
                        if !out.is_empty() && !dstq.push_blocking(out) {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::error!("resampler tail error: {e:#}");
                        break;
                    }
                }
            }
            dstq.close();
        })
        .context("Spawning resampler thread")?;
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::samples_for_ms;

    #[test]
    fn rejects_zero_rates() {
        assert!(StreamResampler::new(0, 48_000, 1, 480).is_err());
        assert!(StreamResampler::new(48_000, 0, 1, 480).is_err());
    }

    #[test]
    fn output_length_tracks_rate_ratio() {
        let mut r = StreamResampler::new(44_100, 48_000, 1, 441).unwrap();
        let block = vec![0.25f32; 441];
        let mut total = 0usize;
        for _ in 0..50 {
            total += r.process(&block).unwrap().len();
        }
        // 50 blocks of 10 ms at 44.1 kHz ≈ 24_000 frames at 48 kHz, minus filter delay
        assert!((22_000..=24_100).contains(&total), "produced {total}");
    }

    #[test]
    fn oversized_block_is_an_error() {
        let mut r = StreamResampler::new(48_000, 16_000, 1, 480).unwrap();
        assert!(r.process(&vec![0.0; 481]).is_err());
    }

    #[test]
    fn stage_closes_output_after_input_drains() {
        let srcq = Arc::new(SharedAudio::new(1, samples_for_ms(16_000, 1, 500)));
        let dstq = Arc::new(SharedAudio::new(1, samples_for_ms(48_000, 1, 1_000)));
        let handle = start_resampler(srcq.clone(), dstq.clone(), 16_000, 48_000, 160).unwrap();

        srcq.push_blocking(&vec![0.1; 160 * 5 + 40]);
        srcq.close();
        handle.join().unwrap();

        assert!(dstq.is_done());
        assert!(dstq.len_frames() > 160 * 3 * 3);
    }

    #[test]
    fn stage_requires_matching_channels() {
        let srcq = Arc::new(SharedAudio::new(1, 16));
        let dstq = Arc::new(SharedAudio::new(2, 16));
        assert!(start_resampler(srcq, dstq, 16_000, 48_000, 160).is_err());
    }
}
