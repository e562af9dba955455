//! Bounded sample queues shared between the audio stages.
//!
//! Producers and consumers:
//! - capture callback → queue (lossy, never blocks)
//! - resampler / mixer threads → queue (blocking, paces the producer)
//! - encoder thread / playback callback drain the queue
//!
//! `close()` wakes every waiter; blocking calls return once the queue is closed.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Bounded queue of interleaved `f32` samples with a fixed channel count.
pub struct SharedAudio {
    channels: usize,
    inner: Mutex<SharedInner>,
    cv: Condvar,
    max_buffered_samples: usize,
}

struct SharedInner {
    queue: VecDeque<f32>,
    done: bool,
}

/// How [`SharedAudio::pop`] waits for data.
#[derive(Debug, Clone, Copy)]
pub enum PopStrategy {
    /// Block until exactly `frames` are available; `None` if closed first.
    BlockingExact { frames: usize },
    /// Block until at least one frame is available, then return up to `max_frames`.
    BlockingUpTo { max_frames: usize },
    /// Return up to `max_frames` immediately; `None` if empty.
    NonBlocking { max_frames: usize },
}

/// Capacity in samples for `ms` milliseconds of audio at `rate_hz`.
///
/// Zero falls back to one 10 ms block so the queue can always hold something.
pub fn samples_for_ms(rate_hz: u32, channels: usize, ms: u32) -> usize {
    let ms = if ms == 0 { 10 } else { ms };
    let frames = (u64::from(rate_hz) * u64::from(ms)).div_ceil(1000) as usize;
    frames.max(1).saturating_mul(channels.max(1))
}

impl SharedAudio {
    pub fn new(channels: usize, max_buffered_samples: usize) -> Self {
        let channels = channels.max(1);
        Self {
            channels,
            inner: Mutex::new(SharedInner {
                queue: VecDeque::with_capacity(max_buffered_samples),
                done: false,
            }),
            cv: Condvar::new(),
            max_buffered_samples: max_buffered_samples.max(channels),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SharedInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn max_frames(&self) -> usize {
        self.max_buffered_samples / self.channels
    }

    /// Buffered frames right now.
    pub fn len_frames(&self) -> usize {
        self.lock().queue.len() / self.channels
    }

    pub fn is_done(&self) -> bool {
        self.lock().done
    }

    /// Mark the queue finished and wake all waiters. Idempotent.
    pub fn close(&self) {
        self.lock().done = true;
        self.cv.notify_all();
    }

    /// Push samples, waiting for room when full.
    ///
    /// Returns `false` if the queue was closed before everything was queued.
    pub fn push_blocking(&self, samples: &[f32]) -> bool {
        let mut offset = 0;
        while offset < samples.len() {
            let mut g = self.lock();
            while g.queue.len() >= self.max_buffered_samples && !g.done {
                g = self.cv.wait(g).unwrap_or_else(PoisonError::into_inner);
            }
            if g.done {
                return false;
            }
            let room = self.max_buffered_samples - g.queue.len();
            let take = room.min(samples.len() - offset);
            g.queue.extend(&samples[offset..offset + take]);
            offset += take;
            drop(g);
            self.cv.notify_all();
        }
        true
    }

    /// Push without waiting; when full, the oldest whole frames are discarded to make room.
    ///
    /// Returns the number of samples dropped. Used from real-time callbacks.
    pub fn push_lossy(&self, samples: &[f32]) -> usize {
        let mut g = self.lock();
        if g.done {
            return samples.len();
        }
        let samples = if samples.len() > self.max_buffered_samples {
            &samples[samples.len() - self.max_buffered_samples..]
        } else {
            samples
        };
        let overflow = (g.queue.len() + samples.len()).saturating_sub(self.max_buffered_samples);
        let dropped = overflow.div_ceil(self.channels) * self.channels;
        let dropped = dropped.min(g.queue.len());
        g.queue.drain(..dropped);
        g.queue.extend(samples);
        drop(g);
        self.cv.notify_all();
        dropped
    }

    /// Pop interleaved frames. Returns `None` when the request cannot be met.
    pub fn pop(&self, strategy: PopStrategy) -> Option<Vec<f32>> {
        let mut g = self.lock();
        let want = match strategy {
            PopStrategy::BlockingExact { frames } => {
                let want = frames * self.channels;
                while g.queue.len() < want && !g.done {
                    g = self.cv.wait(g).unwrap_or_else(PoisonError::into_inner);
                }
                if g.queue.len() < want {
                    return None;
                }
                want
            }
            PopStrategy::BlockingUpTo { max_frames } => {
                while g.queue.len() < self.channels && !g.done {
                    g = self.cv.wait(g).unwrap_or_else(PoisonError::into_inner);
                }
                (g.queue.len() / self.channels).min(max_frames) * self.channels
            }
            PopStrategy::NonBlocking { max_frames } => {
                (g.queue.len() / self.channels).min(max_frames) * self.channels
            }
        };
        if want == 0 {
            return None;
        }
        let out: Vec<f32> = g.queue.drain(..want).collect();
        drop(g);
        self.cv.notify_all();
        Some(out)
    }

    /// Wait up to `timeout` for any buffered audio.
    pub fn wait_for_any(&self, timeout: Duration) -> bool {
        let g = self.lock();
        if !g.queue.is_empty() {
            return true;
        }
        let (g, _) = self
            .cv
            .wait_timeout(g, timeout)
            .unwrap_or_else(PoisonError::into_inner);
        !g.queue.is_empty()
    }
}
