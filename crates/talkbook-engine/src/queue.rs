//! Thread-safe bounded queue for interleaved audio samples.
//!
//! Sits between the fragment worker (blocking producer) and the CPAL callback
//! (non-blocking consumer). A full queue blocks the producer, which is the only
//! backpressure the pipeline needs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Bounded queue of interleaved `f32` samples.
///
/// ## Design
/// - One producer blocks while the queue is full; the consumer never blocks.
/// - `clear()` bumps a generation counter so a producer parked inside
///   [`SharedAudio::push_interleaved_blocking`] abandons the rest of its slice.
/// - `close()` is final and wakes everyone.
pub struct SharedAudio {
    channels: usize,
    inner: Mutex<SharedInner>,
    cv: Condvar,
    max_buffered_samples: usize,
    low_watermark_ms: AtomicU64,
    created: Instant,
}

struct SharedInner {
    queue: VecDeque<f32>,
    generation: u64,
    done: bool,
}

/// Outcome of a blocking push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Every sample was queued.
    Complete,
    /// The queue was cleared while waiting; the remainder was dropped.
    Cleared,
    /// The queue was closed.
    Closed,
}

/// Queue capacity in samples for `(rate, channels, seconds)`.
///
/// Non-finite or non-positive `buffer_seconds` falls back to one second.
pub fn calc_max_buffered_samples(rate_hz: u32, channels: usize, buffer_seconds: f32) -> usize {
    let secs = if buffer_seconds.is_finite() && buffer_seconds > 0.0 {
        buffer_seconds
    } else {
        1.0
    };

    let frames = (rate_hz as f32 * secs).ceil() as usize;
    frames.saturating_mul(channels).max(channels)
}

impl SharedAudio {
    pub fn new(channels: usize, max_buffered_samples: usize) -> Self {
        let channels = channels.max(1);
        Self {
            channels,
            inner: Mutex::new(SharedInner {
                queue: VecDeque::new(),
                generation: 0,
                done: false,
            }),
            cv: Condvar::new(),
            max_buffered_samples: max_buffered_samples.max(channels),
            low_watermark_ms: AtomicU64::new(0),
            created: Instant::now(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SharedInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Buffered frames (best-effort snapshot).
    #[cfg(test)]
    fn len_frames(&self) -> usize {
        self.lock().queue.len() / self.channels
    }

    #[cfg(test)]
    fn is_done(&self) -> bool {
        self.lock().done
    }

    /// Mark the queue finished and wake all waiters. Idempotent.
    pub fn close(&self) {
        self.lock().done = true;
        self.cv.notify_all();
    }

    /// Drop everything buffered and abort any push in progress.
    pub fn clear(&self) {
        let mut g = self.lock();
        g.queue.clear();
        g.generation = g.generation.wrapping_add(1);
        drop(g);
        self.cv.notify_all();
    }

    /// Push interleaved samples, blocking while the queue is full.
    pub fn push_interleaved_blocking(&self, samples: &[f32]) -> PushOutcome {
        let mut offset = 0;
        let generation = self.lock().generation;

        while offset < samples.len() {
            let mut g = self.lock();

            while g.queue.len() >= self.max_buffered_samples
                && !g.done
                && g.generation == generation
            {
                g = self.cv.wait(g).unwrap_or_else(PoisonError::into_inner);
            }
            if g.done {
                return PushOutcome::Closed;
            }
            if g.generation != generation {
                return PushOutcome::Cleared;
            }

            let room = self.max_buffered_samples - g.queue.len();
            let take = room.min(samples.len() - offset);
            g.queue.extend(&samples[offset..offset + take]);
            offset += take;

            drop(g);
            self.cv.notify_all();
        }
        PushOutcome::Complete
    }

    /// Return up to `max_frames` whole frames without blocking, or `None` if empty.
    pub fn pop_nonblocking(&self, max_frames: usize) -> Option<Vec<f32>> {
        let mut g = self.lock();

        let available_frames = g.queue.len() / self.channels;
        let take_samples = available_frames.min(max_frames) * self.channels;
        if take_samples == 0 {
            return None;
        }

        let out: Vec<f32> = g.queue.drain(..take_samples).collect();
        let queued = g.queue.len();
        drop(g);
        self.cv.notify_all();
        self.log_low_watermark(queued);
        Some(out)
    }

    fn log_low_watermark(&self, queued: usize) {
        let threshold = (self.max_buffered_samples / 8).max(self.channels * 16);
        if queued > 0 && queued < threshold {
            let now = self.created.elapsed().as_millis() as u64;
            let last = self.low_watermark_ms.load(Ordering::Relaxed);
            if now.saturating_sub(last) > 1000 {
                self.low_watermark_ms.store(now, Ordering::Relaxed);
                tracing::debug!(
                    queued_samples = queued,
                    threshold_samples = threshold,
                    "audio queue low watermark"
                );
            }
        }
    }

    /// Block until the queue is empty, or it was cleared/closed meanwhile.
    ///
    /// Returns `true` if the buffered audio was consumed normally.
    pub fn wait_until_empty(&self, poll: Duration) -> bool {
        let mut g = self.lock();
        let generation = g.generation;
        loop {
            if g.generation != generation || g.done {
                return false;
            }
            if g.queue.is_empty() {
                return true;
            }
            let (ng, _timeout) = self
                .cv
                .wait_timeout(g, poll)
                .unwrap_or_else(PoisonError::into_inner);
            g = ng;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn calc_max_buffered_samples_fallbacks() {
        assert_eq!(calc_max_buffered_samples(48_000, 2, 2.0), 192_000);
        assert_eq!(calc_max_buffered_samples(48_000, 2, -1.0), 96_000);
        assert_eq!(calc_max_buffered_samples(48_000, 2, f32::NAN), 96_000);
    }

    #[test]
    fn pop_nonblocking_empty() {
        let q = SharedAudio::new(2, 16);
        assert!(q.pop_nonblocking(4).is_none());
    }

    #[test]
    fn pop_nonblocking_returns_whole_frames() {
        let q = SharedAudio::new(2, 64);
        q.push_interleaved_blocking(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);

        let out = q.pop_nonblocking(2).unwrap();
        assert_eq!(out, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(q.len_frames(), 1);
    }

    #[test]
    fn push_blocks_until_consumer_makes_room() {
        let q = Arc::new(SharedAudio::new(1, 4));
        let producer = q.clone();
        let handle = thread::spawn(move || producer.push_interleaved_blocking(&[0.0; 10]));

        let mut received = 0;
        while received < 10 {
            if let Some(v) = q.pop_nonblocking(3) {
                received += v.len();
            } else {
                thread::sleep(Duration::from_millis(1));
            }
        }
        assert_eq!(handle.join().unwrap(), PushOutcome::Complete);
    }

    #[test]
    fn clear_aborts_parked_push() {
        let q = Arc::new(SharedAudio::new(1, 4));
        let producer = q.clone();
        let handle = thread::spawn(move || producer.push_interleaved_blocking(&[0.5; 64]));

        while q.len_frames() < 4 {
            thread::sleep(Duration::from_millis(1));
        }
        q.clear();
        assert_eq!(handle.join().unwrap(), PushOutcome::Cleared);
        assert!(q.len_frames() <= 4);
    }

    #[test]
    fn push_after_close_is_rejected() {
        let q = SharedAudio::new(2, 8);
        q.close();
        assert_eq!(q.push_interleaved_blocking(&[1.0, 2.0]), PushOutcome::Closed);
        assert!(q.is_done());
    }

    #[test]
    fn wait_until_empty_reports_clear() {
        let q = Arc::new(SharedAudio::new(1, 8));
        q.push_interleaved_blocking(&[1.0, 2.0]);
        let clearer = q.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            clearer.clear();
        });
        assert!(!q.wait_until_empty(Duration::from_millis(5)));
        handle.join().unwrap();
    }

    #[test]
    fn wait_until_empty_returns_true_when_drained() {
        let q = SharedAudio::new(1, 8);
        q.push_interleaved_blocking(&[1.0]);
        q.pop_nonblocking(1);
        assert!(q.wait_until_empty(Duration::from_millis(5)));
    }
}
