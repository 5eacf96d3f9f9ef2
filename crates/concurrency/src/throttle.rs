//! Bandwidth limiting for the copy loop
//!
//! Pacing is computed from the bytes consumed since the start of the
//! current window: after `n` bytes the loop may not be ahead of
//! `window_start + n / rate`. Sleeping happens outside the state lock and is
//! interruptible through the job's [`CancelToken`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::cancel::CancelToken;

const DEFAULT_WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug)]
struct Window {
    start: Instant,
    consumed: u64,
}

/// Bytes-per-second limiter; a rate of 0 means unlimited
#[derive(Debug)]
pub struct Throttle {
    rate: AtomicU64,
    window: Duration,
    state: Mutex<Window>,
}

impl Throttle {
    /// Create a limiter with a one second accounting window
    pub fn new(bytes_per_sec: u64) -> Self {
        Self::with_window(bytes_per_sec, DEFAULT_WINDOW)
    }

    /// Create a limiter with a custom accounting window
    pub fn with_window(bytes_per_sec: u64, window: Duration) -> Self {
        Self {
            rate: AtomicU64::new(bytes_per_sec),
            window,
            state: Mutex::new(Window {
                start: Instant::now(),
                consumed: 0,
            }),
        }
    }

    /// Current rate in bytes per second
    pub fn rate(&self) -> u64 {
        self.rate.load(Ordering::Relaxed)
    }

    /// Change the rate; takes effect at the next `consume`
    pub fn set_rate(&self, bytes_per_sec: u64) {
        tracing::debug!(target: "livemerge::throttle", bytes_per_sec, "Rate changed");
        self.rate.store(bytes_per_sec, Ordering::Relaxed);
        let mut w = self.state.lock();
        w.start = Instant::now();
        w.consumed = 0;
    }

    /// Check if the limiter never pauses
    pub fn is_unlimited(&self) -> bool {
        self.rate() == 0
    }

    /// Largest chunk worth copying in one step, in bytes
    ///
    /// Limited to one second's worth of bandwidth, rounded down to whole
    /// blocks and never below one block.
    pub fn clamp_chunk(&self, chunk_bytes: u64, block_size: u64) -> u64 {
        let rate = self.rate();
        if rate == 0 {
            return chunk_bytes.max(block_size);
        }
        let per_sec = (rate / block_size).max(1) * block_size;
        chunk_bytes.min(per_sec).max(block_size)
    }

    /// Pause this long before copying more
    fn account(&self, bytes: u64) -> Duration {
        let rate = self.rate();
        if rate == 0 {
            return Duration::ZERO;
        }
        let mut w = self.state.lock();
        let now = Instant::now();
        if now.duration_since(w.start) >= self.window {
            w.start = now;
            w.consumed = 0;
        }
        w.consumed += bytes;
        let target = w.start + Duration::from_secs_f64(w.consumed as f64 / rate as f64);
        let pause = target.saturating_duration_since(now);
        if target.duration_since(w.start) >= self.window {
            w.start = target.max(now);
            w.consumed = 0;
        }
        pause
    }

    /// Record `bytes` copied and sleep if the loop is ahead of its budget
    ///
    /// Returns false if `cancel` fired while sleeping.
    pub fn consume(&self, bytes: u64, cancel: &CancelToken) -> bool {
        let pause = self.account(bytes);
        if pause.is_zero() {
            return !cancel.is_cancelled();
        }
        cancel.sleep(pause)
    }
}
