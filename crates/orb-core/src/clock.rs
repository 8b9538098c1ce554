//! Monotonic high-resolution clock
//!
//! Timestamps are microseconds since the first clock access in the process.

use std::sync::OnceLock;
use std::time::{Duration, Instant};

static EPOCH: OnceLock<Instant> = OnceLock::new();

#[inline]
fn epoch() -> Instant {
    *EPOCH.get_or_init(Instant::now)
}

/// Microseconds since process clock epoch
#[inline]
pub fn now_micros() -> u64 {
    epoch().elapsed().as_micros() as u64
}

/// Stopwatch-style clock for measuring spans on any thread
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    start: Instant,
}

impl Clock {
    /// Pin the process epoch so later `now_micros` calls are relative to it
    pub fn init() {
        let _ = epoch();
    }

    #[inline]
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    #[inline]
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    #[inline]
    pub fn elapsed_micros(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    /// Restart and return the span that just ended
    #[inline]
    pub fn lap(&mut self) -> Duration {
        let now = Instant::now();
        let span = now.duration_since(self.start);
        self.start = now;
        span
    }
}
