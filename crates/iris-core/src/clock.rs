//! Time source for rate-limit windows and per-token pacing.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    /// Suspend the calling thread. Only the engine worker ever sleeps.
    fn sleep(&self, dur: Duration);
}

/// Wall clock + `thread::sleep`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, dur: Duration) {
        if !dur.is_zero() {
            std::thread::sleep(dur);
        }
    }
}

/// Virtual clock: `sleep` advances time instantly and is recorded.
///
/// Cheap to clone; clones share the same timeline, so a test can keep one
/// handle while the coordinator owns another.
#[derive(Debug, Clone)]
pub struct ManualClock {
    inner: Arc<Mutex<ManualState>>,
}

#[derive(Debug)]
struct ManualState {
    base: Instant,
    offset: Duration,
    sleeps: Vec<Duration>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManualState {
                base: Instant::now(),
                offset: Duration::ZERO,
                sleeps: Vec::new(),
            })),
        }
    }

    pub fn advance(&self, dur: Duration) {
        self.state().offset += dur;
    }

    /// Virtual time since construction.
    pub fn elapsed(&self) -> Duration {
        self.state().offset
    }

    /// Every `sleep` call so far, in order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.state().sleeps.clone()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ManualState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        let s = self.state();
        s.base + s.offset
    }

    fn sleep(&self, dur: Duration) {
        let mut s = self.state();
        s.sleeps.push(dur);
        s.offset += dur;
    }
}
