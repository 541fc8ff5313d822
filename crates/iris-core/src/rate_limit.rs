//! Sliding-window request counter.
//!
//! The window is checked lazily on each attempt; nothing ticks in the
//! background.

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window_secs: 60,
        }
    }
}

impl RateLimitConfig {
    #[inline]
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitWindow {
    config: RateLimitConfig,
    request_count: u32,
    window_start: Instant,
    limited: bool,
}

impl RateLimitWindow {
    pub fn new(config: RateLimitConfig, now: Instant) -> Self {
        Self {
            config,
            request_count: 0,
            window_start: now,
            limited: false,
        }
    }

    /// Count one admission attempt. Returns the new rate-limited flag.
    pub fn record_attempt(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.window_start) > self.config.window() {
            self.request_count = 0;
            self.window_start = now;
            self.limited = false;
        }

        self.request_count = self.request_count.saturating_add(1);
        self.limited = self.request_count > self.config.max_requests;
        self.limited
    }

    /// As of the last attempt; not recomputed here.
    #[inline]
    pub fn is_rate_limited(&self) -> bool {
        self.limited
    }

    pub fn request_count(&self) -> u32 {
        self.request_count
    }

    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Whole seconds until the window rolls over, rounded up. A UI hint only.
    pub fn cooldown_seconds(&self, now: Instant) -> u64 {
        if !self.limited {
            return 0;
        }
        // A window too long to represent never ends.
        let Some(end) = self.window_start.checked_add(self.config.window()) else {
            return self.config.window_secs;
        };
        let remaining = end.saturating_duration_since(now);
        let secs = remaining.as_secs() + u64::from(remaining.subsec_nanos() > 0);
        secs.min(self.config.window_secs)
    }
}
