//! Thermal-aware pacing: how long to wait between two emitted tokens.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Per-token delays for each throttling condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DegradationDelays {
    pub rate_limited_ms: u64,
    pub thermal_ms: u64,
    pub both_ms: u64,
}

impl Default for DegradationDelays {
    fn default() -> Self {
        Self {
            rate_limited_ms: 75,
            thermal_ms: 100,
            both_ms: 150,
        }
    }
}

/// Pure lookup from (rate-limited, thermal-throttled) to a delay.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ThermalPolicy {
    delays: DegradationDelays,
}

impl ThermalPolicy {
    pub fn new(delays: DegradationDelays) -> Self {
        Self { delays }
    }

    pub fn delays(&self) -> DegradationDelays {
        self.delays
    }

    pub fn compute_stream_delay(&self, is_rate_limited: bool, is_thermal_throttled: bool) -> Duration {
        let ms = match (is_rate_limited, is_thermal_throttled) {
            (false, false) => 0,
            (true, false) => self.delays.rate_limited_ms,
            (false, true) => self.delays.thermal_ms,
            (true, true) => self.delays.both_ms,
        };
        Duration::from_millis(ms)
    }
}

/// The default table: 0 / 75 / 100 / 150 ms.
pub fn compute_stream_delay(is_rate_limited: bool, is_thermal_throttled: bool) -> Duration {
    ThermalPolicy::default().compute_stream_delay(is_rate_limited, is_thermal_throttled)
}

/// Externally driven "device is hot" flag.
///
/// Clones share one flag: hand a clone to whatever watches device temperature
/// and the engine worker sees the change on its next token.
#[derive(Debug, Clone, Default)]
pub struct ThermalSignal(Arc<AtomicBool>);

impl ThermalSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the previous value.
    pub fn set(&self, throttled: bool) -> bool {
        self.0.swap(throttled, Ordering::AcqRel)
    }

    #[inline]
    pub fn is_throttled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// The two flags the pacing decision reads. Re-read on every token.
pub trait ThrottleFlags {
    fn is_rate_limited(&self) -> bool;
    fn is_thermal_throttled(&self) -> bool;
}

impl ThrottleFlags for ThermalSignal {
    fn is_rate_limited(&self) -> bool {
        false
    }

    fn is_thermal_throttled(&self) -> bool {
        self.is_throttled()
    }
}

/// Fixed flags, handy for one-off sessions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StaticFlags {
    pub rate_limited: bool,
    pub thermal: bool,
}

impl ThrottleFlags for StaticFlags {
    fn is_rate_limited(&self) -> bool {
        self.rate_limited
    }

    fn is_thermal_throttled(&self) -> bool {
        self.thermal
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_table() {
        let ms = |r, t| compute_stream_delay(r, t).as_millis();
        assert_eq!(ms(false, false), 0);
        assert_eq!(ms(true, false), 75);
        assert_eq!(ms(false, true), 100);
        assert_eq!(ms(true, true), 150);
    }

    #[test]
    fn delays_are_strictly_increasing() {
        let d = [
            compute_stream_delay(false, false),
            compute_stream_delay(true, false),
            compute_stream_delay(false, true),
            compute_stream_delay(true, true),
        ];
        assert!(d.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn custom_table_is_honored() {
        let policy = ThermalPolicy::new(DegradationDelays {
            rate_limited_ms: 1,
            thermal_ms: 2,
            both_ms: 3,
        });
        assert_eq!(policy.compute_stream_delay(true, true), Duration::from_millis(3));
        assert_eq!(policy.compute_stream_delay(false, false), Duration::ZERO);
    }

    #[test]
    fn signal_clones_share_state() {
        let a = ThermalSignal::new();
        let b = a.clone();
        assert!(!b.set(true));
        assert!(a.is_throttled());
        assert!(a.set(false));
        assert!(!b.is_throttled());
    }
}
