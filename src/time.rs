//! Injectable time source.
//!
//! The throttle and hysteresis layers need to ask "how long since the last
//! send" without touching a global clock, so tests can drive them
//! deterministically. Production code uses [`SystemTime`]; tests use
//! [`ManualTime`] and advance it by hand.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// A source of monotonic instants
pub trait TimeSource: Send + Sync {
    /// The current instant
    fn now(&self) -> Instant;
}

/// Time source backed by the OS monotonic clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTime;

impl TimeSource for SystemTime {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A manually advanced time source for deterministic tests
///
/// Starts at an arbitrary base instant; [`ManualTime::advance`] moves the
/// reported time forward. Safe to share across tasks.
#[derive(Debug)]
pub struct ManualTime {
    base: Instant,
    offset_ms: AtomicU64,
}

impl Default for ManualTime {
    fn default() -> Self {
        Self {
            base: Instant::now(),
            offset_ms: AtomicU64::new(0),
        }
    }
}

impl ManualTime {
    /// Create a manual time source at its base instant
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the reported time
    pub fn advance(&self, by: Duration) {
        #[allow(clippy::cast_possible_truncation)]
        self.offset_ms
            .fetch_add(by.as_millis() as u64, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTime {
    fn now(&self) -> Instant {
        self.base + Duration::from_millis(self.offset_ms.load(Ordering::SeqCst))
    }
}
