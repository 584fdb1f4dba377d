//! Time sources for refill computation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

/// Supplies the decision timestamp in seconds since the Unix epoch.
pub trait Clock: Send + Sync {
    /// Current time as fractional seconds since the Unix epoch.
    fn now(&self) -> f64;
}

/// Wall-clock time source.
///
/// Never returns a value lower than one it has already returned, so a local
/// clock step backwards cannot produce out-of-order timestamps from this
/// process. Skew between processes is handled by the store.
#[derive(Debug, Default)]
pub struct SystemClock {
    /// Bits of the highest `f64` handed out so far
    last: AtomicU64,
}

impl SystemClock {
    /// Create a new system clock.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or(0.0);

        // Non-negative f64 values order the same way as their bit patterns.
        let previous = self.last.fetch_max(now.to_bits(), Ordering::AcqRel);
        now.max(f64::from_bits(previous))
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<f64>,
}

impl ManualClock {
    /// Create a clock frozen at `start` seconds since the epoch.
    pub fn new(start: f64) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Move the clock forward by `by`.
    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by.as_secs_f64();
    }

    /// Set the clock to an absolute value. Moving backwards is allowed so
    /// tests can simulate a caller whose clock lags the store.
    pub fn set(&self, now: f64) {
        *self.now.lock() = now;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> f64 {
        *self.now.lock()
    }
}
