//! Time sources for circuit breakers
//!
//! Breakers never read wall-clock time. All timestamps are offsets from an
//! anchor taken when the clock was created, so NTP adjustments cannot move a
//! circuit in or out of its open-state wait.
//!
//! - `MonotonicClock`: `Instant`-anchored, used by default
//! - `ManualClock`: advanced explicitly, for tests and simulations

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Source of monotonic time for a circuit breaker
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Time elapsed since the clock's anchor
    fn now(&self) -> Duration;
}

/// Monotonic clock anchored at creation
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    start_time: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
        }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now(&self) -> Duration {
        self.start_time.elapsed()
    }
}

/// Clock that only moves when told to
///
/// Share it through an `Arc` between the breaker and the code driving time:
///
/// ```rust
/// use windowed_breaker::{CircuitBreaker, ManualClock};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// let clock = Arc::new(ManualClock::new());
/// let circuit = CircuitBreaker::builder("inventory")
///     .clock(clock.clone())
///     .build()
///     .unwrap();
///
/// clock.advance(Duration::from_secs(30));
/// assert!(circuit.is_closed());
/// ```
#[derive(Debug, Default)]
pub struct ManualClock {
    nanos: AtomicU64,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let nanos = u64::try_from(by.as_nanos()).unwrap_or(u64::MAX);
        self.nanos.fetch_add(nanos, Ordering::SeqCst);
    }

    /// Jump to an absolute offset from the anchor
    pub fn set(&self, at: Duration) {
        let nanos = u64::try_from(at.as_nanos()).unwrap_or(u64::MAX);
        self.nanos.store(nanos, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.nanos.load(Ordering::SeqCst))
    }
}
