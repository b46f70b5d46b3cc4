//! WindowedBreaker - Count-based circuit breaker
//!
//! This crate provides a circuit breaker driven by a sliding window of the
//! most recent call outcomes:
//! - Ring buffer of outcomes with failure and slow-call rates
//! - State machine for the breaker lifecycle (Closed → Open → HalfOpen),
//!   plus operator-controlled Disabled and ForcedOpen states
//! - Explicit permits so callers can report outcomes themselves, or
//!   `call`/`call_async` wrappers with fallbacks
//! - Monotonic, injectable time so tests never sleep
//! - A registry that shares breakers by name
//!
//! # Example
//!
//! ```rust
//! use windowed_breaker::CircuitBreaker;
//!
//! let circuit = CircuitBreaker::builder("my_service")
//!     .failure_rate_threshold(50.0)
//!     .sliding_window_size(20)
//!     .minimum_number_of_calls(10)
//!     .wait_duration_in_open_state_secs(30.0)
//!     .on_open(|name| println!("Circuit {} opened!", name))
//!     .build()
//!     .expect("valid configuration");
//!
//! // Execute with circuit protection
//! let result = circuit.call(|| {
//!     // Your service call here
//!     Ok::<_, String>("success")
//! });
//! assert_eq!(result.unwrap(), "success");
//!
//! // Or drive the breaker by hand
//! match circuit.try_acquire_permission() {
//!     Ok(permit) => {
//!         // ... run the call, then report it
//!         permit.on_success();
//!     }
//!     Err(rejected) => println!("skipping call: {}", rejected),
//! }
//! ```

pub mod builder;
pub mod callbacks;
pub mod circuit;
pub mod classifier;
pub mod clock;
pub mod config;
pub mod errors;
pub mod metrics;
pub mod registry;
pub mod window;

pub use builder::CircuitBuilder;
pub use callbacks::Callbacks;
pub use circuit::{
    CallOptions, CircuitBreaker, CircuitState, FallbackContext, FallbackReason, Permit,
};
pub use classifier::{DefaultClassifier, FailureClassifier, FailureContext, PredicateClassifier};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::Config;
pub use errors::{CallRejected, CircuitError, ConfigError};
pub use metrics::Metrics;
pub use registry::CircuitRegistry;
pub use window::{Counts, SlidingWindow};

use std::time::Duration;

/// Classified result of one call, as held in the sliding window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallOutcome {
    Success,
    Failure,
    /// Succeeded, but took at least the slow-call threshold
    SlowSuccess,
    /// Failed, and took at least the slow-call threshold
    SlowFailure,
    /// Rejected by the breaker; counted, never buffered
    NotPermitted,
}

impl CallOutcome {
    /// Classify a finished call
    pub fn classify(succeeded: bool, duration: Duration, slow_threshold: Duration) -> Self {
        let slow = duration >= slow_threshold;
        match (succeeded, slow) {
            (true, false) => CallOutcome::Success,
            (true, true) => CallOutcome::SlowSuccess,
            (false, false) => CallOutcome::Failure,
            (false, true) => CallOutcome::SlowFailure,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, CallOutcome::Failure | CallOutcome::SlowFailure)
    }

    pub fn is_slow(&self) -> bool {
        matches!(self, CallOutcome::SlowSuccess | CallOutcome::SlowFailure)
    }
}
