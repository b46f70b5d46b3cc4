//! Error types for circuit breaker operations

use std::error::Error;
use std::time::Duration;
use thiserror::Error;

/// Invalid breaker configuration, reported when a breaker is built
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("sliding_window_size must be at least 1")]
    ZeroWindowSize,

    #[error("minimum_number_of_calls must be at least 1")]
    ZeroMinimumCalls,

    #[error("minimum_number_of_calls ({minimum}) exceeds sliding_window_size ({window})")]
    MinimumCallsExceedsWindow { minimum: usize, window: usize },

    #[error("permitted_calls_in_half_open_state must be at least 1")]
    ZeroHalfOpenCalls,

    #[error("{name} must be within (0, 100], got {value}")]
    ThresholdOutOfRange { name: &'static str, value: f64 },

    #[error("slow_call_duration_threshold must be greater than zero")]
    ZeroSlowCallDuration,

    #[error("jitter_factor must be within [0, 1], got {0}")]
    JitterOutOfRange(f64),

    #[error("circuit name must not be empty")]
    EmptyName,

    #[error("circuit '{0}' is already registered")]
    DuplicateName(String),
}

/// Acquisition denied by the breaker
///
/// The protected operation was not executed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallRejected {
    /// Circuit is open and its wait has not elapsed
    #[error("Circuit '{circuit}' is open (retry in {remaining:?})")]
    Open { circuit: String, remaining: Duration },

    /// Half-open trial quota is in flight
    #[error("Circuit '{circuit}' half-open trial limit reached ({limit} in flight)")]
    HalfOpenLimitReached { circuit: String, limit: usize },

    /// Circuit was forced open by an operator
    #[error("Circuit '{circuit}' is forced open")]
    ForcedOpen { circuit: String },
}

impl CallRejected {
    /// Name of the circuit that rejected the call
    pub fn circuit(&self) -> &str {
        match self {
            CallRejected::Open { circuit, .. }
            | CallRejected::HalfOpenLimitReached { circuit, .. }
            | CallRejected::ForcedOpen { circuit } => circuit,
        }
    }
}

/// Errors returned by the circuit breaker call wrappers
#[derive(Debug, Error)]
pub enum CircuitError<E = Box<dyn Error + Send + Sync>> {
    /// The breaker refused the call
    #[error(transparent)]
    Rejected(#[from] CallRejected),

    /// The wrapped operation (or its fallback) failed
    #[error("Circuit execution failed: {0}")]
    Execution(#[source] E),
}

impl<E> CircuitError<E> {
    pub fn is_rejected(&self) -> bool {
        matches!(self, CircuitError::Rejected(_))
    }

    /// The underlying operation error, if the call was executed
    pub fn into_execution(self) -> Option<E> {
        match self {
            CircuitError::Execution(e) => Some(e),
            CircuitError::Rejected(_) => None,
        }
    }
}
