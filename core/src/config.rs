//! Circuit breaker configuration

use crate::errors::ConfigError;
use std::time::Duration;

/// Circuit breaker configuration
///
/// Thresholds are percentages in `(0, 100]`. Build through
/// [`CircuitBuilder`](crate::CircuitBuilder) or fill the struct directly and
/// hand it to [`CircuitBreaker::new`](crate::CircuitBreaker::new); either
/// way it is validated before a breaker exists.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Failure rate (percent) at or above which the circuit opens
    pub failure_rate_threshold: f64,

    /// Slow-call rate (percent) at or above which the circuit opens
    pub slow_call_rate_threshold: f64,

    /// Calls taking at least this long are recorded as slow
    pub slow_call_duration_threshold: Duration,

    /// Number of most recent outcomes kept in the sliding window
    pub sliding_window_size: usize,

    /// Outcomes required before rates are evaluated
    pub minimum_number_of_calls: usize,

    /// How long the circuit stays open before allowing trial calls
    pub wait_duration_in_open_state: Duration,

    /// Maximum trial calls in flight while half-open, and the number of
    /// completed trials that decides the next state
    pub permitted_calls_in_half_open_state: usize,

    /// Jitter factor for the open-state wait (0.0 = no jitter, 1.0 = full jitter)
    /// Uses chrono-machines formula: wait * (1 - jitter + rand * jitter)
    pub jitter_factor: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 50.0,
            slow_call_rate_threshold: 100.0,
            slow_call_duration_threshold: Duration::from_secs(60),
            sliding_window_size: 100,
            minimum_number_of_calls: 100,
            wait_duration_in_open_state: Duration::from_secs(60),
            permitted_calls_in_half_open_state: 10,
            jitter_factor: 0.0,
        }
    }
}

impl Config {
    /// Check every field and the relations between them
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sliding_window_size == 0 {
            return Err(ConfigError::ZeroWindowSize);
        }
        if self.minimum_number_of_calls == 0 {
            return Err(ConfigError::ZeroMinimumCalls);
        }
        if self.minimum_number_of_calls > self.sliding_window_size {
            return Err(ConfigError::MinimumCallsExceedsWindow {
                minimum: self.minimum_number_of_calls,
                window: self.sliding_window_size,
            });
        }
        if self.permitted_calls_in_half_open_state == 0 {
            return Err(ConfigError::ZeroHalfOpenCalls);
        }
        check_percentage("failure_rate_threshold", self.failure_rate_threshold)?;
        check_percentage("slow_call_rate_threshold", self.slow_call_rate_threshold)?;
        if self.slow_call_duration_threshold.is_zero() {
            return Err(ConfigError::ZeroSlowCallDuration);
        }
        if !(0.0..=1.0).contains(&self.jitter_factor) {
            return Err(ConfigError::JitterOutOfRange(self.jitter_factor));
        }
        Ok(())
    }

    /// Open-state wait for one trip, with jitter applied when configured
    pub(crate) fn open_wait(&self) -> Duration {
        if self.jitter_factor <= 0.0 {
            return self.wait_duration_in_open_state;
        }

        // The policy is unit-agnostic; feed it nanoseconds so short waits keep
        // their precision
        let base_ns =
            u64::try_from(self.wait_duration_in_open_state.as_nanos()).unwrap_or(u64::MAX);
        let policy = chrono_machines::Policy {
            max_attempts: 1,
            base_delay_ms: base_ns,
            multiplier: 1.0,
            max_delay_ms: base_ns,
        };
        let wait_ns = policy.calculate_delay(1, self.jitter_factor);
        Duration::from_nanos(wait_ns as u64)
    }
}

fn check_percentage(name: &'static str, value: f64) -> Result<(), ConfigError> {
    // NaN fails both comparisons
    if value > 0.0 && value <= 100.0 {
        Ok(())
    } else {
        Err(ConfigError::ThresholdOutOfRange { name, value })
    }
}
