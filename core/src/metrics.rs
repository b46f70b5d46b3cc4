//! Point-in-time metrics for a circuit breaker

use crate::circuit::CircuitState;
use crate::window::{Counts, SlidingWindow};
use std::fmt;

/// Snapshot of a breaker's state and sliding window
///
/// Rates are percentages; `None` means the window has not yet seen
/// `minimum_number_of_calls` outcomes in the current state.
#[derive(Debug, Clone, PartialEq)]
pub struct Metrics {
    pub circuit: String,
    pub state: CircuitState,
    pub failure_rate: Option<f64>,
    pub slow_call_rate: Option<f64>,
    pub counts: Counts,
}

impl Metrics {
    pub(crate) fn capture(circuit: &str, state: CircuitState, window: &SlidingWindow) -> Self {
        Self {
            circuit: circuit.to_string(),
            state,
            failure_rate: window.failure_rate(),
            slow_call_rate: window.slow_call_rate(),
            counts: window.counts(),
        }
    }

    pub fn total_calls(&self) -> usize {
        self.counts.total
    }

    pub fn successful_calls(&self) -> usize {
        self.counts.successful
    }

    pub fn failed_calls(&self) -> usize {
        self.counts.failed
    }

    pub fn slow_calls(&self) -> usize {
        self.counts.slow
    }

    pub fn not_permitted_calls(&self) -> u64 {
        self.counts.not_permitted
    }
}

struct Rate(Option<f64>);

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(rate) => write!(f, "{:.1}%", rate),
            None => f.write_str("n/a"),
        }
    }
}

impl fmt::Display for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] failure_rate={} slow_call_rate={} calls={} successful={} failed={} slow={} not_permitted={}",
            self.circuit,
            self.state,
            Rate(self.failure_rate),
            Rate(self.slow_call_rate),
            self.counts.total,
            self.counts.successful,
            self.counts.failed,
            self.counts.slow,
            self.counts.not_permitted,
        )
    }
}
