//! Count-based sliding window of call outcomes
//!
//! The window keeps the last `capacity` outcomes in arrival order and
//! maintains running counters, so recording and rate queries are O(1).
//! Rejected calls never enter the buffer; they only bump a separate
//! not-permitted counter.
//!
//! The window is not synchronised. A breaker owns exactly one window and
//! only touches it while holding its own lock.

use crate::CallOutcome;
use std::collections::VecDeque;
use std::time::Duration;

/// Raw outcome counts for observability
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    /// Outcomes currently held in the buffer
    pub total: usize,
    /// `Success` + `SlowSuccess`
    pub successful: usize,
    /// `Failure` + `SlowFailure`
    pub failed: usize,
    /// `SlowSuccess` + `SlowFailure`
    pub slow: usize,
    pub slow_successful: usize,
    pub slow_failed: usize,
    /// Rejected acquisitions since the last reset
    pub not_permitted: u64,
}

/// Fixed-capacity ring buffer of recent call outcomes
#[derive(Debug, Clone)]
pub struct SlidingWindow {
    capacity: usize,
    minimum_calls: usize,
    slow_call_threshold: Duration,
    outcomes: VecDeque<CallOutcome>,
    counts: Counts,
}

impl SlidingWindow {
    /// Create a window holding at most `capacity` outcomes
    ///
    /// Rates stay undefined until `minimum_calls` outcomes are buffered.
    /// Both values are clamped to at least 1; `Config::validate` rejects
    /// zero before a breaker ever builds a window.
    pub fn new(capacity: usize, minimum_calls: usize, slow_call_threshold: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            minimum_calls: minimum_calls.max(1),
            slow_call_threshold,
            outcomes: VecDeque::with_capacity(capacity),
            counts: Counts::default(),
        }
    }

    /// Classify a completed call and record it
    pub fn record_call(&mut self, succeeded: bool, duration: Duration) -> CallOutcome {
        let outcome = CallOutcome::classify(succeeded, duration, self.slow_call_threshold);
        self.record(outcome);
        outcome
    }

    /// Record an already classified outcome, evicting the oldest when full
    pub fn record(&mut self, outcome: CallOutcome) {
        if outcome == CallOutcome::NotPermitted {
            self.counts.not_permitted += 1;
            return;
        }

        if self.outcomes.len() == self.capacity
            && let Some(evicted) = self.outcomes.pop_front()
        {
            self.adjust(evicted, false);
        }

        self.outcomes.push_back(outcome);
        self.adjust(outcome, true);
    }

    /// Failure percentage (0-100) over the buffered outcomes
    ///
    /// `None` until `minimum_calls` outcomes have been recorded.
    pub fn failure_rate(&self) -> Option<f64> {
        self.rate(self.counts.failed)
    }

    /// Slow-call percentage (0-100) over the buffered outcomes
    pub fn slow_call_rate(&self) -> Option<f64> {
        self.rate(self.counts.slow)
    }

    /// Whether enough outcomes are buffered for rates to be defined
    pub fn has_minimum_calls(&self) -> bool {
        self.counts.total >= self.minimum_calls
    }

    pub fn counts(&self) -> Counts {
        self.counts
    }

    pub fn len(&self) -> usize {
        self.outcomes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn minimum_calls(&self) -> usize {
        self.minimum_calls
    }

    /// Buffered outcomes, oldest first
    pub fn outcomes(&self) -> impl Iterator<Item = CallOutcome> + '_ {
        self.outcomes.iter().copied()
    }

    /// Drop every buffered outcome and counter
    pub fn reset(&mut self) {
        self.outcomes.clear();
        self.counts = Counts::default();
    }

    /// Reset and change dimensions
    ///
    /// A half-open breaker shrinks its window to the trial count so trial
    /// rates are judged on trials alone.
    pub fn resize(&mut self, capacity: usize, minimum_calls: usize) {
        self.capacity = capacity.max(1);
        self.minimum_calls = minimum_calls.clamp(1, self.capacity);
        self.outcomes = VecDeque::with_capacity(self.capacity);
        self.counts = Counts::default();
    }

    fn rate(&self, count: usize) -> Option<f64> {
        if !self.has_minimum_calls() {
            return None;
        }
        Some(count as f64 * 100.0 / self.counts.total as f64)
    }

    fn adjust(&mut self, outcome: CallOutcome, added: bool) {
        let apply = |value: &mut usize| {
            if added {
                *value += 1;
            } else {
                *value -= 1;
            }
        };

        apply(&mut self.counts.total);
        match outcome {
            CallOutcome::Success => apply(&mut self.counts.successful),
            CallOutcome::Failure => apply(&mut self.counts.failed),
            CallOutcome::SlowSuccess => {
                apply(&mut self.counts.successful);
                apply(&mut self.counts.slow);
                apply(&mut self.counts.slow_successful);
            }
            CallOutcome::SlowFailure => {
                apply(&mut self.counts.failed);
                apply(&mut self.counts.slow);
                apply(&mut self.counts.slow_failed);
            }
            CallOutcome::NotPermitted => {}
        }
    }
}
