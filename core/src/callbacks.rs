//! Callback system for circuit breaker events
//!
//! Callbacks run after the breaker has released its lock, so they may
//! query the breaker that fired them.

use crate::circuit::CircuitState;
use std::sync::Arc;

pub type NameCallback = Arc<dyn Fn(&str) + Send + Sync>;
pub type TransitionCallback = Arc<dyn Fn(&str, CircuitState, CircuitState) + Send + Sync>;

/// Callbacks for circuit breaker events
#[derive(Clone, Default)]
pub struct Callbacks {
    pub on_open: Option<NameCallback>,
    pub on_close: Option<NameCallback>,
    pub on_half_open: Option<NameCallback>,
    pub on_state_transition: Option<TransitionCallback>,
    pub on_call_not_permitted: Option<NameCallback>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the generic transition hook, then the hook for the target state
    pub fn trigger_transition(&self, circuit: &str, from: CircuitState, to: CircuitState) {
        if let Some(ref callback) = self.on_state_transition {
            callback(circuit, from, to);
        }

        let specific = match to {
            CircuitState::Open => self.on_open.as_ref(),
            CircuitState::Closed => self.on_close.as_ref(),
            CircuitState::HalfOpen => self.on_half_open.as_ref(),
            CircuitState::Disabled | CircuitState::ForcedOpen => None,
        };
        if let Some(callback) = specific {
            callback(circuit);
        }
    }

    pub fn trigger_not_permitted(&self, circuit: &str) {
        if let Some(ref callback) = self.on_call_not_permitted {
            callback(circuit);
        }
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_open", &self.on_open.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_half_open", &self.on_half_open.is_some())
            .field("on_state_transition", &self.on_state_transition.is_some())
            .field("on_call_not_permitted", &self.on_call_not_permitted.is_some())
            .finish()
    }
}
