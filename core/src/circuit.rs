//! Circuit breaker implementation using state machines
//!
//! The lifecycle (Closed → Open → HalfOpen → Closed/Open) is a dynamic
//! `state_machines` machine whose guards read the sliding window held in the
//! machine context. A `CircuitBreaker` wraps that machine in a single mutex:
//! acquisition, outcome recording and every transition happen inside one
//! critical section, while the protected operation runs outside of it.
//!
//! Every transition bumps a generation counter. Permits remember the
//! generation they were granted under, and outcomes reported for an older
//! generation are discarded.

use crate::{
    CallOutcome,
    builder::CircuitBuilder,
    callbacks::Callbacks,
    classifier::{FailureClassifier, FailureContext},
    clock::{Clock, MonotonicClock},
    config::Config,
    errors::{CallRejected, CircuitError, ConfigError},
    metrics::Metrics,
    window::SlidingWindow,
};
use state_machines::state_machine;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Observable breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Calls flow and outcomes are recorded
    Closed,
    /// Calls are rejected until the open-state wait elapses
    Open,
    /// A limited number of trial calls decide whether to close or reopen
    HalfOpen,
    /// Calls flow and nothing is recorded (operator override)
    Disabled,
    /// Calls are rejected until an operator closes the circuit
    ForcedOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "Closed",
            CircuitState::Open => "Open",
            CircuitState::HalfOpen => "HalfOpen",
            CircuitState::Disabled => "Disabled",
            CircuitState::ForcedOpen => "ForcedOpen",
        }
    }

    fn from_machine(name: &str) -> Self {
        match name {
            "Open" => CircuitState::Open,
            "HalfOpen" => CircuitState::HalfOpen,
            "Disabled" => CircuitState::Disabled,
            "ForcedOpen" => CircuitState::ForcedOpen,
            "Closed" => CircuitState::Closed,
            other => {
                debug_assert!(false, "unknown machine state {other}");
                CircuitState::Closed
            }
        }
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a fallback was invoked
#[derive(Debug)]
pub enum FallbackReason<E> {
    /// The breaker refused the call; the operation never ran
    RejectedByBreaker(CallRejected),
    /// The operation ran and returned this error
    UnderlyingFailed(E),
}

/// Context provided to fallback closures
#[derive(Debug)]
pub struct FallbackContext<E> {
    /// Circuit name
    pub circuit_name: String,
    /// Circuit state after the call was settled
    pub state: CircuitState,
    pub reason: FallbackReason<E>,
}

/// Type alias for fallback function
pub type FallbackFn<T, E> = Box<dyn FnOnce(FallbackContext<E>) -> Result<T, E> + Send>;

/// Options for circuit breaker calls
pub struct CallOptions<T, E> {
    /// Called when the breaker rejects the call or the operation fails
    pub fallback: Option<FallbackFn<T, E>>,
}

impl<T, E> Default for CallOptions<T, E> {
    fn default() -> Self {
        Self { fallback: None }
    }
}

impl<T, E> CallOptions<T, E> {
    /// Create new call options with no fallback
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a fallback function
    pub fn with_fallback<F>(mut self, f: F) -> Self
    where
        F: FnOnce(FallbackContext<E>) -> Result<T, E> + Send + 'static,
    {
        self.fallback = Some(Box::new(f));
        self
    }
}

/// Type alias for callable function
pub type CallableFn<'a, T, E> = Box<dyn FnOnce() -> Result<T, E> + 'a>;

/// Trait for converting into CallOptions - allows flexible call() API
pub trait IntoCallOptions<'a, T, E> {
    fn into_call_options(self) -> (CallableFn<'a, T, E>, CallOptions<T, E>);
}

/// Plain closures run without a fallback
impl<'a, T, E, F> IntoCallOptions<'a, T, E> for F
where
    F: FnOnce() -> Result<T, E> + 'a,
{
    fn into_call_options(self) -> (CallableFn<'a, T, E>, CallOptions<T, E>) {
        (Box::new(self), CallOptions::default())
    }
}

impl<'a, T, E, F> IntoCallOptions<'a, T, E> for (F, CallOptions<T, E>)
where
    F: FnOnce() -> Result<T, E> + 'a,
{
    fn into_call_options(self) -> (CallableFn<'a, T, E>, CallOptions<T, E>) {
        (Box::new(self.0), self.1)
    }
}

/// Circuit breaker context - shared data across all states
#[derive(Clone)]
pub struct CircuitContext {
    pub name: String,
    pub config: Config,
    pub window: Arc<Mutex<SlidingWindow>>,
    pub clock: Arc<dyn Clock>,
}

impl CircuitContext {
    fn new(name: String, config: Config, clock: Arc<dyn Clock>) -> Self {
        let window = SlidingWindow::new(
            config.sliding_window_size,
            config.minimum_number_of_calls,
            config.slow_call_duration_threshold,
        );

        Self {
            name,
            config,
            window: Arc::new(Mutex::new(window)),
            clock,
        }
    }

    fn window(&self) -> MutexGuard<'_, SlidingWindow> {
        self.window.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the failure or slow-call rate has reached its threshold
    ///
    /// Both rates are undefined, and so never exceeded, below the window's
    /// minimum number of calls.
    fn thresholds_exceeded(&self) -> bool {
        let window = self.window();
        let failing = window
            .failure_rate()
            .is_some_and(|rate| rate >= self.config.failure_rate_threshold);
        let slow = window
            .slow_call_rate()
            .is_some_and(|rate| rate >= self.config.slow_call_rate_threshold);
        failing || slow
    }

    fn reset_window_for_closed(&self) {
        self.window().resize(
            self.config.sliding_window_size,
            self.config.minimum_number_of_calls,
        );
    }
}

impl Default for CircuitContext {
    fn default() -> Self {
        Self::new(
            String::new(),
            Config::default(),
            Arc::new(MonotonicClock::new()),
        )
    }
}

impl fmt::Debug for CircuitContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitContext")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("window", &self.window)
            .field("clock", &self.clock)
            .finish()
    }
}

/// Data specific to the Open state
#[derive(Debug, Clone, Default)]
pub struct OpenData {
    /// Clock reading when the circuit opened
    pub opened_at: Duration,
    /// Wait before trial calls are allowed (jitter already applied)
    pub wait: Duration,
}

/// Data specific to the HalfOpen state
#[derive(Debug, Clone, Default)]
pub struct HalfOpenData {
    /// Trials dispatched and not yet reported
    pub in_flight: usize,
    /// Trials reported as success or failure
    pub completed: usize,
}

// Define the circuit breaker state machine with dynamic mode
state_machine! {
    name: Circuit,
    context: CircuitContext,
    dynamic: true,

    initial: Closed,
    states: [
        Closed,
        Open(OpenData),
        HalfOpen(HalfOpenData),
        Disabled,
        ForcedOpen,
    ],
    events {
        trip {
            guards: [should_open],
            transition: { from: [Closed, HalfOpen], to: Open }
        }
        attempt_reset {
            guards: [wait_elapsed],
            transition: { from: Open, to: HalfOpen }
        }
        close {
            guards: [should_close],
            transition: { from: HalfOpen, to: Closed }
        }
        disable {
            transition: { from: [Closed, Open, HalfOpen, ForcedOpen], to: Disabled }
        }
        force_open {
            transition: { from: [Closed, Open, HalfOpen, Disabled], to: ForcedOpen }
        }
    }
}

impl Circuit<Closed> {
    fn should_open(&self, ctx: &CircuitContext) -> bool {
        ctx.thresholds_exceeded()
    }
}

impl Circuit<HalfOpen> {
    /// All trials are in and at least one rate is over its threshold
    fn should_open(&self, ctx: &CircuitContext) -> bool {
        self.trials_completed(ctx) && ctx.thresholds_exceeded()
    }

    /// All trials are in and both rates are under their thresholds
    fn should_close(&self, ctx: &CircuitContext) -> bool {
        self.trials_completed(ctx) && !ctx.thresholds_exceeded()
    }

    fn trials_completed(&self, ctx: &CircuitContext) -> bool {
        self.state_data_half_open()
            .is_some_and(|data| data.completed >= ctx.config.permitted_calls_in_half_open_state)
    }
}

impl Circuit<Open> {
    fn wait_elapsed(&self, ctx: &CircuitContext) -> bool {
        self.state_data_open()
            .is_some_and(|data| ctx.clock.now().saturating_sub(data.opened_at) >= data.wait)
    }
}

/// Everything guarded by the breaker lock
struct CircuitCore {
    machine: DynamicCircuit,
    context: CircuitContext,
    generation: u64,
    /// Transitions made under the current lock, fired once it is released
    transitions: Vec<(CircuitState, CircuitState)>,
}

impl CircuitCore {
    fn new(context: CircuitContext) -> Self {
        Self {
            machine: DynamicCircuit::new(context.clone()),
            context,
            generation: 0,
            transitions: Vec::new(),
        }
    }

    fn state(&self) -> CircuitState {
        CircuitState::from_machine(self.machine.current_state())
    }

    /// Grant a permit (returning its generation) or reject the call
    fn acquire(&mut self) -> Result<u64, CallRejected> {
        // Only the caller holding the lock when the wait has elapsed can
        // move the circuit to HalfOpen; it takes the first trial slot.
        if self.state() == CircuitState::Open
            && self.machine.handle(CircuitEvent::AttemptReset).is_ok()
        {
            self.enter_half_open();
        }

        match self.state() {
            CircuitState::Closed | CircuitState::Disabled => Ok(self.generation),
            CircuitState::HalfOpen => {
                let limit = self.context.config.permitted_calls_in_half_open_state;
                let granted = match self.machine.half_open_data_mut() {
                    Some(data) if data.in_flight < limit => {
                        data.in_flight += 1;
                        true
                    }
                    _ => false,
                };

                if granted {
                    Ok(self.generation)
                } else {
                    Err(self.reject(CallRejected::HalfOpenLimitReached {
                        circuit: self.context.name.clone(),
                        limit,
                    }))
                }
            }
            CircuitState::Open => {
                let remaining = self
                    .machine
                    .open_data()
                    .map(|data| {
                        (data.opened_at + data.wait).saturating_sub(self.context.clock.now())
                    })
                    .unwrap_or_default();
                Err(self.reject(CallRejected::Open {
                    circuit: self.context.name.clone(),
                    remaining,
                }))
            }
            CircuitState::ForcedOpen => Err(self.reject(CallRejected::ForcedOpen {
                circuit: self.context.name.clone(),
            })),
        }
    }

    fn reject(&mut self, rejection: CallRejected) -> CallRejected {
        self.context.window().record(CallOutcome::NotPermitted);
        debug!(
            circuit = %self.context.name,
            state = %self.state(),
            reason = %rejection,
            "call not permitted"
        );
        rejection
    }

    /// Record a finished call and evaluate transitions
    ///
    /// Returns `None` when the outcome was not recorded: the permit belongs
    /// to an earlier generation, or the circuit is disabled.
    fn complete(
        &mut self,
        generation: u64,
        succeeded: bool,
        duration: Duration,
    ) -> Option<CallOutcome> {
        if generation != self.generation {
            debug!(
                circuit = %self.context.name,
                state = %self.state(),
                permit_generation = generation,
                current_generation = self.generation,
                "discarding outcome of a call granted before the last transition"
            );
            return None;
        }

        match self.state() {
            CircuitState::Closed => {
                let outcome = self.context.window().record_call(succeeded, duration);
                if self.machine.handle(CircuitEvent::Trip).is_ok() {
                    self.enter_open(CircuitState::Closed);
                }
                Some(outcome)
            }
            CircuitState::HalfOpen => {
                let outcome = self.context.window().record_call(succeeded, duration);
                if let Some(data) = self.machine.half_open_data_mut() {
                    data.in_flight = data.in_flight.saturating_sub(1);
                    data.completed += 1;
                }

                if self.machine.handle(CircuitEvent::Trip).is_ok() {
                    self.enter_open(CircuitState::HalfOpen);
                } else if self.machine.handle(CircuitEvent::Close).is_ok() {
                    self.enter_closed();
                }
                Some(outcome)
            }
            // Open and ForcedOpen never grant permits in their own generation
            CircuitState::Disabled | CircuitState::Open | CircuitState::ForcedOpen => None,
        }
    }

    /// Give a permit back without recording an outcome
    fn release(&mut self, generation: u64) {
        if generation != self.generation {
            return;
        }
        if let Some(data) = self.machine.half_open_data_mut() {
            data.in_flight = data.in_flight.saturating_sub(1);
        }
    }

    fn enter_open(&mut self, from: CircuitState) {
        let now = self.context.clock.now();
        let wait = self.context.config.open_wait();
        if let Some(data) = self.machine.open_data_mut() {
            data.opened_at = now;
            data.wait = wait;
        }

        {
            let mut window = self.context.window();
            warn!(
                circuit = %self.context.name,
                from = %from,
                failure_rate = window.failure_rate(),
                slow_call_rate = window.slow_call_rate(),
                wait_ms = wait.as_millis() as u64,
                "circuit opened"
            );
            window.reset();
        }
        self.transitioned(from, CircuitState::Open);
    }

    fn enter_half_open(&mut self) {
        let trials = self.context.config.permitted_calls_in_half_open_state;
        self.context.window().resize(trials, trials);
        self.transitioned(CircuitState::Open, CircuitState::HalfOpen);
    }

    fn enter_closed(&mut self) {
        self.context.reset_window_for_closed();
        self.transitioned(CircuitState::HalfOpen, CircuitState::Closed);
    }

    /// Operator transition to Disabled or ForcedOpen
    fn force(&mut self, event: CircuitEvent, to: CircuitState) -> bool {
        let from = self.state();
        if from == to || self.machine.handle(event).is_err() {
            return false;
        }
        self.context.reset_window_for_closed();
        self.transitioned(from, to);
        true
    }

    /// Rebuild the machine in Closed, dropping all recorded outcomes
    fn restart(&mut self) {
        let from = self.state();
        self.machine = DynamicCircuit::new(self.context.clone());
        self.context.reset_window_for_closed();
        if from == CircuitState::Closed {
            self.generation += 1;
        } else {
            self.transitioned(from, CircuitState::Closed);
        }
    }

    fn transitioned(&mut self, from: CircuitState, to: CircuitState) {
        self.generation += 1;
        info!(
            circuit = %self.context.name,
            from = %from,
            to = %to,
            "circuit state transition"
        );
        self.transitions.push((from, to));
    }
}

/// Permission to run one protected call
///
/// Report the outcome with [`CircuitBreaker::on_success`] /
/// [`CircuitBreaker::on_failure`] (or the shorthands on the permit). A
/// permit dropped without a report is released: it frees its half-open
/// trial slot and records nothing.
#[must_use = "a permit must be reported with on_success/on_failure or released"]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    generation: Option<u64>,
    acquired_at: Duration,
}

impl Permit<'_> {
    /// Time since the permit was granted, on the breaker's clock
    pub fn elapsed(&self) -> Duration {
        self.breaker.clock.now().saturating_sub(self.acquired_at)
    }

    /// Report success, timed from acquisition
    pub fn on_success(self) -> Option<CallOutcome> {
        let duration = self.elapsed();
        let breaker = self.breaker;
        breaker.on_success(self, duration)
    }

    /// Report failure, timed from acquisition
    pub fn on_failure(self) -> Option<CallOutcome> {
        let duration = self.elapsed();
        let breaker = self.breaker;
        breaker.on_failure(self, duration)
    }

    /// Give the permit back without recording anything
    pub fn release(self) {
        let breaker = self.breaker;
        breaker.release_permission(self);
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if let Some(generation) = self.generation.take() {
            self.breaker.with_core(|core| core.release(generation));
        }
    }
}

impl fmt::Debug for Permit<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Permit")
            .field("circuit", &self.breaker.name)
            .field("generation", &self.generation)
            .field("acquired_at", &self.acquired_at)
            .finish()
    }
}

/// Circuit breaker public API
///
/// Shared by reference (usually through an `Arc`) between every caller of
/// one protected operation.
pub struct CircuitBreaker {
    name: String,
    config: Config,
    clock: Arc<dyn Clock>,
    failure_classifier: Option<Arc<dyn FailureClassifier>>,
    callbacks: Callbacks,
    core: Mutex<CircuitCore>,
}

impl CircuitBreaker {
    /// Create a circuit breaker with default clock and no callbacks
    pub fn new(name: impl Into<String>, config: Config) -> Result<Self, ConfigError> {
        CircuitBuilder::new(name).config(config).build()
    }

    /// Create a new circuit breaker builder
    pub fn builder(name: impl Into<String>) -> CircuitBuilder {
        CircuitBuilder::new(name)
    }

    /// Assemble a breaker from validated parts (used by builder)
    pub(crate) fn from_parts(
        name: String,
        config: Config,
        clock: Arc<dyn Clock>,
        failure_classifier: Option<Arc<dyn FailureClassifier>>,
        callbacks: Callbacks,
    ) -> Self {
        debug!(
            circuit = %name,
            failure_rate_threshold = config.failure_rate_threshold,
            slow_call_rate_threshold = config.slow_call_rate_threshold,
            sliding_window_size = config.sliding_window_size,
            minimum_number_of_calls = config.minimum_number_of_calls,
            "creating circuit breaker"
        );

        let context = CircuitContext::new(name.clone(), config.clone(), clock.clone());
        Self {
            name,
            config,
            clock,
            failure_classifier,
            callbacks,
            core: Mutex::new(CircuitCore::new(context)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Ask for permission to run the protected operation
    ///
    /// In Open state, the first acquisition after the wait has elapsed moves
    /// the circuit to HalfOpen and is granted. Rejections are counted as
    /// not-permitted calls.
    pub fn try_acquire_permission(&self) -> Result<Permit<'_>, CallRejected> {
        let result = self.with_core(|core| core.acquire());

        match result {
            Ok(generation) => Ok(Permit {
                breaker: self,
                generation: Some(generation),
                acquired_at: self.clock.now(),
            }),
            Err(rejection) => {
                self.callbacks.trigger_not_permitted(&self.name);
                Err(rejection)
            }
        }
    }

    /// Report a successful call
    ///
    /// Returns the recorded outcome, or `None` if the outcome was discarded
    /// because the circuit changed state since the permit was granted.
    pub fn on_success(&self, permit: Permit<'_>, duration: Duration) -> Option<CallOutcome> {
        self.complete(permit, true, duration)
    }

    /// Report a failed call
    pub fn on_failure(&self, permit: Permit<'_>, duration: Duration) -> Option<CallOutcome> {
        self.complete(permit, false, duration)
    }

    /// Return a permit without recording an outcome
    ///
    /// A permit granted by another breaker is released on that breaker.
    pub fn release_permission(&self, mut permit: Permit<'_>) {
        if !self.owns(&permit) {
            self.log_foreign(&permit);
            return;
        }
        if let Some(generation) = permit.generation.take() {
            self.with_core(|core| core.release(generation));
        }
    }

    fn complete(
        &self,
        mut permit: Permit<'_>,
        succeeded: bool,
        duration: Duration,
    ) -> Option<CallOutcome> {
        if !self.owns(&permit) {
            // Dropping the permit releases it on the breaker that granted it
            self.log_foreign(&permit);
            return None;
        }
        let generation = permit.generation.take()?;
        self.with_core(|core| core.complete(generation, succeeded, duration))
    }

    fn owns(&self, permit: &Permit<'_>) -> bool {
        std::ptr::eq(permit.breaker, self)
    }

    fn log_foreign(&self, permit: &Permit<'_>) {
        debug!(
            circuit = %self.name,
            permit_circuit = %permit.breaker.name,
            "ignoring permit granted by another circuit"
        );
    }

    /// Current state; never triggers a transition
    pub fn state(&self) -> CircuitState {
        self.lock().state()
    }

    /// Get current state name
    pub fn state_name(&self) -> &'static str {
        self.state().as_str()
    }

    /// Check if circuit is open
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Check if circuit is closed
    pub fn is_closed(&self) -> bool {
        self.state() == CircuitState::Closed
    }

    /// Snapshot of state, rates and counts
    pub fn metrics(&self) -> Metrics {
        let core = self.lock();
        let window = core.context.window();
        Metrics::capture(&self.name, core.state(), &window)
    }

    /// Stop recording and let every call through
    pub fn transition_to_disabled(&self) -> bool {
        self.with_core(|core| core.force(CircuitEvent::Disable, CircuitState::Disabled))
    }

    /// Reject every call until the circuit is closed again
    pub fn transition_to_forced_open(&self) -> bool {
        self.with_core(|core| core.force(CircuitEvent::ForceOpen, CircuitState::ForcedOpen))
    }

    /// Close the circuit from any other state
    ///
    /// Returns `false` if it was already closed.
    pub fn transition_to_closed(&self) -> bool {
        self.with_core(|core| {
            if core.state() == CircuitState::Closed {
                false
            } else {
                core.restart();
                true
            }
        })
    }

    /// Clear all outcomes and reset circuit to Closed state
    ///
    /// Calls still in flight are discarded when they report.
    pub fn reset(&self) {
        self.with_core(|core| core.restart());
    }

    /// Execute a fallible operation with circuit breaker protection
    ///
    /// Accepts either:
    /// - A plain closure: `circuit.call(|| api_request())`
    /// - A closure with options: `circuit.call((|| api_request(), CallOptions::new().with_fallback(...)))`
    ///
    /// With a fallback, both rejections and operation errors are handed to
    /// it; its result becomes the call's result.
    pub fn call<'a, I, T, E>(&self, input: I) -> Result<T, CircuitError<E>>
    where
        I: IntoCallOptions<'a, T, E>,
        E: 'static,
    {
        let (f, options) = input.into_call_options();

        let permit = match self.try_acquire_permission() {
            Ok(permit) => permit,
            Err(rejection) => return self.rejected_call(rejection, options),
        };

        let result = f();
        self.settle(permit, result, options)
    }

    /// Async counterpart of [`call`](Self::call)
    ///
    /// The breaker lock is never held across the operation's await points.
    pub async fn call_async<F, Fut, T, E>(
        &self,
        f: F,
        options: CallOptions<T, E>,
    ) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: 'static,
    {
        let permit = match self.try_acquire_permission() {
            Ok(permit) => permit,
            Err(rejection) => return self.rejected_call(rejection, options),
        };

        let result = f().await;
        self.settle(permit, result, options)
    }

    fn rejected_call<T, E>(
        &self,
        rejection: CallRejected,
        options: CallOptions<T, E>,
    ) -> Result<T, CircuitError<E>> {
        match options.fallback {
            Some(fallback) => {
                let ctx = FallbackContext {
                    circuit_name: self.name.clone(),
                    state: self.state(),
                    reason: FallbackReason::RejectedByBreaker(rejection),
                };
                fallback(ctx).map_err(CircuitError::Execution)
            }
            None => Err(CircuitError::Rejected(rejection)),
        }
    }

    fn settle<T, E: 'static>(
        &self,
        permit: Permit<'_>,
        result: Result<T, E>,
        options: CallOptions<T, E>,
    ) -> Result<T, CircuitError<E>> {
        let duration = permit.elapsed();

        match result {
            Ok(value) => {
                self.on_success(permit, duration);
                Ok(value)
            }
            Err(error) => {
                if self.should_record(&error, duration) {
                    self.on_failure(permit, duration);
                } else {
                    debug!(circuit = %self.name, "error ignored by failure classifier");
                    self.release_permission(permit);
                }

                match options.fallback {
                    Some(fallback) => {
                        let ctx = FallbackContext {
                            circuit_name: self.name.clone(),
                            state: self.state(),
                            reason: FallbackReason::UnderlyingFailed(error),
                        };
                        fallback(ctx).map_err(CircuitError::Execution)
                    }
                    None => Err(CircuitError::Execution(error)),
                }
            }
        }
    }

    /// Ask the failure classifier whether this error counts
    fn should_record<E: 'static>(&self, error: &E, duration: Duration) -> bool {
        self.failure_classifier.as_ref().is_none_or(|classifier| {
            classifier.should_trip(&FailureContext {
                circuit_name: &self.name,
                error: error as &dyn Any,
                duration,
            })
        })
    }

    fn lock(&self) -> MutexGuard<'_, CircuitCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` under the breaker lock, then fire callbacks for any
    /// transitions it made
    fn with_core<R>(&self, f: impl FnOnce(&mut CircuitCore) -> R) -> R {
        let (result, transitions) = {
            let mut core = self.lock();
            let result = f(&mut core);
            (result, std::mem::take(&mut core.transitions))
        };

        for (from, to) in transitions {
            self.callbacks.trigger_transition(&self.name, from, to);
        }
        result
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("config", &self.config)
            .field("callbacks", &self.callbacks)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const WAIT: Duration = Duration::from_secs(10);
    const SLOW: Duration = Duration::from_secs(2);

    /// Breaker with minimum 5 calls, 50% thresholds, 3 half-open trials
    fn circuit(clock: &Arc<ManualClock>) -> CircuitBreaker {
        CircuitBreaker::builder("test")
            .failure_rate_threshold(50.0)
            .slow_call_rate_threshold(50.0)
            .slow_call_duration_threshold(SLOW)
            .sliding_window_size(10)
            .minimum_number_of_calls(5)
            .wait_duration_in_open_state(WAIT)
            .permitted_calls_in_half_open_state(3)
            .clock(clock.clone())
            .build()
            .expect("valid config")
    }

    fn record(circuit: &CircuitBreaker, succeeded: bool) {
        let permit = circuit.try_acquire_permission().expect("permitted");
        if succeeded {
            circuit.on_success(permit, Duration::from_millis(10));
        } else {
            circuit.on_failure(permit, Duration::from_millis(10));
        }
    }

    fn open(circuit: &CircuitBreaker) {
        for _ in 0..5 {
            record(circuit, false);
        }
        assert_eq!(circuit.state(), CircuitState::Open);
    }

    fn half_open<'a>(circuit: &'a CircuitBreaker, clock: &ManualClock) -> Permit<'a> {
        open(circuit);
        clock.advance(WAIT);
        let permit = circuit.try_acquire_permission().expect("first trial");
        assert_eq!(circuit.state(), CircuitState::HalfOpen);
        permit
    }

    #[test]
    fn test_circuit_breaker_creation() {
        let circuit = CircuitBreaker::new("test", Config::default()).unwrap();

        assert!(circuit.is_closed());
        assert!(!circuit.is_open());
        assert_eq!(circuit.state_name(), "Closed");
    }

    #[test]
    fn test_invalid_config_fails_construction() {
        let config = Config {
            sliding_window_size: 5,
            minimum_number_of_calls: 6,
            ..Default::default()
        };

        let result = CircuitBreaker::new("test", config);
        assert!(matches!(
            result,
            Err(ConfigError::MinimumCallsExceedsWindow {
                minimum: 6,
                window: 5
            })
        ));
    }

    #[test]
    fn test_stays_closed_below_minimum_calls() {
        let clock = Arc::new(ManualClock::new());
        let circuit = circuit(&clock);

        for _ in 0..4 {
            record(&circuit, false);
            assert!(circuit.is_closed(), "Circuit opened before minimum calls");
        }

        let metrics = circuit.metrics();
        assert_eq!(metrics.failure_rate, None);
        assert_eq!(metrics.slow_call_rate, None);
        assert_eq!(metrics.failed_calls(), 4);
    }

    #[test]
    fn test_opens_at_failure_rate_threshold() {
        let clock = Arc::new(ManualClock::new());
        let circuit = circuit(&clock);

        record(&circuit, true);
        record(&circuit, false);
        record(&circuit, true);
        record(&circuit, false);
        assert!(circuit.is_closed());

        // 3 failures out of 5 = 60%
        record(&circuit, false);
        assert!(circuit.is_open(), "Circuit did not open at rate threshold");

        // Window is cleared on the way into Open
        let metrics = circuit.metrics();
        assert_eq!(metrics.total_calls(), 0);
        assert_eq!(metrics.failure_rate, None);
    }

    #[test]
    fn test_stays_closed_under_threshold() {
        let clock = Arc::new(ManualClock::new());
        let circuit = circuit(&clock);

        // Successes first so the rate never crosses 50% on the way
        for i in 0..10 {
            record(&circuit, i < 6);
        }
        assert!(circuit.is_closed());
        assert_eq!(circuit.metrics().failure_rate, Some(40.0));
    }

    #[test]
    fn test_opens_on_slow_call_rate() {
        let clock = Arc::new(ManualClock::new());
        let circuit = circuit(&clock);

        for _ in 0..2 {
            let permit = circuit.try_acquire_permission().unwrap();
            circuit.on_success(permit, Duration::from_millis(5));
        }
        for _ in 0..2 {
            let permit = circuit.try_acquire_permission().unwrap();
            assert_eq!(
                circuit.on_success(permit, SLOW),
                Some(CallOutcome::SlowSuccess)
            );
        }
        assert!(circuit.is_closed());

        let permit = circuit.try_acquire_permission().unwrap();
        circuit.on_success(permit, SLOW * 3);

        // 3 slow calls out of 5 = 60%, all of them successful
        assert!(circuit.is_open());
    }

    #[test]
    fn test_rejects_until_wait_elapsed() {
        let clock = Arc::new(ManualClock::new());
        let circuit = circuit(&clock);
        open(&circuit);

        for _ in 0..3 {
            match circuit.try_acquire_permission() {
                Err(CallRejected::Open { circuit, remaining }) => {
                    assert_eq!(circuit, "test");
                    assert_eq!(remaining, WAIT);
                }
                other => panic!("Expected Open rejection, got {:?}", other),
            }
        }

        clock.advance(WAIT - Duration::from_millis(1));
        match circuit.try_acquire_permission() {
            Err(CallRejected::Open { remaining, .. }) => {
                assert_eq!(remaining, Duration::from_millis(1))
            }
            other => panic!("Expected Open rejection, got {:?}", other),
        }
        assert_eq!(circuit.metrics().not_permitted_calls(), 4);
        assert_eq!(circuit.metrics().total_calls(), 0);

        clock.advance(Duration::from_millis(1));
        let permit = circuit.try_acquire_permission();
        assert!(permit.is_ok(), "Call crossing the wait should be permitted");
        assert_eq!(circuit.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_caps_in_flight_trials() {
        let clock = Arc::new(ManualClock::new());
        let circuit = circuit(&clock);
        let first = half_open(&circuit, &clock);

        let second = circuit.try_acquire_permission().expect("second trial");
        let third = circuit.try_acquire_permission().expect("third trial");

        match circuit.try_acquire_permission() {
            Err(CallRejected::HalfOpenLimitReached { limit, .. }) => assert_eq!(limit, 3),
            other => panic!("Expected HalfOpenLimitReached, got {:?}", other),
        }
        assert_eq!(circuit.metrics().not_permitted_calls(), 1);
        assert_eq!(circuit.state(), CircuitState::HalfOpen);

        // Completing one trial frees a slot
        circuit.on_success(first, Duration::from_millis(5));
        let fourth = circuit.try_acquire_permission();
        assert!(fourth.is_ok());

        drop(second);
        drop(third);
    }

    #[test]
    fn test_half_open_successes_close_and_clear_window() {
        let clock = Arc::new(ManualClock::new());
        let circuit = circuit(&clock);
        let first = half_open(&circuit, &clock);

        circuit.on_success(first, Duration::from_millis(5));
        record(&circuit, true);
        assert_eq!(circuit.state(), CircuitState::HalfOpen);
        record(&circuit, true);

        assert!(circuit.is_closed());
        assert_eq!(circuit.metrics().total_calls(), 0);

        // A single failure stays below minimum calls
        record(&circuit, false);
        assert!(circuit.is_closed());
        assert_eq!(circuit.metrics().failure_rate, None);
    }

    #[test]
    fn test_half_open_one_failure_of_three_closes() {
        let clock = Arc::new(ManualClock::new());
        let circuit = circuit(&clock);
        let first = half_open(&circuit, &clock);

        circuit.on_failure(first, Duration::from_millis(5));
        record(&circuit, true);
        record(&circuit, true);

        // 33% is below the 50% threshold
        assert!(circuit.is_closed());
    }

    #[test]
    fn test_half_open_failures_reopen_and_restart_timer() {
        let clock = Arc::new(ManualClock::new());
        let circuit = circuit(&clock);
        let first = half_open(&circuit, &clock);

        clock.advance(Duration::from_secs(3));
        circuit.on_failure(first, Duration::from_millis(5));
        record(&circuit, true);
        assert_eq!(circuit.state(), CircuitState::HalfOpen);
        record(&circuit, false);

        assert!(circuit.is_open());

        // The wait restarts from the reopen, not from the first trip
        clock.advance(WAIT - Duration::from_secs(1));
        assert!(circuit.try_acquire_permission().is_err());
        clock.advance(Duration::from_secs(1));
        assert!(circuit.try_acquire_permission().is_ok());
        assert_eq!(circuit.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_half_open_slow_trials_reopen() {
        let clock = Arc::new(ManualClock::new());
        let circuit = circuit(&clock);
        let first = half_open(&circuit, &clock);

        circuit.on_success(first, SLOW);
        let second = circuit.try_acquire_permission().unwrap();
        circuit.on_success(second, SLOW);
        record(&circuit, true);

        assert!(circuit.is_open());
    }

    #[test]
    fn test_state_reads_are_idempotent() {
        let clock = Arc::new(ManualClock::new());
        let circuit = circuit(&clock);
        open(&circuit);
        clock.advance(WAIT * 2);

        // The wait has elapsed, but only an acquisition moves the circuit
        for _ in 0..5 {
            assert_eq!(circuit.state(), CircuitState::Open);
            assert!(circuit.is_open());
            let _ = circuit.metrics();
        }
    }

    #[test]
    fn test_stale_half_open_outcome_is_discarded() {
        let clock = Arc::new(ManualClock::new());
        let circuit = circuit(&clock);
        let slow_trial = half_open(&circuit, &clock);

        // Faster trials decide the half-open phase while the slow one runs
        let second = circuit.try_acquire_permission().unwrap();
        let third = circuit.try_acquire_permission().unwrap();
        circuit.on_failure(second, Duration::from_millis(5));
        circuit.on_failure(third, Duration::from_millis(5));
        assert_eq!(circuit.state(), CircuitState::HalfOpen);
        let fourth = circuit.try_acquire_permission().unwrap();
        circuit.on_failure(fourth, Duration::from_millis(5));
        assert!(circuit.is_open());

        let before = circuit.metrics();
        assert_eq!(circuit.on_success(slow_trial, SLOW), None);
        assert_eq!(circuit.metrics(), before);
        assert!(circuit.is_open());
    }

    #[test]
    fn test_stale_closed_outcome_is_discarded_after_trip() {
        let clock = Arc::new(ManualClock::new());
        let circuit = circuit(&clock);

        let straggler = circuit.try_acquire_permission().unwrap();
        open(&circuit);
        assert_eq!(circuit.on_failure(straggler, Duration::from_millis(5)), None);

        clock.advance(WAIT);
        let trial = circuit.try_acquire_permission().unwrap();
        assert_eq!(circuit.metrics().total_calls(), 0);
        drop(trial);
    }

    #[test]
    fn test_dropped_permit_releases_half_open_slot() {
        let clock = Arc::new(ManualClock::new());
        let circuit = circuit(&clock);
        let first = half_open(&circuit, &clock);
        let second = circuit.try_acquire_permission().unwrap();
        let third = circuit.try_acquire_permission().unwrap();
        assert!(circuit.try_acquire_permission().is_err());

        drop(first);
        let replacement = circuit.try_acquire_permission();
        assert!(replacement.is_ok());
        assert_eq!(circuit.metrics().total_calls(), 0);

        drop(second);
        drop(third);
    }

    #[test]
    fn test_permit_shorthands_time_from_acquisition() {
        let clock = Arc::new(ManualClock::new());
        let circuit = circuit(&clock);

        let permit = circuit.try_acquire_permission().unwrap();
        clock.advance(SLOW);
        assert_eq!(permit.on_failure(), Some(CallOutcome::SlowFailure));

        let permit = circuit.try_acquire_permission().unwrap();
        assert_eq!(permit.on_success(), Some(CallOutcome::Success));

        let permit = circuit.try_acquire_permission().unwrap();
        permit.release();

        let counts = circuit.metrics().counts;
        assert_eq!(counts.total, 2);
        assert_eq!(counts.slow_failed, 1);
    }

    #[test]
    fn test_foreign_permit_is_not_recorded() {
        let clock = Arc::new(ManualClock::new());
        let single = |name: &str| {
            CircuitBreaker::builder(name)
                .sliding_window_size(1)
                .minimum_number_of_calls(1)
                .permitted_calls_in_half_open_state(1)
                .wait_duration_in_open_state(WAIT)
                .clock(clock.clone())
                .build()
                .unwrap()
        };
        let a = single("a");
        let b = single("b");

        let permit = a.try_acquire_permission().unwrap();
        assert_eq!(b.on_failure(permit, Duration::ZERO), None);
        assert!(b.is_closed());
        assert_eq!(b.metrics().total_calls(), 0);
        assert_eq!(a.metrics().total_calls(), 0);

        // Open and half-open `a`, then hand its only trial to `b`
        let _ = a.call(|| Err::<(), _>("boom"));
        assert!(a.is_open());
        clock.advance(WAIT);
        let trial = a.try_acquire_permission().unwrap();
        assert!(a.try_acquire_permission().is_err());
        b.release_permission(trial);

        // The slot went back to `a`, not `b`
        assert_eq!(a.state(), CircuitState::HalfOpen);
        assert!(a.try_acquire_permission().is_ok());
        assert!(b.is_closed());
    }

    #[test]
    fn test_state_names_map_back_to_states() {
        for state in [
            CircuitState::Closed,
            CircuitState::Open,
            CircuitState::HalfOpen,
            CircuitState::Disabled,
            CircuitState::ForcedOpen,
        ] {
            assert_eq!(CircuitState::from_machine(state.as_str()), state);
        }
    }

    #[test]
    fn test_sub_millisecond_jittered_wait_is_kept() {
        let clock = Arc::new(ManualClock::new());
        let circuit = CircuitBreaker::builder("test")
            .sliding_window_size(1)
            .minimum_number_of_calls(1)
            .wait_duration_in_open_state(Duration::from_micros(900))
            .jitter_factor(0.5)
            .clock(clock.clone())
            .build()
            .unwrap();

        let _ = circuit.call(|| Err::<(), _>("boom"));
        assert!(matches!(
            circuit.try_acquire_permission(),
            Err(CallRejected::Open { .. })
        ));
        assert!(circuit.is_open());

        clock.advance(Duration::from_micros(900));
        assert!(circuit.try_acquire_permission().is_ok());
        assert_eq!(circuit.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn test_call_records_outcomes() {
        let clock = Arc::new(ManualClock::new());
        let circuit = circuit(&clock);

        let ok = circuit.call(|| Ok::<_, String>("data"));
        assert_eq!(ok.unwrap(), "data");

        let slow_clock = clock.clone();
        let err = circuit.call(move || {
            slow_clock.advance(SLOW);
            Err::<(), _>("timeout".to_string())
        });
        assert!(matches!(err, Err(CircuitError::Execution(ref e)) if e == "timeout"));

        let counts = circuit.metrics().counts;
        assert_eq!(counts.successful, 1);
        assert_eq!(counts.slow_failed, 1);
    }

    #[test]
    fn test_call_borrows_local_state() {
        let clock = Arc::new(ManualClock::new());
        let circuit = circuit(&clock);
        let mut attempts = 0;

        for _ in 0..3 {
            let _ = circuit.call(|| {
                attempts += 1;
                Ok::<_, String>(())
            });
        }

        assert_eq!(attempts, 3);
    }

    #[test]
    fn test_call_rejected_without_fallback() {
        let clock = Arc::new(ManualClock::new());
        let circuit = circuit(&clock);
        open(&circuit);

        let executed = Arc::new(AtomicUsize::new(0));
        let counter = executed.clone();
        let result = circuit.call(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, String>("should not execute")
        });

        assert!(matches!(
            result,
            Err(CircuitError::Rejected(CallRejected::Open { .. }))
        ));
        assert_eq!(executed.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_fallback_when_rejected() {
        let clock = Arc::new(ManualClock::new());
        let circuit = circuit(&clock);
        open(&circuit);

        let result = circuit.call((
            || Err::<String, _>("should not execute".to_string()),
            CallOptions::new().with_fallback(|ctx| {
                assert_eq!(ctx.circuit_name, "test");
                assert_eq!(ctx.state, CircuitState::Open);
                match ctx.reason {
                    FallbackReason::RejectedByBreaker(rejection) => {
                        Ok(format!("CircuitBreaker is OPEN: {}", rejection))
                    }
                    FallbackReason::UnderlyingFailed(e) => Ok(format!("Fallback response: {}", e)),
                }
            }),
        ));

        assert!(result.unwrap().starts_with("CircuitBreaker is OPEN: Circuit 'test' is open"));
    }

    #[test]
    fn test_fallback_when_operation_fails() {
        let clock = Arc::new(ManualClock::new());
        let circuit = circuit(&clock);

        let result = circuit.call((
            || Err::<String, _>("connection refused".to_string()),
            CallOptions::new().with_fallback(|ctx| match ctx.reason {
                FallbackReason::UnderlyingFailed(e) => Ok(format!("Fallback response: {}", e)),
                FallbackReason::RejectedByBreaker(_) => Err("unexpected rejection".to_string()),
            }),
        ));

        assert_eq!(result.unwrap(), "Fallback response: connection refused");
        // The failure is still recorded
        assert_eq!(circuit.metrics().failed_calls(), 1);
    }

    #[test]
    fn test_fallback_error_propagation() {
        let clock = Arc::new(ManualClock::new());
        let circuit = circuit(&clock);
        open(&circuit);

        let result = circuit.call((
            || Ok::<String, _>("should not execute".to_string()),
            CallOptions::new().with_fallback(|_ctx| Err::<String, _>("fallback error")),
        ));

        match result {
            Err(CircuitError::Execution(e)) => assert_eq!(e, "fallback error"),
            other => panic!("Expected CircuitError::Execution, got {:?}", other),
        }
    }

    #[test]
    fn test_failure_classifier_filters_errors() {
        use crate::classifier::PredicateClassifier;

        let clock = Arc::new(ManualClock::new());
        let circuit = CircuitBreaker::builder("test")
            .sliding_window_size(4)
            .minimum_number_of_calls(2)
            .clock(clock.clone())
            .failure_classifier(Arc::new(PredicateClassifier::new(|ctx| {
                ctx.error
                    .downcast_ref::<&str>()
                    .map(|e| e.contains("server"))
                    .unwrap_or(true)
            })))
            .build()
            .unwrap();

        for _ in 0..5 {
            let result = circuit.call(|| Err::<(), _>("client_error"));
            assert!(matches!(result, Err(CircuitError::Execution("client_error"))));
        }
        assert!(circuit.is_closed(), "Circuit should not trip on filtered errors");
        assert_eq!(circuit.metrics().total_calls(), 0);

        let _ = circuit.call(|| Err::<(), _>("server_error_1"));
        let _ = circuit.call(|| Err::<(), _>("server_error_2"));
        assert!(circuit.is_open(), "Circuit should trip on server errors");
    }

    #[test]
    fn test_ignored_error_frees_half_open_slot() {
        use crate::classifier::PredicateClassifier;

        let clock = Arc::new(ManualClock::new());
        let circuit = CircuitBreaker::builder("test")
            .sliding_window_size(2)
            .minimum_number_of_calls(2)
            .permitted_calls_in_half_open_state(1)
            .wait_duration_in_open_state(WAIT)
            .clock(clock.clone())
            .failure_classifier(Arc::new(PredicateClassifier::new(|ctx| {
                ctx.error.downcast_ref::<&str>() != Some(&"ignored")
            })))
            .build()
            .unwrap();

        let _ = circuit.call(|| Err::<(), _>("boom"));
        let _ = circuit.call(|| Err::<(), _>("boom"));
        assert!(circuit.is_open());
        clock.advance(WAIT);

        let _ = circuit.call(|| Err::<(), _>("ignored"));
        assert_eq!(circuit.state(), CircuitState::HalfOpen);

        // The slot is free again, so the next trial runs and closes the circuit
        let result = circuit.call(|| Ok::<_, &str>("recovered"));
        assert_eq!(result.unwrap(), "recovered");
        assert!(circuit.is_closed());
    }

    #[test]
    fn test_callbacks_fire_on_transitions() {
        let clock = Arc::new(ManualClock::new());
        let events = Arc::new(Mutex::new(Vec::new()));
        let rejected = Arc::new(AtomicUsize::new(0));

        let transitions = events.clone();
        let not_permitted = rejected.clone();
        let circuit = CircuitBreaker::builder("test")
            .sliding_window_size(2)
            .minimum_number_of_calls(2)
            .permitted_calls_in_half_open_state(1)
            .wait_duration_in_open_state(WAIT)
            .clock(clock.clone())
            .on_state_transition(move |_name, from, to| {
                transitions.lock().unwrap().push((from, to));
            })
            .on_call_not_permitted(move |_name| {
                not_permitted.fetch_add(1, Ordering::SeqCst);
            })
            .build()
            .unwrap();

        let _ = circuit.call(|| Err::<(), _>("boom"));
        let _ = circuit.call(|| Err::<(), _>("boom"));
        let _ = circuit.call(|| Ok::<_, &str>(()));
        clock.advance(WAIT);
        let _ = circuit.call(|| Ok::<_, &str>(()));

        assert_eq!(
            *events.lock().unwrap(),
            vec![
                (CircuitState::Closed, CircuitState::Open),
                (CircuitState::Open, CircuitState::HalfOpen),
                (CircuitState::HalfOpen, CircuitState::Closed),
            ]
        );
        assert_eq!(rejected.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_on_open_receives_circuit_name() {
        let clock = Arc::new(ManualClock::new());
        let seen = Arc::new(Mutex::new(None));
        let slot = seen.clone();

        let circuit = Arc::new(
            CircuitBreaker::builder("test")
                .sliding_window_size(1)
                .minimum_number_of_calls(1)
                .clock(clock.clone())
                .on_open(move |name| {
                    *slot.lock().unwrap() = Some(name.to_string());
                })
                .build()
                .unwrap(),
        );

        let _ = circuit.call(|| Err::<(), _>("boom"));

        assert_eq!(seen.lock().unwrap().as_deref(), Some("test"));
        assert!(circuit.is_open());
    }

    #[test]
    fn test_disabled_permits_and_records_nothing() {
        let clock = Arc::new(ManualClock::new());
        let circuit = circuit(&clock);
        open(&circuit);

        assert!(circuit.transition_to_disabled());
        assert_eq!(circuit.state(), CircuitState::Disabled);
        assert!(!circuit.transition_to_disabled());

        for _ in 0..20 {
            let result = circuit.call(|| Err::<(), _>("boom"));
            assert!(matches!(result, Err(CircuitError::Execution("boom"))));
        }
        assert_eq!(circuit.state(), CircuitState::Disabled);
        assert_eq!(circuit.metrics().total_calls(), 0);
    }

    #[test]
    fn test_forced_open_rejects_until_closed() {
        let clock = Arc::new(ManualClock::new());
        let circuit = circuit(&clock);

        assert!(circuit.transition_to_forced_open());
        clock.advance(WAIT * 10);

        let result = circuit.call(|| Ok::<_, String>(()));
        assert!(matches!(
            result,
            Err(CircuitError::Rejected(CallRejected::ForcedOpen { .. }))
        ));
        assert_eq!(circuit.state(), CircuitState::ForcedOpen);
        assert_eq!(circuit.metrics().not_permitted_calls(), 1);

        assert!(circuit.transition_to_closed());
        assert!(!circuit.transition_to_closed());
        assert!(circuit.call(|| Ok::<_, String>(())).is_ok());
    }

    #[test]
    fn test_reset_clears_state() {
        let clock = Arc::new(ManualClock::new());
        let circuit = circuit(&clock);
        open(&circuit);

        circuit.reset();
        assert!(circuit.is_closed());
        assert_eq!(circuit.metrics().counts, Default::default());
    }

    #[test]
    fn test_reset_discards_in_flight_calls() {
        let clock = Arc::new(ManualClock::new());
        let circuit = circuit(&clock);
        record(&circuit, false);

        let in_flight = circuit.try_acquire_permission().unwrap();
        circuit.reset();

        assert_eq!(circuit.on_failure(in_flight, Duration::ZERO), None);
        assert_eq!(circuit.metrics().total_calls(), 0);
    }

    #[test]
    fn test_jittered_wait_is_fixed_per_trip() {
        let clock = Arc::new(ManualClock::new());
        let circuit = CircuitBreaker::builder("test")
            .sliding_window_size(1)
            .minimum_number_of_calls(1)
            .wait_duration_in_open_state(Duration::from_secs(1))
            .jitter_factor(0.5)
            .clock(clock.clone())
            .build()
            .unwrap();

        let _ = circuit.call(|| Err::<(), _>("boom"));
        let remaining = match circuit.try_acquire_permission() {
            Err(CallRejected::Open { remaining, .. }) => remaining,
            other => panic!("Expected Open rejection, got {:?}", other),
        };
        assert!(remaining >= Duration::from_millis(490) && remaining <= Duration::from_secs(1));

        // Asking again does not re-roll the jitter
        match circuit.try_acquire_permission() {
            Err(CallRejected::Open { remaining: again, .. }) => assert_eq!(again, remaining),
            other => panic!("Expected Open rejection, got {:?}", other),
        }

        clock.advance(remaining);
        assert!(circuit.try_acquire_permission().is_ok());
    }

    #[test]
    fn test_only_one_thread_moves_open_to_half_open() {
        use std::sync::Barrier;
        use std::thread;

        let clock = Arc::new(ManualClock::new());
        let half_opened = Arc::new(AtomicUsize::new(0));
        let counter = half_opened.clone();
        let circuit = Arc::new(
            CircuitBreaker::builder("test")
                .sliding_window_size(1)
                .minimum_number_of_calls(1)
                .permitted_calls_in_half_open_state(3)
                .wait_duration_in_open_state(WAIT)
                .clock(clock.clone())
                .on_half_open(move |_name| {
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .build()
                .unwrap(),
        );

        let _ = circuit.call(|| Err::<(), _>("boom"));
        assert!(circuit.is_open());
        clock.advance(WAIT);

        let barrier = Arc::new(Barrier::new(16));
        let granted = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let circuit = circuit.clone();
                let barrier = barrier.clone();
                let granted = granted.clone();
                thread::spawn(move || {
                    barrier.wait();
                    if let Ok(permit) = circuit.try_acquire_permission() {
                        granted.fetch_add(1, Ordering::SeqCst);
                        // Hold the trial slot until every thread has tried
                        std::mem::forget(permit);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let metrics = circuit.metrics();
        assert_eq!(granted.load(Ordering::SeqCst), 3);
        assert_eq!(metrics.state, CircuitState::HalfOpen);
        assert_eq!(metrics.not_permitted_calls(), 13);
        assert_eq!(half_opened.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_calls_keep_counts_consistent() {
        use std::thread;

        let circuit = Arc::new(
            CircuitBreaker::builder("test")
                .sliding_window_size(1000)
                .minimum_number_of_calls(1000)
                .build()
                .unwrap(),
        );

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let circuit = circuit.clone();
                thread::spawn(move || {
                    for i in 0..100 {
                        if (t + i) % 4 == 0 {
                            let _ = circuit.call(|| Err::<(), _>("boom"));
                        } else {
                            let _ = circuit.call(|| Ok::<_, &str>(()));
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let counts = circuit.metrics().counts;
        assert_eq!(counts.total, 800);
        assert_eq!(counts.failed, 200);
        assert_eq!(counts.successful, 600);
        assert!(circuit.is_closed());
    }

    #[tokio::test]
    async fn test_call_async_records_and_falls_back() {
        let clock = Arc::new(ManualClock::new());
        let circuit = circuit(&clock);

        let ok = circuit
            .call_async(|| async { Ok::<_, String>(7) }, CallOptions::new())
            .await;
        assert_eq!(ok.unwrap(), 7);

        let slow_clock = clock.clone();
        let fallback = circuit
            .call_async(
                move || async move {
                    slow_clock.advance(SLOW);
                    Err::<u32, _>("upstream 503".to_string())
                },
                CallOptions::new().with_fallback(|ctx| match ctx.reason {
                    FallbackReason::UnderlyingFailed(_) => Ok(0),
                    FallbackReason::RejectedByBreaker(r) => Err(r.to_string()),
                }),
            )
            .await;
        assert_eq!(fallback.unwrap(), 0);

        let counts = circuit.metrics().counts;
        assert_eq!(counts.successful, 1);
        assert_eq!(counts.slow_failed, 1);
    }

    #[tokio::test]
    async fn test_call_async_rejected_when_open() {
        let clock = Arc::new(ManualClock::new());
        let circuit = circuit(&clock);
        open(&circuit);

        let result = circuit
            .call_async(|| async { Ok::<_, String>(()) }, CallOptions::new())
            .await;

        assert!(matches!(
            result,
            Err(CircuitError::Rejected(CallRejected::Open { .. }))
        ));
    }
}
