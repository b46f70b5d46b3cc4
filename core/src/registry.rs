//! Named circuit breakers shared by one application
//!
//! The registry is an ordinary value owned by the application's composition
//! root and passed by reference to whoever needs a breaker. Every lookup of a
//! name yields the same `Arc<CircuitBreaker>`, so all callers of one remote
//! operation share its window and state.

use crate::{
    builder::CircuitBuilder,
    circuit::CircuitBreaker,
    clock::Clock,
    config::Config,
    errors::ConfigError,
    metrics::Metrics,
};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::debug;

/// Map of circuit name to breaker
#[derive(Debug, Default)]
pub struct CircuitRegistry {
    default_config: Config,
    clock: Option<Arc<dyn Clock>>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitRegistry {
    /// Registry whose implicitly created breakers use `Config::default()`
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose implicitly created breakers use `config`
    pub fn with_default_config(config: Config) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            default_config: config,
            ..Self::default()
        })
    }

    /// Time source handed to breakers the registry builds
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn default_config(&self) -> &Config {
        &self.default_config
    }

    /// Build and add a breaker with its own configuration
    ///
    /// Fails if the configuration is invalid or the name is taken; an
    /// existing breaker is never replaced.
    pub fn register(
        &self,
        name: impl Into<String>,
        config: Config,
    ) -> Result<Arc<CircuitBreaker>, ConfigError> {
        let breaker = self.builder(name).config(config).build()?;
        self.insert(breaker)
    }

    /// Add a breaker built elsewhere, e.g. one carrying callbacks
    pub fn register_breaker(
        &self,
        breaker: CircuitBreaker,
    ) -> Result<Arc<CircuitBreaker>, ConfigError> {
        self.insert(breaker)
    }

    /// Breaker registered under `name`, if any
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }

    /// Breaker registered under `name`, created with the default
    /// configuration on first use
    pub fn get_or_create(&self, name: &str) -> Result<Arc<CircuitBreaker>, ConfigError> {
        if let Some(breaker) = self.get(name) {
            return Ok(breaker);
        }

        let mut breakers = self.breakers.write().unwrap_or_else(PoisonError::into_inner);
        // Another caller may have created it between the two locks
        if let Some(breaker) = breakers.get(name) {
            return Ok(breaker.clone());
        }

        let breaker = Arc::new(
            self.builder(name)
                .config(self.default_config.clone())
                .build()?,
        );
        debug!(circuit = %name, "registered circuit breaker with default config");
        breakers.insert(name.to_string(), breaker.clone());
        Ok(breaker)
    }

    /// Drop a breaker from the registry
    ///
    /// Holders of the returned `Arc` keep using it; later lookups of the
    /// name create a fresh breaker.
    pub fn remove(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        let removed = self
            .breakers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(name);
        if removed.is_some() {
            debug!(circuit = %name, "removed circuit breaker");
        }
        removed
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Metrics of every registered breaker, sorted by name
    pub fn metrics(&self) -> Vec<Metrics> {
        let breakers: Vec<Arc<CircuitBreaker>> = self
            .breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        // Snapshot each breaker outside the registry lock
        let mut metrics: Vec<Metrics> = breakers.iter().map(|b| b.metrics()).collect();
        metrics.sort_by(|a, b| a.circuit.cmp(&b.circuit));
        metrics
    }

    pub fn len(&self) -> usize {
        self.breakers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn builder(&self, name: impl Into<String>) -> CircuitBuilder {
        let builder = CircuitBuilder::new(name);
        match &self.clock {
            Some(clock) => builder.clock(clock.clone()),
            None => builder,
        }
    }

    fn insert(&self, breaker: CircuitBreaker) -> Result<Arc<CircuitBreaker>, ConfigError> {
        let mut breakers = self.breakers.write().unwrap_or_else(PoisonError::into_inner);
        if breakers.contains_key(breaker.name()) {
            return Err(ConfigError::DuplicateName(breaker.name().to_string()));
        }

        let name = breaker.name().to_string();
        let breaker = Arc::new(breaker);
        debug!(circuit = %name, "registered circuit breaker");
        breakers.insert(name, breaker.clone());
        Ok(breaker)
    }
}
