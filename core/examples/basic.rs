//! Basic circuit breaker usage example
//!
//! Run with `RUST_LOG=windowed_breaker=debug` to see the breaker's own logs.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use windowed_breaker::{
    CallOptions, CircuitBreaker, CircuitRegistry, Config, FallbackReason, ManualClock,
};

/// Error from the simulated remote endpoint
#[derive(Debug)]
struct RemoteError(String);

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Simulated remote endpoint that can be switched between failing and healthy
struct Remote {
    healthy: AtomicBool,
    requests: AtomicUsize,
}

impl Remote {
    fn get(&self) -> Result<String, RemoteError> {
        let n = self.requests.fetch_add(1, Ordering::SeqCst) + 1;
        if self.healthy.load(Ordering::SeqCst) {
            Ok(format!("payload #{}", n))
        } else {
            Err(RemoteError(
                "I/O error on GET request for \"https://some-external-api.com/data\"".to_string(),
            ))
        }
    }
}

/// Service whose remote call is protected by a shared breaker
struct MyService {
    breaker: Arc<CircuitBreaker>,
    remote: Arc<Remote>,
}

impl MyService {
    fn call_external_service(&self) -> String {
        let remote = self.remote.clone();
        let result = self.breaker.call((
            move || remote.get(),
            CallOptions::new().with_fallback(|ctx| {
                Ok(match ctx.reason {
                    FallbackReason::UnderlyingFailed(e) => format!("Fallback response: {}", e),
                    FallbackReason::RejectedByBreaker(rejected) => {
                        format!("CircuitBreaker is OPEN: {}", rejected)
                    }
                })
            }),
        ));

        // The fallback always produces a response
        result.unwrap_or_else(|e| format!("unexpected: {}", e))
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    println!("=== Circuit Breaker Basic Example ===\n");

    // Time is driven by hand so the demo never sleeps
    let clock = Arc::new(ManualClock::new());
    let registry = CircuitRegistry::new().with_clock(clock.clone());

    let breaker = CircuitBreaker::builder("myServiceCircuitBreaker")
        .config(Config {
            failure_rate_threshold: 50.0,
            slow_call_rate_threshold: 50.0,
            slow_call_duration_threshold: Duration::from_secs(2),
            sliding_window_size: 5,
            minimum_number_of_calls: 5,
            wait_duration_in_open_state: Duration::from_secs(10),
            permitted_calls_in_half_open_state: 3,
            jitter_factor: 0.0,
        })
        .clock(clock.clone())
        .on_open(|name| println!("🔴 Circuit '{}' opened!", name))
        .on_close(|name| println!("🟢 Circuit '{}' closed!", name))
        .on_half_open(|name| println!("🟡 Circuit '{}' half-open, testing...", name))
        .build()
        .expect("valid configuration");
    let breaker = registry
        .register_breaker(breaker)
        .expect("name not yet registered");

    let remote = Arc::new(Remote {
        healthy: AtomicBool::new(false),
        requests: AtomicUsize::new(0),
    });
    let service = MyService {
        breaker,
        remote: remote.clone(),
    };

    // Anyone holding the registry reaches the same breaker
    let observed = registry
        .get("myServiceCircuitBreaker")
        .expect("registered above");

    println!("--- Calling a failing remote 10 times ---");
    for i in 1..=10 {
        println!("{:>2}. {}", i, service.call_external_service());
    }
    println!(
        "\nRemote requests sent: {}",
        remote.requests.load(Ordering::SeqCst)
    );
    println!("{}\n", observed.metrics());

    println!("--- Remote recovers, wait elapses ---");
    remote.healthy.store(true, Ordering::SeqCst);
    clock.advance(Duration::from_secs(10));
    for i in 1..=3 {
        println!("{:>2}. {}", i, service.call_external_service());
    }
    println!("State: {}", observed.state_name());

    println!("\n--- Registry ---");
    for metrics in registry.metrics() {
        println!("{}", metrics);
    }
}
