//! Circuit breaker for control-plane calls.
//!
//! A node registers every few seconds. When the registry is down there is no
//! point queueing more attempts behind slow timeouts, so registry calls go
//! through a breaker built on `recloser`.
//!
//! ```text
//!   Closed ──failure rate over window──► Open ──open_wait──► HalfOpen
//!     ▲                                                         │
//!     └──────────────── half_open_calls succeed ────────────────┘
//! ```
//!
//! Only retryable errors count against the circuit. A registry that answers
//! 4xx is up and talking; that is the caller's problem, not an outage.

use crate::error::{ReplicationError, Result};
use crate::metrics;
use recloser::{AsyncRecloser, Error as RecloserError, Recloser};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

/// Circuit breaker state for metrics/monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed = 0,
    HalfOpen = 1,
    Open = 2,
}

#[derive(Debug, Clone)]
pub struct CircuitConfig {
    /// Calls the failure rate is measured over while closed.
    pub window: usize,
    /// Failure rate over a full window that opens the circuit.
    pub failure_rate: f32,
    /// Trial calls let through while half-open.
    pub half_open_calls: usize,
    /// How long the circuit stays open before trial calls.
    pub open_wait: Duration,
}

impl Default for CircuitConfig {
    /// Registry calls: half of the last five registrations failing opens
    /// the circuit for roughly one registration interval.
    fn default() -> Self {
        Self {
            window: 5,
            failure_rate: 0.5,
            half_open_calls: 2,
            open_wait: Duration::from_secs(30),
        }
    }
}

impl CircuitConfig {
    /// Small window, fast recovery.
    pub fn testing() -> Self {
        Self {
            window: 2,
            failure_rate: 0.5,
            half_open_calls: 1,
            open_wait: Duration::from_millis(50),
        }
    }
}

/// A named breaker over calls returning the crate [`Result`].
pub struct CircuitBreaker {
    name: String,
    inner: AsyncRecloser,
    successes: AtomicU64,
    failures: AtomicU64,
    rejections: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitConfig) -> Self {
        let recloser = Recloser::custom()
            .error_rate(config.failure_rate)
            .closed_len(config.window.max(1))
            .half_open_len(config.half_open_calls.max(1))
            .open_wait(config.open_wait)
            .build();

        Self {
            name: name.into(),
            inner: recloser.into(),
            successes: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `f` unless the circuit is open.
    ///
    /// A rejection surfaces as [`ReplicationError::CircuitOpen`].
    pub async fn call<F, Fut, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let counts = |e: &ReplicationError| e.is_retryable();
        match self.inner.call_with(counts, f()).await {
            Ok(value) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
                metrics::record_circuit_call(&self.name, "success");
                metrics::set_circuit_state(&self.name, CircuitState::Closed);
                Ok(value)
            }
            Err(RecloserError::Rejected) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                metrics::record_circuit_call(&self.name, "rejected");
                metrics::record_circuit_rejection(&self.name);
                metrics::set_circuit_state(&self.name, CircuitState::Open);
                warn!(circuit = %self.name, "Circuit open, call rejected");
                Err(ReplicationError::CircuitOpen(self.name.clone()))
            }
            Err(RecloserError::Inner(e)) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                metrics::record_circuit_call(&self.name, "failure");
                debug!(circuit = %self.name, error = %e, "Circuit call failed");
                Err(e)
            }
        }
    }

    pub fn successes(&self) -> u64 {
        self.successes.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn rejections(&self) -> u64 {
        self.rejections.load(Ordering::Relaxed)
    }
}
