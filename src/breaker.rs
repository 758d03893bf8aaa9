//! Circuit breaker for the generation backend.
//!
//! Tracks consecutive generation failures process-wide. Once the threshold
//! is reached the breaker opens and every further attempt fails fast
//! without contacting the backend, until an operator resets it. This is
//! the guard against retry storms when a local inference service goes
//! down.
//!
//! The breaker counter is independent from the orchestrator's per-run
//! validation retry budget; the two never share state.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use serde::{Deserialize, Serialize};

/// Default number of consecutive failures before the breaker opens.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// What the retry policy decided for a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RetryDecision {
    /// Retry automatically with enriched failure context.
    Retry,
    /// Stop retrying; route to human solution resolution.
    Escalate,
    /// Terminate the run.
    Abort,
}

impl std::fmt::Display for RetryDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryDecision::Retry => write!(f, "retry"),
            RetryDecision::Escalate => write!(f, "escalate"),
            RetryDecision::Abort => write!(f, "abort"),
        }
    }
}

/// Inspectable snapshot of the breaker state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitBreakerState {
    /// Current consecutive failure count.
    pub consecutive_failures: u32,
    /// Threshold at which the breaker opens.
    pub threshold: u32,
    /// Whether the breaker is currently open (failing fast).
    pub open: bool,
}

/// Consecutive-failure circuit breaker.
///
/// All mutation happens through `record_success`, `record_failure`, and
/// `reset`; call sites never touch the counter directly.
pub struct CircuitBreaker {
    failures: AtomicU32,
    open: AtomicBool,
    threshold: u32,
}

impl CircuitBreaker {
    /// Creates a breaker that opens after `threshold` consecutive failures.
    pub fn new(threshold: u32) -> Self {
        Self {
            failures: AtomicU32::new(0),
            open: AtomicBool::new(false),
            threshold: threshold.max(1),
        }
    }

    /// Rebuilds a breaker from a persisted snapshot.
    pub fn restore(state: &CircuitBreakerState) -> Self {
        Self {
            failures: AtomicU32::new(state.consecutive_failures),
            open: AtomicBool::new(state.open),
            threshold: state.threshold.max(1),
        }
    }

    /// Records a successful call, resetting the counter to zero.
    pub fn record_success(&self) {
        self.failures.store(0, Ordering::SeqCst);
        self.open.store(false, Ordering::SeqCst);
    }

    /// Records a failed call. Returns true if this failure opened the
    /// breaker.
    pub fn record_failure(&self) -> bool {
        let count = self.failures.fetch_add(1, Ordering::SeqCst) + 1;
        if count >= self.threshold {
            let was_open = self.open.swap(true, Ordering::SeqCst);
            return !was_open;
        }
        false
    }

    /// Whether further attempts should fail fast.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Operator reset: closes the breaker and zeroes the counter.
    pub fn reset(&self) {
        self.failures.store(0, Ordering::SeqCst);
        self.open.store(false, Ordering::SeqCst);
    }

    /// Returns an inspectable snapshot.
    pub fn snapshot(&self) -> CircuitBreakerState {
        CircuitBreakerState {
            consecutive_failures: self.failures.load(Ordering::SeqCst),
            threshold: self.threshold,
            open: self.is_open(),
        }
    }

    /// Decides what to do after a failed validation round-trip.
    ///
    /// `attempt` is the 1-based attempt number just completed and
    /// `max_attempts` is the orchestrator's retry budget for the phase.
    /// The budget and the breaker counter are deliberately independent:
    /// the breaker protects the backend, the budget bounds the run.
    pub fn decide(&self, attempt: u32, max_attempts: u32) -> RetryDecision {
        if self.is_open() {
            RetryDecision::Abort
        } else if attempt >= max_attempts {
            RetryDecision::Escalate
        } else {
            RetryDecision::Retry
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(DEFAULT_FAILURE_THRESHOLD)
    }
}
