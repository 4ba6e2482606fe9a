//! Circuit breaker guarding edge cache I/O.
//!
//! One breaker per operation class is shared by every request, so a failing
//! store trips it quickly for everyone.
//!
//! | State    | Event            | Next     |
//! |----------|------------------|----------|
//! | Closed   | Failure (>= threshold consecutive) | Open |
//! | Open     | CoolDownElapsed  | HalfOpen |
//! | HalfOpen | Success          | Closed   |
//! | HalfOpen | Failure          | Open     |
//!
//! Every other pair leaves the state unchanged.

use std::time::{Duration, Instant};

use imgedge_config::CircuitBreakerConfig;
use imgedge_core::CacheError;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Operations flow normally
    Closed,
    /// Operations are rejected until the cool-down elapses
    Open,
    /// One trial operation is allowed
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerEvent {
    Success,
    /// `consecutive` includes this failure
    Failure { consecutive: u32 },
    CoolDownElapsed,
}

/// The transition table.
pub fn next_state(state: CircuitState, event: BreakerEvent, threshold: u32) -> CircuitState {
    use BreakerEvent::*;
    use CircuitState::*;
    match (state, event) {
        (Closed, Failure { consecutive }) if consecutive >= threshold => Open,
        (Open, CoolDownElapsed) => HalfOpen,
        (HalfOpen, Success) => Closed,
        (HalfOpen, Failure { .. }) => Open,
        (state, _) => state,
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    last_failure: Option<Instant>,
    trial_in_flight: bool,
}

/// Snapshot for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub since_last_failure: Option<Duration>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    operation: String,
    failure_threshold: u32,
    reset_timeout: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(operation: impl Into<String>, failure_threshold: u32, reset_timeout: Duration) -> Self {
        Self {
            operation: operation.into(),
            failure_threshold: failure_threshold.max(1),
            reset_timeout,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                last_failure: None,
                trial_in_flight: false,
            }),
        }
    }

    pub fn from_config(operation: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        Self::new(
            operation,
            config.failure_threshold,
            Duration::from_millis(config.reset_timeout_ms),
        )
    }

    pub fn operation(&self) -> &str {
        &self.operation
    }

    /// Current state, moving Open to HalfOpen if the cool-down has elapsed.
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.check_cool_down(&mut inner);
        inner.state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.inner.lock();
        self.check_cool_down(&mut inner);
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            since_last_failure: inner.last_failure.map(|t| t.elapsed()),
        }
    }

    /// Ask permission for one operation. Fails fast while open.
    pub fn try_acquire(&self) -> Result<(), CacheError> {
        let mut inner = self.inner.lock();
        self.check_cool_down(&mut inner);
        match inner.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                Ok(())
            }
            _ => Err(CacheError::circuit_open(&self.operation)),
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        self.transition(&mut inner, BreakerEvent::Success);
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        let consecutive = inner.consecutive_failures;
        self.transition(&mut inner, BreakerEvent::Failure { consecutive });
    }

    fn check_cool_down(&self, inner: &mut BreakerInner) {
        if inner.state == CircuitState::Open
            && inner
                .opened_at
                .is_some_and(|opened| opened.elapsed() >= self.reset_timeout)
        {
            self.transition(inner, BreakerEvent::CoolDownElapsed);
        }
    }

    fn transition(&self, inner: &mut BreakerInner, event: BreakerEvent) {
        let from = inner.state;
        let to = next_state(from, event, self.failure_threshold);
        if from == to {
            return;
        }
        inner.state = to;
        match to {
            CircuitState::Open => {
                inner.opened_at = Some(Instant::now());
                inner.trial_in_flight = false;
                warn!(
                    operation = %self.operation,
                    failures = inner.consecutive_failures,
                    cool_down_ms = self.reset_timeout.as_millis() as u64,
                    "circuit opened"
                );
            }
            CircuitState::HalfOpen => {
                inner.trial_in_flight = false;
                info!(operation = %self.operation, "circuit half-open, allowing trial operation");
            }
            CircuitState::Closed => {
                inner.opened_at = None;
                inner.trial_in_flight = false;
                info!(operation = %self.operation, "circuit closed");
            }
        }
        crate::metrics::record_circuit_transition(&self.operation, to.as_str());
    }
}
