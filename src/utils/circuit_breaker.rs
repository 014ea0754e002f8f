use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: u32,
    successes: u32,
    opened_at: Option<Instant>,
}

/// Fails calls fast after `max_failures` consecutive errors, then lets a
/// trial call through once `reset_timeout` has elapsed.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: &'static str,
    max_failures: u32,
    half_open_successes: u32,
    reset_timeout: Duration,
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(
        name: &'static str,
        max_failures: u32,
        half_open_successes: u32,
        reset_timeout: Duration,
    ) -> Self {
        Self {
            name,
            max_failures: max_failures.max(1),
            half_open_successes: half_open_successes.max(1),
            reset_timeout,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                opened_at: None,
            }),
        }
    }

    /// Whether a call may proceed. Moves an expired open breaker to half-open.
    pub fn allow(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let expired = inner
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= self.reset_timeout);
                if expired {
                    info!("circuit breaker {} half-open", self.name);
                    inner.state = CircuitState::HalfOpen;
                    inner.successes = 0;
                }
                expired
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::HalfOpen => {
                inner.successes += 1;
                if inner.successes >= self.half_open_successes {
                    info!("circuit breaker {} closed", self.name);
                    inner.state = CircuitState::Closed;
                    inner.failures = 0;
                    inner.successes = 0;
                    inner.opened_at = None;
                }
            }
            _ => inner.failures = 0,
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.failures += 1;
        let trip = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => inner.failures >= self.max_failures,
            CircuitState::Open => false,
        };
        if trip {
            warn!(
                "circuit breaker {} open after {} failures",
                self.name, inner.failures
            );
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.successes = 0;
        }
    }
}
