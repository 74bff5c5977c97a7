//! Per-service circuit breakers
//!
//! `Closed` → `Open` after `fail_max` consecutive failures → `HalfOpen` once
//! `reset_timeout` has elapsed → `Closed` on a successful trial call, `Open`
//! again on a failed one. While half-open exactly one trial call is in flight;
//! every other caller is rejected with `CircuitOpen`.
//!
//! Each breaker keeps its counter and state under one mutex, so increments,
//! resets and transitions are atomic with respect to concurrent callers.

use crate::config::CircuitBreakerConfig;
use crate::error::{MigrationError, Result};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl BreakerState {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_in_flight: false,
        }
    }
}

/// Circuit breaker guarding one dependency
#[derive(Debug)]
pub struct CircuitBreaker {
    service: String,
    config: CircuitBreakerConfig,
    inner: Mutex<BreakerState>,
}

/// Admission ticket for one call
///
/// Dropping an unsettled trial permit (caller cancelled) frees the half-open
/// slot without changing state.
struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    trial: bool,
    settled: bool,
}

impl Permit<'_> {
    fn settle(mut self, failed: bool) {
        self.settled = true;
        if failed {
            self.breaker.on_failure(self.trial);
        } else {
            self.breaker.on_success(self.trial);
        }
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.trial && !self.settled {
            self.breaker.inner.lock().trial_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    pub fn new(service: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            service: service.into(),
            config,
            inner: Mutex::new(BreakerState::closed()),
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// Current state, accounting for an elapsed reset timeout
    pub fn state(&self) -> CircuitState {
        let mut inner = self.inner.lock();
        self.maybe_half_open(&mut inner);
        inner.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.inner.lock().consecutive_failures
    }

    /// Force the breaker back to `Closed`
    pub fn reset(&self) {
        *self.inner.lock() = BreakerState::closed();
        info!(service = %self.service, "Circuit breaker reset");
    }

    /// Run `operation` under breaker protection
    ///
    /// Returns `CircuitOpen` without invoking `operation` while open. Only
    /// errors that count as dependency failures (`trips_breaker`) advance the
    /// failure counter; any other outcome means the dependency answered.
    pub async fn call<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.acquire()?;
        let result = operation().await;

        let failed = matches!(&result, Err(e) if e.trips_breaker());
        permit.settle(failed);
        result
    }

    fn maybe_half_open(&self, inner: &mut BreakerState) {
        if inner.state != CircuitState::Open {
            return;
        }
        let elapsed = inner
            .opened_at
            .map_or(true, |at| at.elapsed() >= self.config.reset_timeout());
        if elapsed {
            debug!(service = %self.service, "Circuit breaker transitioning to HALF_OPEN");
            inner.state = CircuitState::HalfOpen;
            inner.trial_in_flight = false;
        }
    }

    fn acquire(&self) -> Result<Permit<'_>> {
        let mut inner = self.inner.lock();
        self.maybe_half_open(&mut inner);

        let trial = match inner.state {
            CircuitState::Closed => false,
            CircuitState::HalfOpen if !inner.trial_in_flight => {
                inner.trial_in_flight = true;
                true
            }
            CircuitState::HalfOpen | CircuitState::Open => {
                return Err(MigrationError::CircuitOpen {
                    service: self.service.clone(),
                });
            }
        };

        Ok(Permit {
            breaker: self,
            trial,
            settled: false,
        })
    }

    fn on_success(&self, trial: bool) {
        let mut inner = self.inner.lock();
        if trial {
            info!(service = %self.service, "Circuit breaker CLOSED after successful trial call");
            *inner = BreakerState::closed();
        } else if inner.state == CircuitState::Closed {
            inner.consecutive_failures = 0;
        }
    }

    fn on_failure(&self, trial: bool) {
        let mut inner = self.inner.lock();
        if trial {
            warn!(service = %self.service, "Circuit breaker back to OPEN after failed trial call");
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
            inner.trial_in_flight = false;
            return;
        }

        // Calls admitted before the circuit opened don't extend the open period
        if inner.state != CircuitState::Closed {
            return;
        }

        inner.consecutive_failures += 1;
        if inner.consecutive_failures >= self.config.fail_max {
            warn!(
                service = %self.service,
                failures = inner.consecutive_failures,
                reset_timeout_ms = self.config.reset_timeout_ms,
                "Circuit breaker transitioning to OPEN"
            );
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }
}

/// Breakers keyed by service name, created on first use
#[derive(Debug, Default)]
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    /// Breaker for `service`, registering it if needed
    pub fn breaker(&self, service: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(service, self.config.clone())))
            .clone()
    }

    /// Run `operation` under the breaker for `service`
    pub async fn call<F, Fut, T>(&self, service: &str, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let breaker = self.breaker(service);
        breaker.call(operation).await
    }

    /// State of `service` (`Closed` if never called)
    pub fn state(&self, service: &str) -> CircuitState {
        self.breakers
            .get(service)
            .map(|b| b.state())
            .unwrap_or(CircuitState::Closed)
    }

    pub fn reset(&self, service: &str) {
        if let Some(breaker) = self.breakers.get(service) {
            breaker.reset();
        }
    }

    /// State of every registered breaker
    pub fn snapshot(&self) -> BTreeMap<String, CircuitState> {
        self.breakers
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().state()))
            .collect()
    }
}
