//! Three-state circuit breaker for external calls.
//!
//! CLOSED passes calls through and counts failures. Reaching
//! `failure_threshold` trips the breaker to OPEN, where calls short-circuit
//! for `reset_timeout`. The first call after the timeout becomes the single
//! HALF_OPEN probe: success closes the circuit, failure re-opens it with a
//! fresh trip instant.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::time::{Duration, Instant};

/// Breaker state, exposed in health snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Breaker tuning.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the circuit.
    pub failure_threshold: u32,
    /// How long OPEN short-circuits before allowing a probe.
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Error surfaced by [`CircuitBreaker::call`].
#[derive(Debug)]
pub enum BreakerError<E> {
    /// Circuit is open; the underlying call was never issued.
    Open,
    /// The underlying call ran and failed.
    Inner(E),
}

/// Point-in-time view for health reporting.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub last_trip_at: Option<DateTime<Utc>>,
}

struct Inner {
    state: BreakerState,
    failures: u32,
    opened_at: Option<Instant>,
    tripped_at: Option<DateTime<Utc>>,
    probe_started: Option<Instant>,
}

/// A breaker instance guarding one external dependency.
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                failures: 0,
                opened_at: None,
                tripped_at: None,
                probe_started: None,
            }),
        }
    }

    /// Run `op` under the breaker.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        if !self.try_acquire() {
            return Err(BreakerError::Open);
        }
        match op().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err) => {
                self.on_failure();
                Err(BreakerError::Inner(err))
            }
        }
    }

    /// Whether a call may proceed right now. Transitions OPEN to HALF_OPEN
    /// after the reset timeout and admits exactly one probe.
    fn try_acquire(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.config.reset_timeout {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_started = Some(Instant::now());
                    tracing::debug!(breaker = %self.name, "half-open probe admitted");
                    true
                } else {
                    false
                }
            }
            BreakerState::HalfOpen => match inner.probe_started {
                None => {
                    inner.probe_started = Some(Instant::now());
                    true
                }
                // A probe abandoned mid-flight (cancelled cycle) must not
                // wedge the circuit; admit a fresh probe after another
                // reset window.
                Some(started) if started.elapsed() >= self.config.reset_timeout => {
                    inner.probe_started = Some(Instant::now());
                    true
                }
                Some(_) => false,
            },
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner.lock();
        if inner.state != BreakerState::Closed {
            tracing::info!(breaker = %self.name, "circuit closed");
        }
        inner.state = BreakerState::Closed;
        inner.failures = 0;
        inner.opened_at = None;
        inner.probe_started = None;
    }

    fn on_failure(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            BreakerState::HalfOpen => self.trip(&mut inner),
            _ => {
                inner.failures += 1;
                if inner.failures >= self.config.failure_threshold {
                    self.trip(&mut inner);
                }
            }
        }
    }

    fn trip(&self, inner: &mut Inner) {
        inner.state = BreakerState::Open;
        inner.opened_at = Some(Instant::now());
        inner.tripped_at = Some(Utc::now());
        inner.probe_started = None;
        tracing::warn!(
            breaker = %self.name,
            failures = inner.failures,
            "circuit opened"
        );
    }

    /// Current state without side effects.
    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failures,
            last_trip_at: inner.tripped_at,
        }
    }
}
