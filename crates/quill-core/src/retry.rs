//! Retry with exponential backoff, and a circuit breaker for degraded dependencies

use std::future::Future;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Backoff policy for retrying an operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    #[serde(default = "default_max_attempts", alias = "max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry
    #[serde(default = "default_backoff_ms", alias = "backoff_ms")]
    pub backoff_ms: u64,
    /// Upper bound on any single delay
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Full jitter: each delay is drawn uniformly from [0, backoff]
    #[serde(default = "default_jitter")]
    pub jitter: bool,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    1000
}

fn default_max_backoff_ms() -> u64 {
    60_000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: default_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Build a policy with a fixed attempt count and initial delay
    pub fn new(max_attempts: u32, backoff: Duration) -> Self {
        Self {
            max_attempts,
            backoff_ms: backoff.as_millis() as u64,
            ..Self::default()
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before retry number `retry` (0 = first retry)
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = self.multiplier.max(1.0).powi(retry.min(32) as i32);
        let base = (self.backoff_ms as f64 * exp).min(self.max_backoff_ms as f64);
        let millis = if self.jitter {
            rand::rng().random_range(0.0..=base)
        } else {
            base
        };
        Duration::from_millis(millis.round() as u64)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the policy is exhausted
pub async fn retry_async<T, F, Fut>(policy: &RetryPolicy, op_name: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_retryable() || attempt >= attempts => {
                debug!(op = op_name, attempt, error = %e, "Giving up");
                return Err(e);
            }
            Err(e) => {
                let delay = policy.delay_for(attempt - 1);
                warn!(
                    op = op_name,
                    attempt,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Operation failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: u32,
    opened_at: Option<Instant>,
}

/// Fails calls fast once a dependency has failed `failure_threshold` times in a row
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            cooldown,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: 0,
                opened_at: None,
            }),
        }
    }

    /// Five failures, one minute cooldown
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self::new(name, 5, Duration::from_secs(60))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Whether a call may go through right now. Moves an expired open breaker to half-open.
    pub fn allow(&self) -> bool {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let expired = inner
                    .opened_at
                    .map(|t| t.elapsed() >= self.cooldown)
                    .unwrap_or(true);
                if expired {
                    debug!(breaker = %self.name, "Cooldown elapsed, half-open");
                    inner.state = CircuitState::HalfOpen;
                }
                expired
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.opened_at = None;
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        inner.failures += 1;
        if inner.state == CircuitState::HalfOpen || inner.failures >= self.failure_threshold {
            if inner.state != CircuitState::Open {
                warn!(breaker = %self.name, failures = inner.failures, "Circuit opened");
            }
            inner.state = CircuitState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    /// Open the breaker immediately
    pub fn trip(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
    }

    /// Run `op` behind the breaker
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if !self.allow() {
            return Err(Error::Degraded(self.name.clone()));
        }
        match op().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                if e.is_retryable() {
                    self.record_failure();
                }
                Err(e)
            }
        }
    }
}
