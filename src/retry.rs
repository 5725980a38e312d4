//! Retry policy and executor
//!
//! A policy decides which failures are worth another attempt and how long
//! to wait between them; the executor drives an async operation through
//! the policy. Vendor rate-limit hints (`retry_after`) override the
//! computed delay when present.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::error::{AiError, ErrorKind};

/// Delay schedule between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    /// Same delay every time.
    Fixed(Duration),
    /// Delay grows linearly with the attempt number.
    Linear(Duration),
    /// Decorrelated jitter: each delay is drawn uniformly from
    /// `[base, prev * 3]` and capped. Spreads retry storms without the
    /// lockstep of plain exponential backoff.
    DecorrelatedJitter { base: Duration, cap: Duration },
}

impl Backoff {
    /// Delay before the given retry. `attempt` counts from 1 (the first
    /// retry); `prev` is the previous delay, seeded with the base.
    pub fn delay(&self, attempt: u32, prev: Duration) -> Duration {
        match *self {
            Backoff::Fixed(d) => d,
            Backoff::Linear(d) => d.saturating_mul(attempt),
            Backoff::DecorrelatedJitter { base, cap } => {
                let low = base.as_millis() as u64;
                let high = (prev.as_millis() as u64).saturating_mul(3).max(low + 1);
                let drawn = rand::thread_rng().gen_range(low..high);
                Duration::from_millis(drawn).min(cap)
            }
        }
    }

    fn seed(&self) -> Duration {
        match *self {
            Backoff::Fixed(d) | Backoff::Linear(d) => d,
            Backoff::DecorrelatedJitter { base, .. } => base,
        }
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::DecorrelatedJitter {
            base: Duration::from_millis(500),
            cap: Duration::from_secs(30),
        }
    }
}

/// Callback invoked before each sleep, with the attempt number that just
/// failed and the error that caused it.
pub type RetryCallback = Arc<dyn Fn(u32, &AiError) + Send + Sync>;

/// Retry policy: attempt bound, retryable error kinds, delay schedule,
/// and an optional model fallback map consulted once attempts run out.
#[derive(Clone)]
pub struct RetryConfig {
    /// Total attempt bound, including the first call.
    pub max_attempts: u32,
    /// Error kinds eligible for a retry. An error must both be in this
    /// set and report `is_retryable()` to earn another attempt.
    pub on: HashSet<ErrorKind>,
    pub backoff: Backoff,
    pub on_retry: Option<RetryCallback>,
    /// Model-to-model fallback, applied at most once per call after the
    /// primary model exhausts its attempts.
    pub fallback: HashMap<String, String>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            on: HashSet::from([
                ErrorKind::RateLimit,
                ErrorKind::Overloaded,
                ErrorKind::Api,
                ErrorKind::Network,
                ErrorKind::Stream,
            ]),
            backoff: Backoff::default(),
            on_retry: None,
            fallback: HashMap::new(),
        }
    }
}

impl std::fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_attempts", &self.max_attempts)
            .field("on", &self.on)
            .field("backoff", &self.backoff)
            .field("on_retry", &self.on_retry.is_some())
            .field("fallback", &self.fallback)
            .finish()
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Replace the retryable kind set.
    pub fn retry_on(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.on = kinds.into_iter().collect();
        self
    }

    pub fn with_on_retry(mut self, callback: RetryCallback) -> Self {
        self.on_retry = Some(callback);
        self
    }

    /// Map a primary model to a fallback tried once when the primary
    /// exhausts its attempts.
    pub fn with_fallback(
        mut self,
        model: impl Into<String>,
        fallback: impl Into<String>,
    ) -> Self {
        self.fallback.insert(model.into(), fallback.into());
        self
    }

    /// Whether this failure earns another attempt. Cancellation never
    /// does, regardless of the configured set.
    pub fn should_retry(&self, error: &AiError) -> bool {
        let kind = error.kind();
        kind != ErrorKind::Cancelled && self.on.contains(&kind) && error.is_retryable()
    }

    /// Delay before the next attempt. A vendor `retry_after` hint wins
    /// over the computed schedule.
    fn next_delay(&self, attempt: u32, prev: Duration, error: &AiError) -> Duration {
        error
            .retry_after()
            .unwrap_or_else(|| self.backoff.delay(attempt, prev))
    }

    /// Drive `op` through the policy. The closure receives the attempt
    /// number (1-based) and is re-invoked after each retryable failure
    /// until it succeeds or attempts run out; the last error propagates.
    ///
    /// Model fallback is not handled here; callers that want it rerun the
    /// executor with the substitute model.
    pub async fn execute<T, F, Fut>(&self, mut op: F) -> Result<T, AiError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, AiError>>,
    {
        let mut prev_delay = self.backoff.seed();
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    if attempt >= self.max_attempts || !self.should_retry(&error) {
                        return Err(error);
                    }
                    let delay = self.next_delay(attempt, prev_delay, &error);
                    tracing::debug!(
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "retrying after failure"
                    );
                    if let Some(callback) = &self.on_retry {
                        callback(attempt, &error);
                    }
                    tokio::time::sleep(delay).await;
                    prev_delay = delay;
                    attempt += 1;
                }
            }
        }
    }
}
