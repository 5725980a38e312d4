//! Client-side token rate limiting
//!
//! Continuous-refill token buckets, one per provider, admitting requests
//! by estimated token cost before any bytes leave the process. Estimation
//! is deliberately rough; the point is smoothing outbound pressure, not
//! exact accounting.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::error::AiError;
use crate::types::{ChatOptions, ContentPart, MessageContent};

/// What to do when the bucket cannot cover a request right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitMode {
    /// Wait for refill, up to the configured bound, then admit.
    Block,
    /// Fail immediately with a rate-limit error carrying the wait hint.
    Reject,
}

/// Per-provider bucket settings.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Sustained token budget. Also the default burst capacity.
    pub tokens_per_minute: u64,
    /// Optional request-count budget, enforced alongside tokens.
    pub requests_per_minute: Option<u64>,
    /// Token bucket capacity; defaults to one minute of budget.
    pub burst: Option<u64>,
    pub mode: RateLimitMode,
    /// Upper bound on a blocking wait before giving up.
    pub max_wait: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            tokens_per_minute: 90_000,
            requests_per_minute: None,
            burst: None,
            mode: RateLimitMode::Block,
            max_wait: Duration::from_secs(30),
        }
    }
}

impl RateLimitConfig {
    pub fn new(tokens_per_minute: u64) -> Self {
        Self {
            tokens_per_minute,
            ..Self::default()
        }
    }

    pub fn with_requests_per_minute(mut self, requests_per_minute: u64) -> Self {
        self.requests_per_minute = Some(requests_per_minute);
        self
    }

    pub fn with_burst(mut self, burst: u64) -> Self {
        self.burst = Some(burst);
        self
    }

    pub fn with_mode(mut self, mode: RateLimitMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    fn capacity(&self) -> f64 {
        self.burst.unwrap_or(self.tokens_per_minute) as f64
    }

    fn refill_per_sec(&self) -> f64 {
        self.tokens_per_minute as f64 / 60.0
    }
}

struct Bucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn full(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// How long until `cost` tokens are available; zero when they already
    /// are. A zero refill rate yields a saturated wait, which every mode
    /// turns into a rejection.
    fn wait_for(&self, cost: f64) -> Duration {
        if self.tokens >= cost {
            return Duration::ZERO;
        }
        Duration::try_from_secs_f64((cost - self.tokens) / self.refill_per_sec)
            .unwrap_or(Duration::MAX)
    }
}

struct ProviderBuckets {
    tokens: Bucket,
    requests: Option<Bucket>,
}

/// Token buckets keyed by provider id. Providers without an explicit
/// config share the default.
pub struct RateLimiter {
    default: RateLimitConfig,
    per_provider: HashMap<String, RateLimitConfig>,
    buckets: Mutex<HashMap<String, ProviderBuckets>>,
}

impl RateLimiter {
    pub fn new(default: RateLimitConfig) -> Self {
        Self {
            default,
            per_provider: HashMap::new(),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_provider_limit(
        mut self,
        provider: impl Into<String>,
        config: RateLimitConfig,
    ) -> Self {
        self.per_provider.insert(provider.into(), config);
        self
    }

    fn config_for(&self, provider: &str) -> &RateLimitConfig {
        self.per_provider.get(provider).unwrap_or(&self.default)
    }

    /// Admit a request of `cost` estimated tokens against the provider's
    /// buckets, waiting for refill in blocking mode. Token and request
    /// budgets are both enforced when configured.
    pub async fn acquire(&self, provider: &str, cost: u64) -> Result<(), AiError> {
        let config = self.config_for(provider);
        let cost = (cost as f64).min(config.capacity());

        let wait = {
            let mut buckets = self.buckets.lock().await;
            let entry = buckets
                .entry(provider.to_string())
                .or_insert_with(|| ProviderBuckets {
                    tokens: Bucket::full(config.capacity(), config.refill_per_sec()),
                    requests: config
                        .requests_per_minute
                        .map(|rpm| Bucket::full(rpm as f64, rpm as f64 / 60.0)),
                });

            let now = Instant::now();
            entry.tokens.refill(now);
            let mut wait = entry.tokens.wait_for(cost);
            if let Some(requests) = &mut entry.requests {
                requests.refill(now);
                wait = wait.max(requests.wait_for(1.0));
            }

            if !wait.is_zero() && (config.mode == RateLimitMode::Reject || wait > config.max_wait)
            {
                return Err(AiError::RateLimit {
                    provider: provider.to_string(),
                    message: format!(
                        "client-side rate limit: {cost:.0} tokens requested, refill due in {:.1}s",
                        wait.as_secs_f64()
                    ),
                    retry_after: Some(wait),
                });
            }
            // Take the debt now so concurrent callers queue behind it.
            entry.tokens.tokens -= cost;
            if let Some(requests) = &mut entry.requests {
                requests.tokens -= 1.0;
            }
            if wait.is_zero() {
                return Ok(());
            }
            wait
        };

        tracing::debug!(
            provider,
            wait_ms = wait.as_millis() as u64,
            "rate limit bucket empty, waiting for refill"
        );
        tokio::time::sleep(wait).await;
        Ok(())
    }
}

/// Characters-per-token divisor used by the estimator.
fn divisor(provider: &str) -> f64 {
    match provider {
        "anthropic" => 3.5,
        _ => 4.0,
    }
}

const TOKENS_PER_MESSAGE: u64 = 4;
const TOKENS_PER_IMAGE: u64 = 85;

/// Estimate the token cost of a chat request: character count scaled by a
/// per-provider divisor, plus flat per-message and per-image charges, plus
/// the requested output budget when one is set.
pub fn estimate_tokens(provider: &str, options: &ChatOptions) -> u64 {
    let divisor = divisor(provider);
    let mut total = 0u64;

    if let Some(system) = &options.system_prompt {
        total += (system.len() as f64 / divisor).ceil() as u64 + TOKENS_PER_MESSAGE;
    }
    for message in &options.messages {
        total += TOKENS_PER_MESSAGE;
        total += (message.content.text_len() as f64 / divisor).ceil() as u64;
        if let MessageContent::Parts(parts) = &message.content {
            total += parts
                .iter()
                .filter(|p| matches!(p, ContentPart::Image { .. } | ContentPart::ImageUrl { .. }))
                .count() as u64
                * TOKENS_PER_IMAGE;
        }
    }
    total + u64::from(options.max_tokens.unwrap_or(0))
}
