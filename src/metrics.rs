//! Metrics collection
//!
//! Process-lifetime counters behind a plain mutex: request totals, token
//! and cost accounting, cache effectiveness, and running latency means,
//! bucketed per model and per provider. Recording is disabled entirely
//! when observability is off; every recording call checks the flag first.
//!
//! Cost is looked up from a static price table by longest model-prefix
//! match; unknown models contribute zero cost rather than failing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use serde::Serialize;

use crate::types::{AiLatency, TokenUsage};

lazy_static::lazy_static! {
    /// US dollars per million tokens, (input, output), keyed by model
    /// prefix. Longest matching prefix wins.
    static ref PRICE_TABLE: Vec<(&'static str, f64, f64)> = vec![
        ("gpt-4o-mini", 0.15, 0.60),
        ("gpt-4o", 2.50, 10.00),
        ("gpt-4.1-mini", 0.40, 1.60),
        ("gpt-4.1", 2.00, 8.00),
        ("o3-mini", 1.10, 4.40),
        ("claude-3-5-haiku", 0.80, 4.00),
        ("claude-3-5-sonnet", 3.00, 15.00),
        ("claude-sonnet-4", 3.00, 15.00),
        ("claude-opus-4", 15.00, 75.00),
        ("gemini-1.5-flash", 0.075, 0.30),
        ("gemini-1.5-pro", 1.25, 5.00),
        ("gemini-2.0-flash", 0.10, 0.40),
    ];
}

fn cost_of(model: &str, usage: &TokenUsage) -> f64 {
    let mut best: Option<&(&str, f64, f64)> = None;
    for entry in PRICE_TABLE.iter() {
        if model.starts_with(entry.0)
            && best.is_none_or(|b| entry.0.len() > b.0.len())
        {
            best = Some(entry);
        }
    }
    match best {
        Some((_, input, output)) => {
            f64::from(usage.input_tokens) * input / 1e6
                + f64::from(usage.output_tokens) * output / 1e6
        }
        None => 0.0,
    }
}

fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

/// Running mean without retained samples.
#[derive(Debug, Default, Clone, Copy, Serialize)]
struct RunningMean {
    mean: f64,
    count: u64,
}

impl RunningMean {
    fn observe(&mut self, sample: f64) {
        self.count += 1;
        self.mean += (sample - self.mean) / self.count as f64;
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct BucketSummary {
    pub requests: u64,
    pub failures: u64,
    pub tokens: u64,
    pub cost: f64,
    pub avg_ttft_ms: f64,
    pub avg_total_ms: f64,
}

#[derive(Debug, Default, Clone)]
struct Bucket {
    requests: u64,
    failures: u64,
    tokens: u64,
    cost: f64,
    ttft: RunningMean,
    total: RunningMean,
}

impl Bucket {
    fn summarize(&self) -> BucketSummary {
        BucketSummary {
            requests: self.requests,
            failures: self.failures,
            tokens: self.tokens,
            cost: self.cost,
            avg_ttft_ms: self.ttft.mean,
            avg_total_ms: self.total.mean,
        }
    }
}

#[derive(Debug, Default)]
struct MetricsState {
    total_requests: u64,
    total_failures: u64,
    total_attempts: u64,
    total_tokens: u64,
    total_cost: f64,
    cache_hits: u64,
    cache_lookups: u64,
    ttft: RunningMean,
    total_latency: RunningMean,
    by_model: HashMap<String, Bucket>,
    by_provider: HashMap<String, Bucket>,
}

/// Point-in-time snapshot of everything the collector tracks.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub total_requests: u64,
    pub total_failures: u64,
    pub total_attempts: u64,
    pub total_tokens: u64,
    pub total_cost: f64,
    /// Failed calls over attempts made.
    pub error_rate: f64,
    pub cache_hits: u64,
    pub cache_lookups: u64,
    pub cache_hit_rate: f64,
    pub avg_ttft_ms: f64,
    pub avg_total_ms: f64,
    pub by_model: HashMap<String, BucketSummary>,
    pub by_provider: HashMap<String, BucketSummary>,
}

/// The collector itself. Cheap to share behind an `Arc`.
pub struct Metrics {
    enabled: AtomicBool,
    state: Mutex<MetricsState>,
}

impl Metrics {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
            state: Mutex::new(MetricsState::default()),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MetricsState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Record a completed call that produced a response.
    pub fn record_success(
        &self,
        provider: &str,
        model: &str,
        usage: Option<&TokenUsage>,
        latency: &AiLatency,
        attempts: u32,
    ) {
        if !self.is_enabled() {
            return;
        }
        let tokens = usage.map(|u| u64::from(u.total_tokens)).unwrap_or(0);
        let cost = usage.map(|u| cost_of(model, u)).unwrap_or(0.0);

        let mut state = self.lock();
        let state = &mut *state;
        state.total_requests += 1;
        state.total_attempts += u64::from(attempts);
        state.total_tokens += tokens;
        state.total_cost += cost;
        state.ttft.observe(latency.ttft_ms as f64);
        state.total_latency.observe(latency.total_ms as f64);

        for bucket in [
            state.by_model.entry(model.to_string()).or_default(),
            state.by_provider.entry(provider.to_string()).or_default(),
        ] {
            bucket.requests += 1;
            bucket.tokens += tokens;
            bucket.cost += cost;
            bucket.ttft.observe(latency.ttft_ms as f64);
            bucket.total.observe(latency.total_ms as f64);
        }
    }

    /// Record a call that failed terminally after `attempts` tries.
    pub fn record_failure(&self, provider: &str, model: &str, attempts: u32) {
        if !self.is_enabled() {
            return;
        }
        let mut state = self.lock();
        let state = &mut *state;
        state.total_requests += 1;
        state.total_failures += 1;
        state.total_attempts += u64::from(attempts);
        for bucket in [
            state.by_model.entry(model.to_string()).or_default(),
            state.by_provider.entry(provider.to_string()).or_default(),
        ] {
            bucket.requests += 1;
            bucket.failures += 1;
        }
    }

    pub fn record_cache_lookup(&self, hit: bool) {
        if !self.is_enabled() {
            return;
        }
        let mut state = self.lock();
        state.cache_lookups += 1;
        if hit {
            state.cache_hits += 1;
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        let state = self.lock();
        MetricsSummary {
            total_requests: state.total_requests,
            total_failures: state.total_failures,
            total_attempts: state.total_attempts,
            total_tokens: state.total_tokens,
            total_cost: state.total_cost,
            error_rate: ratio(state.total_failures, state.total_attempts),
            cache_hits: state.cache_hits,
            cache_lookups: state.cache_lookups,
            cache_hit_rate: ratio(state.cache_hits, state.cache_lookups),
            avg_ttft_ms: state.ttft.mean,
            avg_total_ms: state.total_latency.mean,
            by_model: state
                .by_model
                .iter()
                .map(|(k, v)| (k.clone(), v.summarize()))
                .collect(),
            by_provider: state
                .by_provider
                .iter()
                .map(|(k, v)| (k.clone(), v.summarize()))
                .collect(),
        }
    }

    /// Zero every counter. The only mutation that is not a recording.
    pub fn reset(&self) {
        *self.lock() = MetricsState::default();
    }
}
