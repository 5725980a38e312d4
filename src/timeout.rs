//! Adaptive timeouts
//!
//! Tracks observed latency per model with exponentially weighted mean and
//! variance, and derives per-call ceilings from them: mean plus three
//! standard deviations, clamped to configured bounds. A fresh model starts
//! at the configured maxima and tightens as samples arrive.
//!
//! Stream supervision cancels through the call's own `CancelHandle`, so a
//! watchdog trip looks exactly like caller cancellation downstream.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use futures_util::StreamExt;

use crate::stream::EventStream;
use crate::types::AiLatency;
use crate::utils::cancel::CancelHandle;

/// Smoothing factor for the latency estimates.
const ALPHA: f64 = 0.2;
/// Ceilings sit this many standard deviations above the mean.
const SIGMA_MULTIPLIER: f64 = 3.0;

/// Static bounds on the derived ceilings.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutConfig {
    /// Max (and starting) first-token ceiling.
    pub first_token: Duration,
    /// Max (and starting) total ceiling.
    pub total: Duration,
    /// Derived ceilings never drop below this.
    pub min: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            first_token: Duration::from_secs(30),
            total: Duration::from_secs(120),
            min: Duration::from_secs(1),
        }
    }
}

impl TimeoutConfig {
    pub fn new(first_token: Duration, total: Duration) -> Self {
        Self {
            first_token,
            total,
            ..Self::default()
        }
    }
}

/// Ceilings derived for one call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeoutPair {
    pub first_token: Duration,
    pub total: Duration,
}

/// Exponentially weighted mean and variance, in milliseconds.
#[derive(Debug, Clone, Copy)]
struct Ewma {
    mean: f64,
    var: f64,
}

impl Ewma {
    fn new(sample: f64) -> Self {
        Self {
            mean: sample,
            var: 0.0,
        }
    }

    fn update(&mut self, sample: f64) {
        let diff = sample - self.mean;
        self.mean += ALPHA * diff;
        self.var = (1.0 - ALPHA) * (self.var + ALPHA * diff * diff);
    }

    fn ceiling(&self) -> f64 {
        self.mean + SIGMA_MULTIPLIER * self.var.sqrt()
    }
}

#[derive(Debug, Default, Clone, Copy)]
struct ModelStats {
    ttft: Option<Ewma>,
    total: Option<Ewma>,
}

/// Per-model latency tracker and ceiling source.
pub struct TimeoutManager {
    config: TimeoutConfig,
    stats: Mutex<HashMap<String, ModelStats>>,
}

impl TimeoutManager {
    pub fn new(config: TimeoutConfig) -> Self {
        Self {
            config,
            stats: Mutex::new(HashMap::new()),
        }
    }

    /// Ceilings for the next call against `model`. Without samples the
    /// configured maxima apply.
    pub fn derive(&self, model: &str) -> TimeoutPair {
        let stats = match self.stats.lock() {
            Ok(guard) => guard.get(model).copied(),
            Err(poisoned) => poisoned.into_inner().get(model).copied(),
        }
        .unwrap_or_default();

        TimeoutPair {
            first_token: self.clamp(stats.ttft, self.config.first_token),
            total: self.clamp(stats.total, self.config.total),
        }
    }

    fn clamp(&self, estimate: Option<Ewma>, max: Duration) -> Duration {
        match estimate {
            Some(e) => Duration::from_millis(e.ceiling().max(0.0) as u64)
                .clamp(self.config.min, max),
            None => max,
        }
    }

    /// Feed one completed call back into the estimates. Calls that never
    /// produced a first token leave the TTFT estimate untouched.
    pub fn record(&self, model: &str, latency: &AiLatency, saw_first_token: bool) {
        let mut stats = match self.stats.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let entry = stats.entry(model.to_string()).or_default();

        if saw_first_token {
            observe(&mut entry.ttft, latency.ttft_ms as f64);
        }
        observe(&mut entry.total, latency.total_ms as f64);
    }
}

fn observe(slot: &mut Option<Ewma>, sample: f64) {
    match slot {
        Some(e) => e.update(sample),
        None => *slot = Some(Ewma::new(sample)),
    }
}

/// Supervise a stream against derived ceilings, cancelling through the
/// call's handle when the first event is late, the gap since the last
/// event exceeds the first-token ceiling, or total elapsed exceeds the
/// total ceiling. A tripped watchdog ends the stream with no further
/// events, same as external cancellation.
pub fn supervise(mut stream: EventStream, pair: TimeoutPair, cancel: CancelHandle) -> EventStream {
    Box::pin(async_stream::stream! {
        let deadline = tokio::time::Instant::now() + pair.total;
        let total_timeout = tokio::time::sleep_until(deadline);
        tokio::pin!(total_timeout);

        loop {
            let gap = tokio::time::sleep(pair.first_token);
            tokio::select! {
                event = stream.next() => {
                    match event {
                        Some(event) => yield event,
                        None => return,
                    }
                }
                _ = gap => {
                    tracing::warn!(
                        gap_ms = pair.first_token.as_millis() as u64,
                        "stream stalled past the first-token ceiling, cancelling"
                    );
                    cancel.cancel();
                    return;
                }
                _ = &mut total_timeout => {
                    tracing::warn!(
                        total_ms = pair.total.as_millis() as u64,
                        "stream exceeded the total ceiling, cancelling"
                    );
                    cancel.cancel();
                    return;
                }
            }
        }
    })
}
