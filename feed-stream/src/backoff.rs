//! Reconnect backoff policy
//!
//! Exponential delays come from `backon`'s builder; jitter is applied on top
//! so many consumers restarted by the same outage do not reconnect in step.

use std::future::Future;
use std::time::Duration;

use backon::BackoffBuilder;
use backon::ExponentialBackoff;
use backon::ExponentialBuilder;
use rand::Rng;
use serde::Deserialize;
use serde::Serialize;

use crate::error::FeedError;
use crate::error::Result;

/// Backoff settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Relative jitter, `0.5` means +/-50%.
    pub jitter_factor: f64,
    /// Consecutive failures tolerated before giving up. `None` retries forever.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<usize>,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            jitter_factor: 0.5,
            max_retries: None,
        }
    }
}

impl BackoffConfig {
    fn builder(&self) -> ExponentialBuilder {
        ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.initial_delay_ms))
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_factor(self.multiplier as f32)
            .with_max_times(usize::MAX)
    }
}

/// Failure counter plus delay schedule.
///
/// Every failure (startup or runtime) consumes one credit and schedules the
/// next delay, which is slept at the start of the following
/// [`Backoff::attempt`]. A successful attempt resets both.
pub struct Backoff {
    config: BackoffConfig,
    delays: ExponentialBackoff,
    failures: usize,
    pending_delay: Option<Duration>,
}

impl Backoff {
    pub fn new(config: BackoffConfig) -> Self {
        let delays = config.builder().build();
        Self {
            config,
            delays,
            failures: 0,
            pending_delay: None,
        }
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Run `operation` until it succeeds or the retry ceiling is reached.
    ///
    /// Any failure of `operation` is retried. Once the ceiling is crossed the
    /// last error is wrapped in [`FeedError::RetriesExhausted`].
    pub async fn attempt<T, F, Fut>(&mut self, mut operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        loop {
            if let Some(delay) = self.pending_delay.take() {
                tracing::debug!(
                    delay_ms = delay.as_millis() as u64,
                    failures = self.failures,
                    "waiting before reconnect"
                );
                tokio::time::sleep(delay).await;
            }

            match operation().await {
                Ok(value) => {
                    self.reset();
                    return Ok(value);
                }
                Err(err) => {
                    self.failure();
                    if self.reached_max_retries() {
                        return Err(self.exhausted(err));
                    }
                    tracing::warn!(
                        error = %err,
                        attempt = self.failures,
                        "connect failed, retrying"
                    );
                }
            }
        }
    }

    /// Register a failure that happened outside [`Backoff::attempt`].
    pub fn failure(&mut self) {
        self.failures += 1;
        let base = self
            .delays
            .next()
            .unwrap_or(Duration::from_millis(self.config.max_delay_ms));
        self.pending_delay = Some(apply_jitter(base, self.config.jitter_factor));
    }

    pub fn reached_max_retries(&self) -> bool {
        self.config
            .max_retries
            .is_some_and(|max_retries| self.failures > max_retries)
    }

    pub fn reset(&mut self) {
        self.failures = 0;
        self.pending_delay = None;
        self.delays = self.config.builder().build();
    }

    pub fn failures(&self) -> usize {
        self.failures
    }

    /// Delay the next attempt will sleep, if any.
    pub fn pending_delay(&self) -> Option<Duration> {
        self.pending_delay
    }

    pub(crate) fn exhausted(&self, last: FeedError) -> FeedError {
        FeedError::RetriesExhausted {
            attempts: self.failures,
            last: Box::new(last),
        }
    }
}

impl std::fmt::Debug for Backoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backoff")
            .field("config", &self.config)
            .field("failures", &self.failures)
            .field("pending_delay", &self.pending_delay)
            .finish_non_exhaustive()
    }
}

fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return duration;
    }
    let jitter = rand::rng().random_range(-jitter_factor..=jitter_factor);
    let jittered_ms = (duration.as_millis() as f64 * (1.0 + jitter)).max(0.0) as u64;
    Duration::from_millis(jittered_ms)
}
