//! Bounded retry with jittered exponential backoff
//!
//! One policy object replaces ad hoc retry loops: the call layer, part
//! uploads, storage puts and CDN downloads all go through [`RetryPolicy::run`].

use std::{future::Future, time::Duration};

use pandrive_core::config::RetryConfig;
use rand::Rng;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ApiError;

/// Retry limits shared by every network operation
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// No retry is started if its backoff would end past this point
    pub elapsed_ceiling: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            elapsed_ceiling: Duration::from_secs(config.elapsed_ceiling_secs),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            elapsed_ceiling: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1-based), jittered over the upper half.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let ceiling = self
            .base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay);
        let half = ceiling / 2;
        let spread = (ceiling - half).as_millis() as u64;
        let jitter = if spread == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=spread)
        };
        half + Duration::from_millis(jitter)
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt or elapsed budget runs out. `op` receives the 1-based attempt.
    pub async fn run<T, F, Fut, P>(
        &self,
        cancel: &CancellationToken,
        op: F,
        retryable: P,
    ) -> Result<T, ApiError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
        P: Fn(&ApiError) -> bool,
    {
        self.run_classified(cancel, op, |err| {
            if retryable(err) {
                RetryClass::Backoff
            } else {
                RetryClass::Fatal
            }
        })
        .await
    }

    /// Like [`RetryPolicy::run`], but `classify` decides per error whether the
    /// retry counts against `max_attempts`.
    ///
    /// [`RetryClass::Paced`] failures are retried without backoff and without
    /// using up an attempt; only cancellation and the elapsed ceiling end them.
    pub async fn run_classified<T, F, Fut, C>(
        &self,
        cancel: &CancellationToken,
        mut op: F,
        classify: C,
    ) -> Result<T, ApiError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
        C: Fn(&ApiError) -> RetryClass,
    {
        let started = Instant::now();
        let mut call = 1;
        let mut attempt = 1;
        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ApiError::Cancelled),
                result = op(call) => result,
            };
            call += 1;

            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            match classify(&err) {
                RetryClass::Fatal => return Err(err),
                RetryClass::Paced => {
                    if started.elapsed() > self.elapsed_ceiling {
                        warn!(calls = call - 1, error = %err, "Still throttled at the retry ceiling");
                        return Err(err);
                    }
                    debug!(calls = call - 1, error = %err, "Throttled, retrying after the pacer cooldown");
                    continue;
                }
                RetryClass::Backoff if attempt >= self.max_attempts => return Err(err),
                RetryClass::Backoff => {}
            }

            let delay = self.backoff(attempt);
            if started.elapsed() + delay > self.elapsed_ceiling {
                warn!(attempt, error = %err, "Retry budget exhausted");
                return Err(err);
            }

            warn!(
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Retrying after failure"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(ApiError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }
}

/// How a failed attempt is retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Returned to the caller as is
    Fatal,
    /// Retried after backoff; counts against `max_attempts`
    Backoff,
    /// Retried once the pacer allows it; does not count against `max_attempts`
    Paced,
}
