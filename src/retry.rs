//! Timeout + exponential backoff for provider calls.
//!
//! Every collaborator call the orchestrator makes goes through [`call_with_policy`]:
//! each attempt is bounded by the step timeout, and retryable failures are
//! retried with jittered exponential backoff until the attempt budget runs out.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::StepError;

/// Backoff settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Delay before the second attempt, in milliseconds.
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Cap for any single delay, in milliseconds.
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Total attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_true")]
    pub jitter_enabled: bool,

    /// Maximum jitter as a fraction of the delay (0.0 to 1.0).
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

const fn default_initial_delay() -> u64 {
    200
}

const fn default_max_delay() -> u64 {
    5_000
}

const fn default_multiplier() -> f64 {
    2.0
}

const fn default_max_attempts() -> u32 {
    3
}

const fn default_true() -> bool {
    true
}

const fn default_jitter_factor() -> f64 {
    0.1
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            multiplier: default_multiplier(),
            max_attempts: default_max_attempts(),
            jitter_enabled: default_true(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

impl RetryConfig {
    /// Zero-delay policy, for tests and offline runs.
    pub const fn immediate(max_attempts: u32) -> Self {
        Self {
            initial_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
            max_attempts,
            jitter_enabled: false,
            jitter_factor: 0.0,
        }
    }

    pub const fn without_jitter(mut self) -> Self {
        self.jitter_enabled = false;
        self
    }

    /// Delay after the given failed attempt (0-indexed).
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_wrap, clippy::cast_sign_loss, clippy::cast_possible_truncation)]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = (self.initial_delay_ms as f64) * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay_ms as f64);

        let delay = if self.jitter_enabled && capped > 0.0 {
            let range = capped * self.jitter_factor;
            let jitter = rand::thread_rng().gen_range(-range..=range);
            (capped + jitter).max(0.0)
        } else {
            capped
        };

        Duration::from_millis(delay as u64)
    }
}

/// Errors that can say whether another attempt might succeed.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for StepError {
    fn is_retryable(&self) -> bool {
        // A malformed reply is a content problem; asking again rarely fixes it.
        !matches!(self, StepError::Parse(_))
    }
}

/// Timeout and retry policy for one kind of call.
#[derive(Debug, Clone)]
pub struct CallPolicy {
    pub retry: RetryConfig,
    pub timeout: Duration,
}

/// Outcome of a retried call plus the number of attempts it took.
#[derive(Debug)]
pub struct RetryResult<T> {
    pub result: Result<T, StepError>,
    pub attempts: u32,
}

/// Run `operation` under `policy`: each attempt is timed out, retryable
/// failures are retried with backoff.
pub async fn call_with_policy<F, Fut, T>(
    label: &str,
    policy: &CallPolicy,
    mut operation: F,
) -> RetryResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StepError>>,
{
    let max_attempts = policy.retry.max_attempts.max(1);
    let mut attempts = 0u32;

    loop {
        attempts += 1;
        let result = match tokio::time::timeout(policy.timeout, operation()).await {
            Ok(inner) => inner,
            Err(_) => Err(StepError::Timeout(policy.timeout)),
        };

        let err = match result {
            Ok(value) => {
                if attempts > 1 {
                    debug!(call = label, attempts, "Call succeeded after retries");
                }
                return RetryResult {
                    result: Ok(value),
                    attempts,
                };
            }
            Err(err) => err,
        };

        if !err.is_retryable() || attempts >= max_attempts {
            warn!(call = label, attempts, error = %err, "Call failed, giving up");
            return RetryResult {
                result: Err(err),
                attempts,
            };
        }

        let delay = policy.retry.delay_for_attempt(attempts - 1);
        warn!(
            call = label,
            attempt = attempts,
            max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Call failed, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}
