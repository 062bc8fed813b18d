//! Retry policy: decides backoff delays for orchestrator calls.

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::ports::OrchestratorError;

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub base_delay: Duration,

    /// Backoff multiplier for exponential backoff.
    pub multiplier: f64,

    /// Total attempts, including the first call.
    pub max_attempts: u32,

    /// Upper bound for a single delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(200),
            multiplier: 2.0,
            max_attempts: 4,
            max_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Delay after `attempts` failed attempts (1-indexed).
    ///
    /// delay = base_delay * multiplier^(attempts - 1), capped at `max_delay`.
    ///
    /// Example with base_delay=200ms, multiplier=2.0:
    /// - attempt 1: 200ms
    /// - attempt 2: 400ms
    /// - attempt 3: 800ms
    pub fn next_delay(&self, attempts: u32) -> Duration {
        let base_secs = self.base_delay.as_secs_f64();
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let delay_secs = base_secs * self.multiplier.powi(exponent);
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(delay_secs)
    }
}

/// Runs `call` until it succeeds, fails permanently, or the attempt budget runs out.
///
/// Only transient errors (`OrchestratorError::is_transient`) are retried.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    op: &'static str,
    mut call: F,
) -> Result<T, OrchestratorError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, OrchestratorError>>,
{
    let mut attempts = 0;
    loop {
        attempts += 1;
        match call().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_transient() && attempts < policy.max_attempts.max(1) => {
                let delay = policy.next_delay(attempts);
                debug!(op, attempts, ?delay, error = %err, "retrying orchestrator call");
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
