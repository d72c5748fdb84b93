//! Bounded retry for eventually-consistent provider resources
//!
//! Several provisioning steps reference cloud objects that were created
//! moments earlier but are not yet visible to the API. Those steps are
//! retried with a fixed delay until the resource appears or the attempt
//! budget is spent; the wait is cancellable so a caller can abandon an
//! in-flight multi-step creation.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

use crate::{Error, Result};

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Maximum attempts before the last error is propagated
    pub max_attempts: u32,
    /// Fixed delay between attempts
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }
}

/// Run `operation` until it succeeds, the policy is exhausted, or the token
/// is cancelled. The final failure returns the last underlying error, never
/// a silent success.
pub async fn retry_fixed<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    token: &CancellationToken,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        let result = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(Error::Cancelled),
            result = operation() => result,
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if attempt >= policy.max_attempts.max(1) => {
                error!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    "operation failed after max retries"
                );
                return Err(e);
            }
            Err(e) => {
                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    delay_ms = policy.delay.as_millis() as u64,
                    error = %e,
                    "operation failed, retrying"
                );
                tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(Error::Cancelled),
                    _ = tokio::time::sleep(policy.delay) => {}
                }
            }
        }
    }
}
