use std::time::Duration;

use tokio::time::sleep;
use tokio::time::timeout;
use tracing::warn;

use crate::BackoffPolicy;
use crate::Error;
use crate::ProcessorError;
use crate::Result;

/// Runs `task` until it succeeds, retrying retryable errors with exponential
/// backoff.
///
/// Only use it for idempotent work: a timed out attempt may still have
/// reached the container.
pub(crate) async fn task_with_timeout_and_exponential_backoff<F, T, P>(
    task: F,
    policy: BackoffPolicy,
) -> Result<P>
where
    F: Fn() -> T,
    T: std::future::Future<Output = Result<P>>,
{
    let max_retries = policy.max_retries.max(1);
    let timeout_duration = Duration::from_millis(policy.timeout_ms);
    let max_delay = Duration::from_millis(policy.max_delay_ms);
    let mut delay = Duration::from_millis(policy.base_delay_ms);

    let mut retries = 0;
    let mut last_error: Error = ProcessorError::RetryTaskFailed("Task failed after max retries".to_string()).into();
    while retries < max_retries {
        match timeout(timeout_duration, task()).await {
            Ok(Ok(r)) => {
                return Ok(r);
            }
            Ok(Err(e)) => {
                if !e.is_retryable() {
                    return Err(e);
                }
                warn!("failed with error: {:?}", &e);
                last_error = e;
            }
            Err(_) => {
                warn!("task_with_timeout_and_exponential_backoff timeout after {:?}", timeout_duration);
                last_error = ProcessorError::RetryTimeout(timeout_duration).into();
            }
        };

        retries += 1;
        if retries < max_retries {
            sleep(delay).await;
            delay = (delay * 2).min(max_delay);
        } else {
            warn!("Task failed after {} retries", retries);
        }
    }
    Err(last_error)
}
