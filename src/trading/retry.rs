//! Bounded exponential backoff around exchange calls.

use std::future::Future;
use std::time::Duration;

use backoff::future::retry_notify;
use backoff::ExponentialBackoffBuilder;
use tracing::warn;

use crate::api::ExchangeError;

use super::config::RetryPolicy;

/// Run `op` until it succeeds, fails permanently, or `policy.max_attempts`
/// is reached. Only [`ExchangeError::is_retryable`] failures are retried.
pub async fn retry_with_policy<T, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut op: F,
) -> Result<T, ExchangeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ExchangeError>>,
{
    let backoff = ExponentialBackoffBuilder::new()
        .with_initial_interval(policy.initial_interval())
        .with_max_interval(policy.max_interval())
        .with_multiplier(policy.multiplier)
        .with_max_elapsed_time(None)
        .build();

    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 0u32;

    retry_notify(
        backoff,
        || {
            attempt += 1;
            let current = attempt;
            let fut = op();
            async move {
                match fut.await {
                    Ok(value) => Ok(value),
                    Err(e) if e.is_retryable() && current < max_attempts => {
                        Err(backoff::Error::transient(e))
                    }
                    Err(e) => Err(backoff::Error::permanent(e)),
                }
            }
        },
        |err: ExchangeError, wait: Duration| {
            warn!(operation = %operation, error = %err, retry_in = ?wait, "Exchange call failed, retrying");
        },
    )
    .await
}
