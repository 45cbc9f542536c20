pub mod git;
pub mod github;

use std::future::Future;
use std::time::Duration;

use crate::error::Result;

/// Run an operation with a bounded retry budget. Only transient failures
/// (network fetch/push, rate limiting) are retried; everything else
/// surfaces immediately.
pub async fn with_retries<T, F, Fut>(op_name: &str, attempts: u32, f: F) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = attempts.max(1);
    let mut backoff = Duration::from_secs(2);

    for attempt in 1..=attempts {
        match f().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < attempts => {
                tracing::warn!(
                    operation = op_name,
                    attempt,
                    error = %e,
                    "Transient failure, retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            Err(e) => return Err(e),
        }
    }

    unreachable!("retry loop always returns")
}
