use crate::error::{CodectxError, Result};
use std::time::Duration;
use tracing::warn;

/// Maximum backoff cap to prevent excessively long waits.
const MAX_DELAY: Duration = Duration::from_secs(10);

/// Determine whether an error is transient.
///
/// Rate limiting, server errors, timeouts and connection issues are retried.
/// Client errors and anything unrecognized are not.
fn is_retryable(err: &CodectxError) -> bool {
    if let CodectxError::Http(e) = err {
        if e.is_timeout() || e.is_connect() {
            return true;
        }
    }

    let msg = err.to_string().to_lowercase();

    let non_retryable = ["400", "401", "403", "404", "invalid", "not found"];
    if non_retryable.iter().any(|pattern| msg.contains(pattern)) {
        return false;
    }

    let retryable = [
        "429",
        "500",
        "502",
        "503",
        "504",
        "timeout",
        "timed out",
        "connection refused",
        "connection reset",
    ];
    retryable.iter().any(|pattern| msg.contains(pattern))
}

/// Retry an async operation with exponential backoff.
///
/// `max_retries` of 0 executes once. The delay doubles per attempt up to [`MAX_DELAY`].
pub async fn retry_with_backoff<F, Fut, T>(
    max_retries: u32,
    initial_delay: Duration,
    f: F,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let mut delay = initial_delay;
    let mut attempt = 0;

    loop {
        match f().await {
            Ok(val) => return Ok(val),
            Err(err) => {
                if attempt >= max_retries || !is_retryable(&err) {
                    return Err(err);
                }

                warn!(
                    attempt = attempt + 1,
                    max_attempts = max_retries + 1,
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "Embedding request failed, retrying"
                );

                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_DELAY);
                attempt += 1;
            }
        }
    }
}
