//! Exponential backoff for transient failures.

use crate::config::RetryConfig;
use std::future::Future;

/// Failure returned once retries stop: the last error and how many attempts ran.
#[derive(Debug)]
pub struct Exhausted<E> {
    pub error: E,
    pub attempts: usize,
}

/// Run `op` until it succeeds, fails with a non-transient error, or the
/// attempt limit in `policy` is reached. Backoff doubles after every failure
/// up to `policy.max_backoff_ms`.
pub async fn with_backoff<T, E, F, Fut, P>(
    policy: &RetryConfig,
    label: &str,
    is_transient: P,
    mut op: F,
) -> Result<T, Exhausted<E>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_retries.max(1);
    let mut attempt = 0;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                attempt += 1;
                if !is_transient(&e) || attempt >= max_attempts {
                    return Err(Exhausted {
                        error: e,
                        attempts: attempt,
                    });
                }

                let backoff = policy.backoff_after(attempt);
                tracing::warn!(
                    "{} attempt {} failed: {}, retrying in {}ms",
                    label,
                    attempt,
                    e,
                    backoff.as_millis()
                );
                tokio::time::sleep(backoff).await;
            }
        }
    }
}
