//! Bounded waits
//!
//! Every external call cutover makes is wrapped in one of these so a slow
//! or wedged platform turns into a `Timeout` error instead of a hang.

use std::future::Future;
use std::time::Duration;
use tokio::time::{timeout, Instant};

use crate::error::{CutoverError, CutoverResult};

/// Async timeout wrapper mapping elapsed deadlines to `CutoverError::Timeout`
pub async fn with_timeout<F, T>(future: F, duration: Duration, operation_name: &str) -> CutoverResult<T>
where
    F: Future<Output = T>,
{
    timeout(duration, future)
        .await
        .map_err(|_| CutoverError::timeout(operation_name, duration))
}

/// Poll `check` every `interval` until it yields a value.
///
/// Errors from `check` propagate immediately. When `limit` elapses without a
/// value the result is `CutoverError::Timeout` for `operation_name`.
pub async fn poll_until<T, F, Fut>(
    operation_name: &str,
    limit: Duration,
    interval: Duration,
    mut check: F,
) -> CutoverResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = CutoverResult<Option<T>>>,
{
    let deadline = Instant::now() + limit;
    loop {
        if let Some(value) = check().await? {
            return Ok(value);
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(CutoverError::timeout(operation_name, limit));
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}
