//! Bounded exponential backoff
//!
//! Transient RPC failures are retried a fixed number of times with doubling
//! delays and jitter; everything else propagates immediately.

use haybale_common::{Error, Result};
use rand::Rng;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Default retry attempts for transient failures
pub const DEFAULT_ATTEMPTS: u32 = 3;

const INITIAL_DELAY: Duration = Duration::from_millis(100);
const MAX_JITTER_MS: u64 = 50;

/// Run `op`, retrying transient errors up to `attempts` times total
pub async fn with_backoff<T, F, Fut>(what: &str, attempts: u32, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = INITIAL_DELAY;
    let mut attempt = 0;
    loop {
        attempt += 1;
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < attempts => {
                let jitter = rand::thread_rng().gen_range(0..MAX_JITTER_MS);
                let wait = delay + Duration::from_millis(jitter);
                debug!(%what, attempt, %err, wait_ms = wait.as_millis() as u64, "retrying");
                tokio::time::sleep(wait).await;
                delay *= 2;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Map a reqwest failure onto the common error type
#[must_use]
pub fn map_transport_err(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        Error::Timeout
    } else {
        Error::ConnectionFailed(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_backoff("test", 3, || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(Error::Timeout)
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_error_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_backoff("test", 3, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(Error::NotFound(1)) }
        })
        .await;
        assert!(matches!(result, Err(Error::NotFound(1))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_returns_last_error() {
        let result: Result<()> =
            with_backoff("test", 2, || async { Err(Error::Timeout) }).await;
        assert!(matches!(result, Err(Error::Timeout)));
    }
}
