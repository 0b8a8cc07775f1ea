//! Transactional retry with jittered backoff.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use crate::error::Result;

const MAX_ATTEMPTS: u32 = 3;
const BASE_BACKOFF_MS: u64 = 25;

/// Run `op` up to three times, retrying only on serialization failures
/// (SQLSTATE 40001) with jittered exponential backoff. Deadlocks and all
/// other errors abort immediately.
pub async fn with_retry<T, F, Fut>(label: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < MAX_ATTEMPTS => {
                let backoff = backoff_with_jitter(attempt);
                warn!(
                    op = label,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    "serialization failure, retrying"
                );
                tokio::time::sleep(backoff).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

fn backoff_with_jitter(attempt: u32) -> Duration {
    let base = BASE_BACKOFF_MS << (attempt - 1);
    let jitter = rand::thread_rng().gen_range(0..base);
    Duration::from_millis(base + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DbError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_first_try() {
        let result: Result<i32> = with_retry("noop", || async { Ok(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn retries_serialization_failures() {
        let calls = AtomicU32::new(0);
        let result: Result<&str> = with_retry("contended", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(DbError::Serialization("40001".into()))
                } else {
                    Ok("done")
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_three_attempts() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry("hopeless", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(DbError::Serialization("40001".into())) }
        })
        .await;
        assert!(matches!(result, Err(DbError::Serialization(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn deadlocks_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry("deadlocked", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(DbError::Deadlock("40P01".into())) }
        })
        .await;
        assert!(matches!(result, Err(DbError::Deadlock(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
