//! Call-site retry for transient storage failures.
//!
//! # Invariants
//! - Only errors reporting `is_retryable()` are retried.
//! - The last error is returned after `max_attempts`; nothing loops forever.

use super::{StoreError, StoreResult};
use log::warn;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff policy for store calls made by the services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageRetryPolicy {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for StorageRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 50,
            max_delay_ms: 1_000,
        }
    }
}

/// `base * 2^(attempt-1)`, capped at `cap`. `attempt` is 1-based.
pub fn backoff_delay_ms(base_ms: u64, attempt: u32, cap_ms: u64) -> u64 {
    let exponent = attempt.saturating_sub(1).min(32);
    base_ms
        .saturating_mul(1u64 << exponent)
        .min(cap_ms)
}

/// Runs `op` until it succeeds, fails permanently, or attempts run out.
pub async fn retry_storage<T>(
    policy: &StorageRetryPolicy,
    operation: &str,
    mut op: impl FnMut() -> StoreResult<T>,
) -> StoreResult<T> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(err) if err.is_retryable() && attempt < max_attempts => {
                let delay = backoff_delay_ms(policy.base_delay_ms, attempt, policy.max_delay_ms);
                warn!(
                    "event=store_retry module=repo status=retry operation={} attempt={} delay_ms={} error={}",
                    operation, attempt, delay, err
                );
                tokio::time::sleep(Duration::from_millis(delay)).await;
                attempt += 1;
            }
            Err(err) => return Err(exhausted(operation, attempt, err)),
        }
    }
}

fn exhausted(operation: &str, attempts: u32, err: StoreError) -> StoreError {
    if err.is_retryable() {
        warn!(
            "event=store_retry module=repo status=exhausted operation={} attempts={} error={}",
            operation, attempts, err
        );
    }
    err
}

#[cfg(test)]
mod tests {
    use super::{backoff_delay_ms, retry_storage, StorageRetryPolicy};
    use crate::db::DbError;
    use crate::repo::StoreError;
    use std::cell::Cell;

    fn busy() -> StoreError {
        StoreError::Db(DbError::Sqlite(rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY),
            None,
        )))
    }

    #[test]
    fn backoff_doubles_and_caps() {
        assert_eq!(backoff_delay_ms(100, 1, 1_000), 100);
        assert_eq!(backoff_delay_ms(100, 2, 1_000), 200);
        assert_eq!(backoff_delay_ms(100, 4, 1_000), 800);
        assert_eq!(backoff_delay_ms(100, 5, 1_000), 1_000);
        assert_eq!(backoff_delay_ms(100, 90, 1_000), 1_000);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_errors_then_succeeds() {
        let calls = Cell::new(0);
        let value = retry_storage(&StorageRetryPolicy::default(), "test", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(busy())
            } else {
                Ok(7)
            }
        })
        .await
        .unwrap();
        assert_eq!(value, 7);
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn surfaces_error_after_max_attempts() {
        let calls = Cell::new(0);
        let err = retry_storage(&StorageRetryPolicy::default(), "test", || {
            calls.set(calls.get() + 1);
            Err::<(), _>(busy())
        })
        .await
        .unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(calls.get(), 3);
    }

    #[tokio::test]
    async fn does_not_retry_permanent_errors() {
        let calls = Cell::new(0);
        let err = retry_storage(&StorageRetryPolicy::default(), "test", || {
            calls.set(calls.get() + 1);
            Err::<(), _>(StoreError::NotFound("x".to_string()))
        })
        .await
        .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert_eq!(calls.get(), 1);
    }
}
