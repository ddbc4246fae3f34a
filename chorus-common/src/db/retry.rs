//! Database retry logic
//!
//! SQLite reports write contention as a "database is locked" error rather
//! than blocking. Operations that must not surface contention to callers
//! (the detection merge in particular) are wrapped in exponential-backoff
//! retries until a deadline.

use std::time::{Duration, Instant};

use crate::{Error, Result};

/// Retry a database operation with exponential backoff until `max_wait_ms`
/// elapses.
///
/// Only lock errors are retried; any other error returns immediately.
pub async fn retry_on_lock<F, Fut, T>(
    operation_name: &str,
    max_wait_ms: u64,
    mut operation: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    let start_time = Instant::now();
    let max_duration = Duration::from_millis(max_wait_ms);
    let mut attempt = 0u32;
    let mut backoff_ms = 10u64;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::debug!(
                        operation = operation_name,
                        attempt,
                        elapsed_ms = start_time.elapsed().as_millis() as u64,
                        "Database operation succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(err) if is_lock_error(&err) => {
                if start_time.elapsed() >= max_duration {
                    tracing::error!(
                        operation = operation_name,
                        attempt,
                        max_wait_ms,
                        "Database still locked after retry deadline"
                    );
                    return Err(err);
                }

                tracing::warn!(
                    operation = operation_name,
                    attempt,
                    backoff_ms,
                    "Database locked, retrying"
                );
                tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                backoff_ms = (backoff_ms * 2).min(1000);
            }
            Err(err) => return Err(err),
        }
    }
}

fn is_lock_error(err: &Error) -> bool {
    match err {
        Error::Database(sqlx::Error::Database(db_err)) => {
            let message = db_err.message();
            message.contains("database is locked") || message.contains("database table is locked")
        }
        _ => false,
    }
}
