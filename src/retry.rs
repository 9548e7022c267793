//! Bounded retry of transient failures.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::error::ClientError;

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(60);

/// Runs `operation` until it succeeds, fails with a non-transient error,
/// exceeds `deadline`, or `cancel` fires.
///
/// Transient failures (per [`ClientError::is_transient`]) are retried with
/// exponential backoff capped at [`BACKOFF_MAX`]. The attempt in flight when
/// the deadline expires is abandoned.
pub async fn do_with_default_retry<F, Fut>(
    deadline: Duration,
    cancel: CancellationToken,
    mut operation: F,
) -> Result<(), ClientError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), ClientError>>,
{
    let started = tokio::time::Instant::now();
    let mut attempt: u32 = 0;

    loop {
        let Some(remaining) = deadline.checked_sub(started.elapsed()) else {
            return Err(ClientError::RetryTimeout(deadline));
        };
        attempt += 1;

        let result = tokio::select! {
            result = operation() => result,
            _ = tokio::time::sleep(remaining) => return Err(ClientError::RetryTimeout(deadline)),
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
        };

        match result {
            Ok(()) => return Ok(()),
            Err(err) if !err.is_transient() => return Err(err),
            Err(err) => {
                tracing::warn!(attempt, error = %err, "retryable failure");
            }
        }

        let Some(remaining) = deadline.checked_sub(started.elapsed()) else {
            return Err(ClientError::RetryTimeout(deadline));
        };
        let pause = backoff_for_attempt(attempt).min(remaining);
        tokio::select! {
            _ = tokio::time::sleep(pause) => {}
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
        }
    }
}

// Exponential backoff with deterministic per-attempt jitter so concurrent
// handlers spread out instead of retrying in lockstep.
fn backoff_for_attempt(attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let base = BACKOFF_INITIAL
        .saturating_mul(1u32 << exponent)
        .min(BACKOFF_MAX);
    let jitter = Duration::from_millis(u64::from(attempt) * 137 % 500);
    (base + jitter).min(BACKOFF_MAX)
}
