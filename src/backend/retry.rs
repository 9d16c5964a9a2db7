//! Bounded optimistic-concurrency retry
//!
//! Read the current state, apply a mutation, write it back; if the backend
//! reports a concurrent modification, start over with a fresh read. Gives up
//! after a fixed number of attempts.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::debug;

use super::BackendError;

/// Attempt budget used by backends that rescale through read-modify-write
pub const DEFAULT_CONFLICT_RETRIES: u32 = 5;

const CONFLICT_BACKOFF: Duration = Duration::from_millis(50);

/// Run `attempt` until it succeeds, fails with a non-conflict error, or
/// `max_attempts` conflicts have been seen.
///
/// `attempt` must perform the full read-modify-write cycle each time it is
/// called and signal a lost race with [`BackendError::Conflict`].
pub async fn retry_on_conflict<T, F, Fut>(
    resource: &str,
    max_attempts: u32,
    mut attempt: F,
) -> Result<T, BackendError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BackendError>>,
{
    let max_attempts = max_attempts.max(1);

    for n in 1..=max_attempts {
        match attempt().await {
            Err(BackendError::Conflict(_)) if n < max_attempts => {
                debug!(
                    "Conflict updating {} (attempt {}/{}), retrying with fresh read",
                    resource, n, max_attempts
                );
                sleep(CONFLICT_BACKOFF * n).await;
            }
            Err(BackendError::Conflict(_)) => break,
            other => return other,
        }
    }

    Err(BackendError::RetriesExhausted {
        resource: resource.to_string(),
        attempts: max_attempts,
    })
}
