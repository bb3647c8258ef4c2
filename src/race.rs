//! Timeout and cancellation racing for bounded operations.
//!
//! Connect, discover and execute each race their work against a timer. The
//! first future to finish wins and the loser is dropped, which cancels it.
//! [`with_timeout_or_cancel`] additionally watches a caller-owned
//! [`CancellationToken`] for the whole race.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::error::{ConnectorError, Operation};

/// Why a race was lost.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaceError {
    /// The timer fired first.
    #[error("timed out after {}ms", .0.as_millis())]
    TimedOut(Duration),
    /// The caller's token was cancelled first.
    #[error("cancelled")]
    Cancelled,
}

impl RaceError {
    /// Attach the operation name and turn this into a connector error.
    #[must_use]
    pub fn into_connector_error(self, operation: Operation) -> ConnectorError {
        match self {
            Self::TimedOut(after) => ConnectorError::Timeout { operation, after },
            Self::Cancelled => ConnectorError::Cancelled,
        }
    }
}

/// Race `fut` against a timer of length `limit`.
pub async fn with_timeout<F>(limit: Duration, fut: F) -> Result<F::Output, RaceError>
where
    F: Future,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_elapsed| RaceError::TimedOut(limit))
}

/// Race `fut` against a timer and against `cancel`.
///
/// Cancellation is checked first on every poll, so an already-cancelled token
/// wins even if `fut` would complete immediately.
pub async fn with_timeout_or_cancel<F>(
    limit: Duration,
    cancel: &CancellationToken,
    fut: F,
) -> Result<F::Output, RaceError>
where
    F: Future,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(RaceError::Cancelled),
        res = tokio::time::timeout(limit, fut) => res.map_err(|_elapsed| RaceError::TimedOut(limit)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_fast_future_wins() {
        let out = with_timeout(Duration::from_secs(1), async { 7 }).await;
        assert_eq!(out, Ok(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_wins_and_drops_loser() {
        struct SetOnDrop(Arc<AtomicBool>);
        impl Drop for SetOnDrop {
            fn drop(&mut self) {
                self.0.store(true, Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(AtomicBool::new(false));
        let guard = SetOnDrop(Arc::clone(&dropped));
        let slow = async move {
            let _guard = guard;
            tokio::time::sleep(Duration::from_secs(60)).await;
        };

        let out = with_timeout(Duration::from_millis(100), slow).await;
        assert_eq!(out, Err(RaceError::TimedOut(Duration::from_millis(100))));
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_wins_before_timer() {
        let token = CancellationToken::new();
        let trigger = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let out = with_timeout_or_cancel(
            Duration::from_secs(30),
            &token,
            tokio::time::sleep(Duration::from_secs(20)),
        )
        .await;
        assert_eq!(out, Err(RaceError::Cancelled));
    }

    #[tokio::test]
    async fn test_precancelled_token_short_circuits() {
        let token = CancellationToken::new();
        token.cancel();
        let out = with_timeout_or_cancel(Duration::from_secs(1), &token, async { 1 }).await;
        assert_eq!(out, Err(RaceError::Cancelled));
    }

    #[test]
    fn test_timeout_is_distinct_from_cancellation() {
        let timeout = RaceError::TimedOut(Duration::from_secs(2)).into_connector_error(Operation::Discover);
        let cancelled = RaceError::Cancelled.into_connector_error(Operation::Discover);
        assert_eq!(timeout.kind(), crate::error::ErrorKind::Timeout);
        assert_eq!(cancelled.kind(), crate::error::ErrorKind::Cancelled);
    }
}
