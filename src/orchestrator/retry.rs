//! Failure classification and the transient-retry loop.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

use crate::errors::{PoolError, TeamError};

/// What the orchestrator does with a component error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseDecision {
    /// Transient: try again on the backoff schedule.
    Retry,
    /// Stop the pipeline with a structured reason.
    Halt,
    /// Log it and carry on.
    Proceed,
}

impl From<&TeamError> for PhaseDecision {
    fn from(err: &TeamError) -> Self {
        match err {
            TeamError::InvalidName { .. } => Self::Halt,
            TeamError::Conflict { .. } | TeamError::CreationExhausted { .. } | TeamError::Io { .. } => {
                Self::Retry
            }
            TeamError::CleanupFailed { .. } => Self::Proceed,
        }
    }
}

impl From<&PoolError> for PhaseDecision {
    fn from(err: &PoolError) -> Self {
        match err {
            PoolError::Io { .. } => Self::Retry,
            _ => Self::Halt,
        }
    }
}

/// Run `op` until it succeeds, the error is not retryable, or the schedule
/// is exhausted. `schedule[i]` is the delay before attempt `i`; an empty
/// schedule still makes one attempt.
pub async fn with_backoff<T, E, Op, Fut>(schedule: &[Duration], mut op: Op) -> Result<T, E>
where
    Op: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
    for<'e> PhaseDecision: From<&'e E>,
{
    let attempts = schedule.len().max(1);
    let mut attempt = 0;
    loop {
        if let Some(delay) = schedule.get(attempt)
            && !delay.is_zero()
        {
            tokio::time::sleep(*delay).await;
        }
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if PhaseDecision::from(&e) == PhaseDecision::Retry && attempt + 1 < attempts => {
                warn!(attempt = attempt + 1, of = attempts, error = %e, "Transient failure, retrying");
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn conflict() -> TeamError {
        TeamError::Conflict {
            name: "t".into(),
            session_id: "s".into(),
            owner_pid: 1,
        }
    }

    #[tokio::test]
    async fn test_retries_transient_until_success() {
        let calls = AtomicUsize::new(0);
        let schedule = [Duration::ZERO; 3];
        let result: Result<u32, TeamError> = with_backoff(&schedule, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { if attempt < 2 { Err(conflict()) } else { Ok(7) } }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_schedule() {
        let calls = AtomicUsize::new(0);
        let schedule = [Duration::ZERO; 3];
        let result: Result<(), TeamError> = with_backoff(&schedule, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(conflict()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_content_errors_are_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), PoolError> = with_backoff(&[Duration::ZERO; 3], |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(PoolError::NotFound { id: "1".into() }) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_classification() {
        assert_eq!(PhaseDecision::from(&conflict()), PhaseDecision::Retry);
        assert_eq!(
            PhaseDecision::from(&TeamError::InvalidName {
                name: "..".into(),
                reason: "x".into()
            }),
            PhaseDecision::Halt
        );
    }
}
