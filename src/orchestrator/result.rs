//! Run outcomes and their exit codes.

use std::fmt;
use std::path::PathBuf;

use crate::errors::{CheckpointError, OrchestratorError};

pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_ERROR: i32 = 1;
pub const EXIT_TIMEOUT: i32 = 2;
pub const EXIT_CONTENT_FAILURE: i32 = 3;
pub const EXIT_CANCELLED: i32 = 4;
pub const EXIT_INCOMPATIBLE: i32 = 5;

/// Why a run stopped before its last phase.
#[derive(Debug, Clone, PartialEq)]
pub enum HaltReason {
    /// The invocation's total budget ran out.
    TotalTimeout,
    /// A fail-closed phase ran out of its own budget.
    PhaseTimeout { allowed_secs: u64 },
    /// A local command or gate failed.
    ContentFailure(String),
    /// A convergence cycle returned a blocking verdict or did not converge
    /// in a fail-closed phase.
    Blocked(String),
    /// Tasks whose claims kept going stale.
    RepeatedTaskFailure(Vec<String>),
    /// A team or pool resource stayed unavailable after retries.
    ResourceConflict(String),
    /// The phase driver itself failed.
    DriverError(String),
}

impl HaltReason {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::TotalTimeout | Self::PhaseTimeout { .. } => EXIT_TIMEOUT,
            Self::ContentFailure(_) | Self::Blocked(_) | Self::RepeatedTaskFailure(_) => {
                EXIT_CONTENT_FAILURE
            }
            Self::ResourceConflict(_) | Self::DriverError(_) => EXIT_ERROR,
        }
    }
}

impl fmt::Display for HaltReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TotalTimeout => write!(f, "total pipeline budget exhausted"),
            Self::PhaseTimeout { allowed_secs } => {
                write!(f, "phase budget of {}s exhausted", allowed_secs)
            }
            Self::ContentFailure(msg) => write!(f, "content failure: {}", msg),
            Self::Blocked(msg) => write!(f, "blocked: {}", msg),
            Self::RepeatedTaskFailure(tasks) => {
                write!(f, "tasks repeatedly failing: {}", tasks.join(", "))
            }
            Self::ResourceConflict(msg) => write!(f, "resource conflict: {}", msg),
            Self::DriverError(msg) => write!(f, "driver error: {}", msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed,
    Halted {
        phase: String,
        reason: HaltReason,
        /// Paths worth inspecting before resuming.
        artifacts: Vec<PathBuf>,
    },
    Cancelled {
        phase: Option<String>,
    },
}

/// A phase that finished with partial results.
#[derive(Debug, Clone, PartialEq)]
pub struct FlaggedPhase {
    pub phase: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub run_id: String,
    pub pipeline: String,
    pub outcome: RunOutcome,
    pub phases_executed: Vec<String>,
    pub phases_skipped: Vec<String>,
    pub flagged: Vec<FlaggedPhase>,
    /// Where the checkpoint lives now (under `archive/` once archived).
    pub checkpoint_path: PathBuf,
}

impl RunResult {
    pub fn exit_code(&self) -> i32 {
        match &self.outcome {
            RunOutcome::Completed => EXIT_SUCCESS,
            RunOutcome::Halted { reason, .. } => reason.exit_code(),
            RunOutcome::Cancelled { .. } => EXIT_CANCELLED,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome == RunOutcome::Completed
    }
}

impl OrchestratorError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::OwnedByLiveSession { .. }
            | Self::UnreadableCheckpoint { .. }
            | Self::Checkpoint(CheckpointError::IncompatiblePhaseOrder { .. })
            | Self::Checkpoint(CheckpointError::NewerSchema { .. }) => EXIT_INCOMPATIBLE,
            _ => EXIT_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(HaltReason::TotalTimeout.exit_code(), 2);
        assert_eq!(HaltReason::PhaseTimeout { allowed_secs: 5 }.exit_code(), 2);
        assert_eq!(HaltReason::Blocked("x".into()).exit_code(), 3);
        assert_eq!(HaltReason::ResourceConflict("x".into()).exit_code(), 1);

        let refused = OrchestratorError::OwnedByLiveSession {
            run_id: "r".into(),
            session_id: "s".into(),
            owner_pid: 1,
        };
        assert_eq!(refused.exit_code(), 5);
        let order = OrchestratorError::Checkpoint(CheckpointError::IncompatiblePhaseOrder {
            pipeline: "build".into(),
            detail: "x".into(),
        });
        assert_eq!(order.exit_code(), 5);
        assert_eq!(OrchestratorError::UnknownPipeline("x".into()).exit_code(), 1);
    }

    #[test]
    fn test_halt_reason_is_one_line() {
        let reason = HaltReason::RepeatedTaskFailure(vec!["3".into(), "4".into()]);
        assert_eq!(reason.to_string(), "tasks repeatedly failing: 3, 4");
    }
}
