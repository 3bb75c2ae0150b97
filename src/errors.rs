//! Typed error hierarchy for the convoy orchestrator.
//!
//! One enum per subsystem:
//! - `CheckpointError`: checkpoint persistence and schema reconciliation
//! - `TeamError`: team name validation and lifecycle
//! - `PoolError`: task pool operations
//! - `SignalError`: worker-side signal writes
//! - `OrchestratorError`: run-level failures surfaced to the CLI
//!
//! Component errors never reach the CLI raw: the orchestrator converts them
//! into retry / halt decisions first.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from the checkpoint store.
#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("Failed to write checkpoint at {path}: {source}")]
    WriteFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to serialize checkpoint: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Checkpoint schema version {found} is newer than supported version {supported}")]
    NewerSchema { found: u32, supported: u32 },

    #[error("Checkpoint is missing field '{field}' required for migration")]
    MalformedForMigration { field: String },

    #[error("Checkpoint phase order is incompatible with pipeline '{pipeline}': {detail}")]
    IncompatiblePhaseOrder { pipeline: String, detail: String },

    #[error("Failed to archive run directory {path}: {source}")]
    ArchiveFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from the team lifecycle guard.
#[derive(Debug, Error)]
pub enum TeamError {
    #[error("Invalid team name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    #[error("Team '{name}' is owned by live session {session_id} (pid {owner_pid})")]
    Conflict {
        name: String,
        session_id: String,
        owner_pid: u32,
    },

    #[error("Team '{name}' still exists after {attempts} creation attempts")]
    CreationExhausted { name: String, attempts: usize },

    #[error("Team '{name}' could not be removed after {attempts} attempts: {source}")]
    CleanupFailed {
        name: String,
        attempts: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("Team I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl TeamError {
    /// Whether retrying the same operation later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Conflict { .. } | Self::CreationExhausted { .. } | Self::CleanupFailed { .. }
        )
    }
}

/// Errors from the task pool manager.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Task {id} not found")]
    NotFound { id: String },

    #[error("Task {id} is already claimed by {owner}")]
    AlreadyClaimed { id: String, owner: String },

    #[error("Task {id} is blocked by unfinished tasks: {}", waiting_on.join(", "))]
    Blocked { id: String, waiting_on: Vec<String> },

    #[error("Task {id} is already completed")]
    AlreadyCompleted { id: String },

    #[error("Task {id} is not claimed")]
    NotClaimed { id: String },

    #[error("Task {id} is owned by {owner}, not {caller}")]
    OwnerMismatch {
        id: String,
        owner: String,
        caller: String,
    },

    #[error("Task depends on unknown task {dependency}")]
    UnknownDependency { dependency: String },

    #[error("Task pool I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Task pool at {path} is corrupt: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors from the signal bus. Waiting never fails; only worker-side writes do.
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("Invalid task id '{id}' for a signal marker")]
    InvalidTaskId { id: String },

    #[error("Signal I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from a pipeline run that the CLI reports to the user.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("Unknown pipeline '{0}'")]
    UnknownPipeline(String),

    #[error("No unfinished checkpoint found for pipeline '{pipeline}'")]
    NothingToResume { pipeline: String },

    #[error("Run {run_id} already exists; pass --resume to continue it")]
    RunExists { run_id: String },

    #[error("Checkpoint {path} could not be read: {reason}")]
    UnreadableCheckpoint { path: PathBuf, reason: String },

    #[error("Run {run_id} is owned by live session {session_id} (pid {owner_pid})")]
    OwnedByLiveSession {
        run_id: String,
        session_id: String,
        owner_pid: u32,
    },

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn team_conflict_is_transient() {
        let err = TeamError::Conflict {
            name: "impl".to_string(),
            session_id: "abc".to_string(),
            owner_pid: 42,
        };
        assert!(err.is_transient());
        assert!(err.to_string().contains("pid 42"));
    }

    #[test]
    fn invalid_team_name_is_not_transient() {
        let err = TeamError::InvalidName {
            name: "../x".to_string(),
            reason: "traversal".to_string(),
        };
        assert!(!err.is_transient());
    }

    #[test]
    fn pool_blocked_lists_waiting_tasks() {
        let err = PoolError::Blocked {
            id: "t3".to_string(),
            waiting_on: vec!["t1".to_string(), "t2".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "Task t3 is blocked by unfinished tasks: t1, t2"
        );
    }

    #[test]
    fn orchestrator_error_converts_from_checkpoint_error() {
        let inner = CheckpointError::NewerSchema {
            found: 9,
            supported: 3,
        };
        let err: OrchestratorError = inner.into();
        match &err {
            OrchestratorError::Checkpoint(CheckpointError::NewerSchema { found, .. }) => {
                assert_eq!(*found, 9)
            }
            _ => panic!("Expected OrchestratorError::Checkpoint(NewerSchema)"),
        }
    }

    #[test]
    fn all_error_types_implement_std_error_trait() {
        fn assert_std_error<E: std::error::Error>(_: &E) {}
        assert_std_error(&PoolError::NotFound { id: "x".into() });
        assert_std_error(&TeamError::CreationExhausted {
            name: "x".into(),
            attempts: 3,
        });
        assert_std_error(&OrchestratorError::UnknownPipeline("x".into()));
    }
}
