//! Pipeline orchestrator.
//!
//! Sequences phases, enforces the total and per-phase budgets, persists a
//! checkpoint after every state change and resumes from it. Delegated phases
//! run a worker team over a task pool; convergence phases loop review/fix
//! cycles until the score clears the threshold.

pub mod artifacts;
pub mod budget;
pub mod cancel;
pub mod convergence;
pub mod pipeline;
pub mod result;
pub mod retry;
pub mod runner;

pub use budget::{Budget, PhaseAllowance};
pub use cancel::CancelFlag;
pub use convergence::{CycleDecision, decide, record_cycle, score, select_tier};
pub use pipeline::{BUILTIN_PIPELINES, PhaseKind, PhaseSpec, PipelineSpec};
pub use result::{
    EXIT_CANCELLED, EXIT_CONTENT_FAILURE, EXIT_ERROR, EXIT_INCOMPATIBLE, EXIT_SUCCESS,
    EXIT_TIMEOUT, FlaggedPhase, HaltReason, RunOutcome, RunResult,
};
pub use retry::{PhaseDecision, with_backoff};
pub use runner::{CancelOutcome, Orchestrator, RunRequest};
