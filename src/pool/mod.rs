//! Task pool manager: a dependency-aware, claimable queue shared between the
//! orchestrator and worker processes through the filesystem.
//!
//! File-level mutual exclusion is decided when a task is created: tasks whose
//! file targets overlap an earlier unfinished task are blocked on it, so two
//! workers never hold claims on the same file.

pub mod store;
pub mod targets;
pub mod types;

pub use store::TaskPool;
pub use targets::extract_file_targets;
pub use types::{PoolDocument, ReleaseEvent, StaleSweep, Task, TaskSpec, TaskStatus};
