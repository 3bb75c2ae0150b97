//! Checkpoint store: versioned, migrated, atomically written run state.

pub mod migrate;
pub mod store;
pub mod types;

pub use store::{CheckpointStore, LoadOutcome, RunListing, load, save};
pub use types::{
    CURRENT_SCHEMA_VERSION, Checkpoint, ConvergenceState, ConvergenceTier, CycleRecord,
    HaltRecord, PhaseEntry, PhaseStatus, Verdict,
};
