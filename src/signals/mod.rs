//! Completion signaling between workers and the orchestrator.
//!
//! Workers drop a `<task_id>.done` marker when a task finishes; the
//! orchestrator consumes markers instead of re-reading worker state. When the
//! signal directory is missing or unreadable the orchestrator polls the task
//! pool instead, so losing the directory only slows a phase down.

mod bus;

pub use bus::{DoneSet, SignalBus, SignalOutcome, SignalPath, WaitSettings};
