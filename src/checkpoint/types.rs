//! Persisted checkpoint records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::errors::CheckpointError;
use crate::session::SessionState;

/// Schema version written by this build.
pub const CURRENT_SCHEMA_VERSION: u32 = 3;

/// Status of one phase within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    /// Set before execution starts; seen on load only after a crash.
    Running,
    Skipped,
    Completed,
    Failed,
}

impl PhaseStatus {
    /// Phases that a resume leaves alone.
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Skipped => "skipped",
            Self::Completed => "completed",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

/// Verdict attached to a phase's work product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    #[default]
    Pass,
    /// Advisory findings only.
    Warn,
    /// Findings remain; a convergence loop keeps cycling.
    Fail,
    /// Circuit breaker tripped: halt the pipeline.
    Block,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pass => "PASS",
            Self::Warn => "WARN",
            Self::Fail => "FAIL",
            Self::Block => "BLOCK",
        };
        write!(f, "{}", s)
    }
}

/// One phase entry in a checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseEntry {
    pub name: String,
    pub status: PhaseStatus,
    /// Team that ran the phase, if it was delegated.
    pub team_name: Option<String>,
    /// Relative artifact path -> sha256 hex digest.
    #[serde(default)]
    pub artifact_hashes: BTreeMap<String, String>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Executions of this phase, across resumes.
    #[serde(default)]
    pub attempts: u32,
    /// Set when the phase ran out of budget and proceeded with partial results.
    #[serde(default)]
    pub partial_reason: Option<String>,
    /// One-line reason of the last failure.
    #[serde(default)]
    pub failure: Option<String>,
    /// Fields this build does not know about, kept verbatim.
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl PhaseEntry {
    pub fn pending(name: &str) -> Self {
        Self {
            name: name.to_string(),
            status: PhaseStatus::Pending,
            team_name: None,
            artifact_hashes: BTreeMap::new(),
            started_at: None,
            completed_at: None,
            attempts: 0,
            partial_reason: None,
            failure: None,
            extra: HashMap::new(),
        }
    }

    pub fn mark_running(&mut self) {
        self.status = PhaseStatus::Running;
        self.started_at = Some(Utc::now());
        self.completed_at = None;
        self.attempts += 1;
        self.failure = None;
        self.partial_reason = None;
    }

    pub fn mark_completed(&mut self, artifact_hashes: BTreeMap<String, String>) {
        self.status = PhaseStatus::Completed;
        self.completed_at = Some(Utc::now());
        self.artifact_hashes = artifact_hashes;
    }

    pub fn mark_failed(&mut self, reason: &str) {
        self.status = PhaseStatus::Failed;
        self.failure = Some(reason.to_string());
    }

    /// Integrity failure: forget the completion so the phase reruns.
    pub fn downgrade(&mut self, reason: &str) {
        self.status = PhaseStatus::Pending;
        self.completed_at = None;
        self.failure = Some(reason.to_string());
    }
}

/// Convergence tier, each fixing a `{min_cycles, max_cycles}` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConvergenceTier {
    Light,
    #[default]
    Standard,
    Thorough,
}

impl ConvergenceTier {
    /// `(min_cycles, max_cycles)`.
    pub fn cycle_bounds(&self) -> (u32, u32) {
        match self {
            Self::Light => (1, 2),
            Self::Standard => (2, 3),
            Self::Thorough => (3, 5),
        }
    }
}

impl fmt::Display for ConvergenceTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Light => "light",
            Self::Standard => "standard",
            Self::Thorough => "thorough",
        };
        write!(f, "{}", s)
    }
}

/// One completed cycle of a convergence loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleRecord {
    pub cycle: u32,
    pub score: f64,
    pub issues_total: u32,
    pub critical: u32,
    pub severity_index: f64,
    pub scope_coverage: f64,
    pub fixes_attempted: u32,
    pub fixes_succeeded: u32,
    pub verdict: Verdict,
    pub recorded_at: DateTime<Utc>,
}

/// Nested resumable state of the active convergence loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceState {
    pub phase: String,
    pub tier: ConvergenceTier,
    pub min_cycles: u32,
    pub max_cycles: u32,
    #[serde(default)]
    pub cycle_history: Vec<CycleRecord>,
}

impl ConvergenceState {
    pub fn new(phase: &str, tier: ConvergenceTier) -> Self {
        let (min_cycles, max_cycles) = tier.cycle_bounds();
        Self {
            phase: phase.to_string(),
            tier,
            min_cycles,
            max_cycles,
            cycle_history: Vec::new(),
        }
    }

    /// Number of the cycle that runs next.
    pub fn next_cycle(&self) -> u32 {
        self.cycle_history.len() as u32 + 1
    }
}

/// Why a run stopped before finishing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HaltRecord {
    pub phase: String,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Persisted snapshot of a pipeline run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub schema_version: u32,
    pub run_id: String,
    pub pipeline: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Index of the phase being (or next to be) executed.
    pub current_phase: usize,
    pub total_timeout_secs: u64,
    /// Always in canonical phase order.
    pub phases: Vec<PhaseEntry>,
    #[serde(default)]
    pub convergence: Option<ConvergenceState>,
    pub session: SessionState,
    #[serde(default)]
    pub halt: Option<HaltRecord>,
    #[serde(flatten)]
    pub extra: HashMap<String, Value>,
}

impl Checkpoint {
    /// Fresh checkpoint with every phase pending.
    pub fn new(
        run_id: &str,
        pipeline: &str,
        phase_names: &[String],
        session: SessionState,
        total_timeout_secs: u64,
    ) -> Self {
        let now = Utc::now();
        Self {
            schema_version: CURRENT_SCHEMA_VERSION,
            run_id: run_id.to_string(),
            pipeline: pipeline.to_string(),
            created_at: now,
            updated_at: now,
            current_phase: 0,
            total_timeout_secs,
            phases: phase_names.iter().map(|n| PhaseEntry::pending(n)).collect(),
            convergence: None,
            session,
            halt: None,
            extra: HashMap::new(),
        }
    }

    pub fn phase_names(&self) -> Vec<String> {
        self.phases.iter().map(|p| p.name.clone()).collect()
    }

    pub fn phase(&self, name: &str) -> Option<&PhaseEntry> {
        self.phases.iter().find(|p| p.name == name)
    }

    pub fn phase_mut(&mut self, name: &str) -> Option<&mut PhaseEntry> {
        self.phases.iter_mut().find(|p| p.name == name)
    }

    /// All phases completed or skipped.
    pub fn is_finished(&self) -> bool {
        self.phases.iter().all(|p| p.status.is_done())
    }

    /// Index of the first phase that still has to run.
    pub fn first_unfinished(&self) -> usize {
        self.phases
            .iter()
            .position(|p| !p.status.is_done())
            .unwrap_or(self.phases.len())
    }

    /// Align phase entries with the pipeline's canonical order, matching by
    /// name. Checkpoint phases must appear in `canonical` in the same
    /// relative order; canonical phases the checkpoint lacks are inserted as
    /// pending. Returns the names of inserted phases.
    pub fn reconcile_phase_order(&mut self, canonical: &[String]) -> Result<Vec<String>, CheckpointError> {
        let incompatible = |detail: String| CheckpointError::IncompatiblePhaseOrder {
            pipeline: self.pipeline.clone(),
            detail,
        };

        let mut last_index: Option<usize> = None;
        for entry in &self.phases {
            let Some(idx) = canonical.iter().position(|n| n == &entry.name) else {
                return Err(incompatible(format!(
                    "phase '{}' is not part of the pipeline",
                    entry.name
                )));
            };
            if let Some(prev) = last_index
                && idx <= prev
            {
                return Err(incompatible(format!(
                    "phase '{}' appears out of order or twice",
                    entry.name
                )));
            }
            last_index = Some(idx);
        }

        let mut existing: HashMap<String, PhaseEntry> = self
            .phases
            .drain(..)
            .map(|p| (p.name.clone(), p))
            .collect();
        let mut inserted = Vec::new();
        for name in canonical {
            match existing.remove(name) {
                Some(entry) => self.phases.push(entry),
                None => {
                    inserted.push(name.clone());
                    self.phases.push(PhaseEntry::pending(name));
                }
            }
        }
        self.current_phase = self.first_unfinished();
        Ok(inserted)
    }
}
