//! Task pool records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Lifecycle of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
        };
        write!(f, "{}", s)
    }
}

/// What a caller asks the pool to create.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub description: String,
    /// Ids of tasks that must complete first.
    #[serde(default)]
    pub blocked_by: Vec<String>,
    /// Files the task will touch, in addition to those named in the description.
    #[serde(default)]
    pub file_targets: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl TaskSpec {
    pub fn new(description: &str) -> Self {
        Self {
            description: description.to_string(),
            ..Default::default()
        }
    }

    pub fn blocked_by(mut self, ids: &[&str]) -> Self {
        self.blocked_by = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn with_targets(mut self, targets: &[&str]) -> Self {
        self.file_targets = targets.iter().map(|s| s.to_string()).collect();
        self
    }
}

/// A unit of work in a team's pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub description: String,
    pub status: TaskStatus,
    pub owner: Option<String>,
    pub blocked_by: Vec<String>,
    /// Declared targets plus those extracted from the description.
    pub file_targets: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub claimed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
    /// Times a stale claim on this task was released.
    #[serde(default)]
    pub release_count: u32,
    /// Whether the stale-claim warning was already logged for the current claim.
    #[serde(default)]
    pub warned: bool,
}

/// A stale claim that was released back to `pending`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseEvent {
    pub task_id: String,
    pub previous_owner: String,
    pub claimed_at: DateTime<Utc>,
    pub released_at: DateTime<Utc>,
}

/// Outcome of one stale-claim sweep.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StaleSweep {
    pub released: Vec<ReleaseEvent>,
    /// Tasks warned about for the first time in this sweep.
    pub warned: Vec<String>,
    /// Unfinished tasks whose claims were released at least `max_releases` times.
    pub repeatedly_failing: Vec<String>,
}

impl StaleSweep {
    pub fn is_empty(&self) -> bool {
        self.released.is_empty() && self.warned.is_empty() && self.repeatedly_failing.is_empty()
    }
}

/// On-disk pool document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolDocument {
    #[serde(default)]
    pub next_id: u64,
    #[serde(default)]
    pub tasks: Vec<Task>,
    #[serde(default)]
    pub release_log: Vec<ReleaseEvent>,
}

impl PoolDocument {
    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Task> {
        self.tasks.iter_mut().find(|t| t.id == id)
    }

    /// Ids in `task.blocked_by` that are not completed yet.
    pub fn waiting_on(&self, task: &Task) -> Vec<String> {
        task.blocked_by
            .iter()
            .filter(|dep| {
                self.get(dep)
                    .map(|d| d.status != TaskStatus::Completed)
                    .unwrap_or(true)
            })
            .cloned()
            .collect()
    }

    pub fn is_unblocked(&self, task: &Task) -> bool {
        task.status == TaskStatus::Pending && self.waiting_on(task).is_empty()
    }
}
