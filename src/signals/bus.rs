//! Filesystem signal bus with task-pool fallback.
//!
//! Layout of a team's signal directory:
//!
//! ```text
//! signals/<team>/
//!   expected          number of completions the phase waits for
//!   <task_id>.done    written by a worker once per finished task
//!   seen/             markers the orchestrator has consumed
//!   ALL_DONE          written by the worker that completes the set
//! ```
//!
//! Markers are an advisory journal: the task pool stays the source of truth
//! and is unioned into the result on every exit path.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::checkpoint::store::write_atomic;
use crate::errors::SignalError;
use crate::pool::{ReleaseEvent, TaskPool};

const EXPECTED_FILE: &str = "expected";
const SENTINEL_FILE: &str = "ALL_DONE";
const SEEN_DIR: &str = "seen";
const MARKER_EXT: &str = "done";

/// Longest uninterrupted sleep, so cancellation is noticed promptly.
const CANCEL_CHECK_INTERVAL: Duration = Duration::from_secs(1);

/// Which source produced the final poll of a wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignalPath {
    #[default]
    SignalDirectory,
    TaskPool,
}

/// Result of waiting for a phase's workers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DoneSet {
    pub done: BTreeSet<String>,
    pub expected: BTreeSet<String>,
    /// Every expected task is done.
    pub complete: bool,
    pub timed_out: bool,
    pub cancelled: bool,
    pub path_used: SignalPath,
    /// The signal directory was unavailable at some point.
    pub fallback_engaged: bool,
    pub releases: Vec<ReleaseEvent>,
    /// Tasks released too many times; the wait stops early when non-empty.
    pub repeatedly_failing: Vec<String>,
}

impl DoneSet {
    pub fn missing(&self) -> Vec<String> {
        self.expected.difference(&self.done).cloned().collect()
    }
}

/// Poll intervals and stale thresholds for [`SignalBus::wait_for_signals`].
#[derive(Debug, Clone)]
pub struct WaitSettings {
    pub signal_poll: Duration,
    pub pool_poll: Duration,
    pub stale_after: Duration,
    pub warn_after: Duration,
}

/// Result of a worker-side [`SignalBus::signal_done`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    Recorded,
    /// This marker completed the expected set; `ALL_DONE` was written.
    SentinelWritten,
    /// No signal directory; the pool alone carries the completion.
    NoSignalDirectory,
}

/// One team's signal directory.
#[derive(Debug, Clone)]
pub struct SignalBus {
    dir: PathBuf,
}

impl SignalBus {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn io_err(path: &Path, source: std::io::Error) -> SignalError {
        SignalError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Reset the directory for a new wait on `expected` completions.
    pub fn prepare(&self, expected: usize) -> Result<(), SignalError> {
        if self.dir.exists() {
            fs::remove_dir_all(&self.dir).map_err(|e| Self::io_err(&self.dir, e))?;
        }
        let seen = self.dir.join(SEEN_DIR);
        fs::create_dir_all(&seen).map_err(|e| Self::io_err(&seen, e))?;
        let path = self.dir.join(EXPECTED_FILE);
        write_atomic(&path, expected.to_string().as_bytes()).map_err(|e| Self::io_err(&path, e))
    }

    /// Worker side: record that `task_id` finished.
    pub fn signal_done(&self, task_id: &str) -> Result<SignalOutcome, SignalError> {
        if task_id.is_empty()
            || task_id.contains("..")
            || !task_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(SignalError::InvalidTaskId {
                id: task_id.to_string(),
            });
        }
        if !self.dir.is_dir() {
            warn!(task_id, dir = %self.dir.display(), "No signal directory; relying on the task pool");
            return Ok(SignalOutcome::NoSignalDirectory);
        }

        let marker = self.dir.join(format!("{}.{}", task_id, MARKER_EXT));
        write_atomic(&marker, chrono::Utc::now().to_rfc3339().as_bytes())
            .map_err(|e| Self::io_err(&marker, e))?;

        let Some(expected) = self.expected_count() else {
            return Ok(SignalOutcome::Recorded);
        };
        if self.signalled_ids().len() >= expected {
            let sentinel = self.dir.join(SENTINEL_FILE);
            write_atomic(&sentinel, b"").map_err(|e| Self::io_err(&sentinel, e))?;
            info!(task_id, "All expected tasks signalled");
            return Ok(SignalOutcome::SentinelWritten);
        }
        Ok(SignalOutcome::Recorded)
    }

    fn expected_count(&self) -> Option<usize> {
        fs::read_to_string(self.dir.join(EXPECTED_FILE))
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    /// Ids with a marker, consumed or not.
    fn signalled_ids(&self) -> BTreeSet<String> {
        let mut ids = marker_ids(&self.dir);
        ids.extend(marker_ids(&self.dir.join(SEEN_DIR)));
        ids
    }

    fn sentinel_present(&self) -> bool {
        self.dir.join(SENTINEL_FILE).exists()
    }

    fn is_readable(&self) -> bool {
        fs::read_dir(&self.dir).is_ok()
    }

    /// Read and remove new markers, moving them to `seen/`.
    fn consume(&self) -> BTreeSet<String> {
        let ids = marker_ids(&self.dir);
        let seen = self.dir.join(SEEN_DIR);
        let _ = fs::create_dir_all(&seen);
        for id in &ids {
            let name = format!("{}.{}", id, MARKER_EXT);
            if fs::rename(self.dir.join(&name), seen.join(&name)).is_err() {
                let _ = fs::remove_file(self.dir.join(&name));
            }
        }
        ids
    }

    /// Wait until every `expected` task is done, the timeout passes, `cancelled`
    /// returns true, or the pool reports a repeatedly failing task.
    ///
    /// Never fails: a missing or unreadable signal directory switches to
    /// polling the task pool.
    pub async fn wait_for_signals<F>(
        &self,
        expected: &BTreeSet<String>,
        timeout: Duration,
        pool: &TaskPool,
        settings: &WaitSettings,
        cancelled: F,
    ) -> DoneSet
    where
        F: Fn() -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut result = DoneSet {
            expected: expected.clone(),
            ..Default::default()
        };
        let mut next_poll = Instant::now();

        loop {
            if cancelled() {
                info!("Cancellation requested while waiting for workers");
                result.cancelled = true;
                break;
            }

            let now = Instant::now();
            if now >= next_poll {
                self.sweep(pool, settings, &mut result);
                if !result.repeatedly_failing.is_empty() {
                    warn!(tasks = ?result.repeatedly_failing, "Tasks keep losing their claims");
                    break;
                }

                let (interval, sentinel) = if self.is_readable() {
                    result.path_used = SignalPath::SignalDirectory;
                    let fresh = self.consume();
                    if !fresh.is_empty() {
                        debug!(count = fresh.len(), "Consumed completion markers");
                    }
                    result.done.extend(fresh);
                    (settings.signal_poll, self.sentinel_present())
                } else {
                    if !result.fallback_engaged {
                        warn!(dir = %self.dir.display(), "Signal directory unavailable; polling the task pool");
                        result.fallback_engaged = true;
                    }
                    result.path_used = SignalPath::TaskPool;
                    match pool.completed_ids() {
                        Ok(ids) => result.done.extend(ids),
                        Err(e) => warn!(error = %e, "Task pool poll failed"),
                    }
                    (settings.pool_poll, false)
                };

                if sentinel || expected.is_subset(&result.done) {
                    break;
                }
                next_poll = now + interval;
            }

            let now = Instant::now();
            if now >= deadline {
                result.timed_out = true;
                break;
            }
            let wake = next_poll.min(deadline).min(now + CANCEL_CHECK_INTERVAL);
            tokio::time::sleep_until(wake).await;
        }

        // Final sweep: the pool is the source of truth.
        self.sweep(pool, settings, &mut result);
        match pool.completed_ids() {
            Ok(ids) => result.done.extend(ids),
            Err(e) => warn!(error = %e, "Final task pool read failed"),
        }
        result.complete = expected.is_subset(&result.done);
        if result.complete {
            result.timed_out = false;
        }
        result
    }

    fn sweep(&self, pool: &TaskPool, settings: &WaitSettings, result: &mut DoneSet) {
        match pool.release_stale(settings.stale_after, settings.warn_after) {
            Ok(sweep) => {
                result.releases.extend(sweep.released);
                result.repeatedly_failing = sweep.repeatedly_failing;
            }
            Err(e) => warn!(error = %e, "Stale-claim sweep failed"),
        }
    }

    /// Remove the signal directory.
    pub fn clear(&self) -> Result<(), SignalError> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::io_err(&self.dir, e)),
        }
    }
}

fn marker_ids(dir: &Path) -> BTreeSet<String> {
    let Ok(entries) = fs::read_dir(dir) else {
        return BTreeSet::new();
    };
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let path = e.path();
            if path.extension().and_then(|x| x.to_str()) != Some(MARKER_EXT) {
                return None;
            }
            path.file_stem()
                .and_then(|s| s.to_str())
                .map(str::to_string)
        })
        .collect()
}
