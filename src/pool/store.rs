//! Lock-guarded, atomically written task pool.
//!
//! Every mutation runs as: take the exclusive `fs2` lock on `pool.lock`, read
//! `pool.json`, apply, write to a temp file and rename, unlock. Workers in
//! other processes therefore never observe a half-applied claim.

use chrono::{DateTime, Utc};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::targets::all_targets;
use super::types::{PoolDocument, ReleaseEvent, StaleSweep, Task, TaskSpec, TaskStatus};
use crate::checkpoint::store::write_atomic;
use crate::errors::PoolError;

const POOL_FILE: &str = "pool.json";
const LOCK_FILE: &str = "pool.lock";
const DEFAULT_MAX_RELEASES: u32 = 3;

/// Handle on one team's task pool directory.
#[derive(Debug, Clone)]
pub struct TaskPool {
    dir: PathBuf,
    max_releases: u32,
}

/// Held for the duration of one pool transaction.
struct PoolLock {
    file: File,
}

impl Drop for PoolLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

impl TaskPool {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            max_releases: DEFAULT_MAX_RELEASES,
        }
    }

    pub fn with_max_releases(mut self, max_releases: u32) -> Self {
        self.max_releases = max_releases.max(1);
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn pool_file(&self) -> PathBuf {
        self.dir.join(POOL_FILE)
    }

    fn io_err(&self, path: &Path) -> impl FnOnce(std::io::Error) -> PoolError {
        let path = path.to_path_buf();
        move |source| PoolError::Io { path, source }
    }

    /// Lock the pool. Only task creation makes the directory, so workers of a
    /// torn-down team get an I/O error instead of recreating it.
    fn lock(&self, exclusive: bool) -> Result<PoolLock, PoolError> {
        let path = self.dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(self.io_err(&path))?;
        let locked = if exclusive {
            file.lock_exclusive()
        } else {
            file.lock_shared()
        };
        locked.map_err(self.io_err(&path))?;
        Ok(PoolLock { file })
    }

    fn read_document(&self) -> Result<PoolDocument, PoolError> {
        let path = self.pool_file();
        match fs::read_to_string(&path) {
            Ok(content) => {
                serde_json::from_str(&content).map_err(|source| PoolError::Corrupt { path, source })
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PoolDocument::default()),
            Err(e) => Err(PoolError::Io { path, source: e }),
        }
    }

    fn write_document(&self, doc: &PoolDocument) -> Result<(), PoolError> {
        let path = self.pool_file();
        let content = serde_json::to_vec_pretty(doc).map_err(|source| PoolError::Corrupt {
            path: path.clone(),
            source,
        })?;
        write_atomic(&path, &content).map_err(self.io_err(&path))
    }

    /// Run `f` against the document under the exclusive lock and persist the
    /// result if `f` succeeds.
    fn transact<T>(
        &self,
        f: impl FnOnce(&mut PoolDocument) -> Result<T, PoolError>,
    ) -> Result<T, PoolError> {
        let _lock = self.lock(true)?;
        let mut doc = self.read_document()?;
        let out = f(&mut doc)?;
        self.write_document(&doc)?;
        Ok(out)
    }

    /// Consistent read under a shared lock.
    pub fn snapshot(&self) -> Result<PoolDocument, PoolError> {
        if !self.pool_file().exists() {
            return Ok(PoolDocument::default());
        }
        let _lock = self.lock(false)?;
        self.read_document()
    }

    /// Add a task. Any earlier unfinished task with an overlapping file
    /// target becomes a blocker of the new one.
    pub fn create_task(&self, spec: TaskSpec) -> Result<String, PoolError> {
        fs::create_dir_all(&self.dir).map_err(self.io_err(&self.dir))?;
        self.transact(|doc| {
            for dep in &spec.blocked_by {
                if doc.get(dep).is_none() {
                    return Err(PoolError::UnknownDependency {
                        dependency: dep.clone(),
                    });
                }
            }

            let file_targets = all_targets(&spec.description, &spec.file_targets);
            let mut blocked_by = spec.blocked_by.clone();
            for earlier in &doc.tasks {
                if earlier.status == TaskStatus::Completed || blocked_by.contains(&earlier.id) {
                    continue;
                }
                if earlier.file_targets.iter().any(|t| file_targets.contains(t)) {
                    debug!(task = %earlier.id, "Serializing on shared file target");
                    blocked_by.push(earlier.id.clone());
                }
            }

            doc.next_id += 1;
            let id = doc.next_id.to_string();
            doc.tasks.push(Task {
                id: id.clone(),
                description: spec.description.clone(),
                status: TaskStatus::Pending,
                owner: None,
                blocked_by,
                file_targets,
                metadata: spec.metadata.clone(),
                created_at: Utc::now(),
                claimed_at: None,
                completed_at: None,
                release_count: 0,
                warned: false,
            });
            Ok(id)
        })
    }

    /// Claim a pending, unblocked task for `owner`.
    pub fn claim(&self, task_id: &str, owner: &str) -> Result<Task, PoolError> {
        self.transact(|doc| {
            let task = doc.get(task_id).ok_or_else(|| PoolError::NotFound {
                id: task_id.to_string(),
            })?;
            match task.status {
                TaskStatus::Completed => {
                    return Err(PoolError::AlreadyCompleted {
                        id: task_id.to_string(),
                    });
                }
                TaskStatus::InProgress => {
                    return Err(PoolError::AlreadyClaimed {
                        id: task_id.to_string(),
                        owner: task.owner.clone().unwrap_or_default(),
                    });
                }
                TaskStatus::Pending => {}
            }
            let waiting_on = doc.waiting_on(task);
            if !waiting_on.is_empty() {
                return Err(PoolError::Blocked {
                    id: task_id.to_string(),
                    waiting_on,
                });
            }

            let Some(task) = doc.get_mut(task_id) else {
                return Err(PoolError::NotFound {
                    id: task_id.to_string(),
                });
            };
            task.status = TaskStatus::InProgress;
            task.owner = Some(owner.to_string());
            task.claimed_at = Some(Utc::now());
            task.warned = false;
            Ok(task.clone())
        })
    }

    /// Claim the first unblocked task, if any.
    pub fn claim_next(&self, owner: &str) -> Result<Option<Task>, PoolError> {
        self.transact(|doc| {
            let Some(id) = doc
                .tasks
                .iter()
                .find(|t| doc.is_unblocked(t))
                .map(|t| t.id.clone())
            else {
                return Ok(None);
            };
            let Some(task) = doc.get_mut(&id) else {
                return Ok(None);
            };
            task.status = TaskStatus::InProgress;
            task.owner = Some(owner.to_string());
            task.claimed_at = Some(Utc::now());
            task.warned = false;
            Ok(Some(task.clone()))
        })
    }

    /// Mark a task completed. Completing a completed task is a no-op.
    pub fn complete(&self, task_id: &str, owner: Option<&str>) -> Result<Task, PoolError> {
        self.transact(|doc| {
            let task = doc.get_mut(task_id).ok_or_else(|| PoolError::NotFound {
                id: task_id.to_string(),
            })?;
            match task.status {
                TaskStatus::Completed => return Ok(task.clone()),
                TaskStatus::Pending => {
                    return Err(PoolError::NotClaimed {
                        id: task_id.to_string(),
                    });
                }
                TaskStatus::InProgress => {}
            }
            if let Some(caller) = owner
                && task.owner.as_deref() != Some(caller)
            {
                return Err(PoolError::OwnerMismatch {
                    id: task_id.to_string(),
                    owner: task.owner.clone().unwrap_or_default(),
                    caller: caller.to_string(),
                });
            }
            task.status = TaskStatus::Completed;
            task.completed_at = Some(Utc::now());
            Ok(task.clone())
        })
    }

    /// Pending tasks whose blockers have all completed.
    pub fn list_unblocked(&self) -> Result<Vec<Task>, PoolError> {
        let doc = self.snapshot()?;
        Ok(doc
            .tasks
            .iter()
            .filter(|t| doc.is_unblocked(t))
            .cloned()
            .collect())
    }

    pub fn list(&self, status: Option<TaskStatus>) -> Result<Vec<Task>, PoolError> {
        let doc = self.snapshot()?;
        Ok(doc
            .tasks
            .into_iter()
            .filter(|t| status.is_none_or(|s| t.status == s))
            .collect())
    }

    /// Ids of completed tasks.
    pub fn completed_ids(&self) -> Result<Vec<String>, PoolError> {
        Ok(self
            .list(Some(TaskStatus::Completed))?
            .into_iter()
            .map(|t| t.id)
            .collect())
    }

    pub fn release_log(&self) -> Result<Vec<ReleaseEvent>, PoolError> {
        Ok(self.snapshot()?.release_log)
    }

    /// Release claims older than `stale_after`, warn once about claims older
    /// than `warn_after`.
    pub fn release_stale(
        &self,
        stale_after: Duration,
        warn_after: Duration,
    ) -> Result<StaleSweep, PoolError> {
        self.release_stale_at(Utc::now(), stale_after, warn_after)
    }

    /// [`TaskPool::release_stale`] evaluated at an explicit instant.
    pub fn release_stale_at(
        &self,
        now: DateTime<Utc>,
        stale_after: Duration,
        warn_after: Duration,
    ) -> Result<StaleSweep, PoolError> {
        if !self.pool_file().exists() {
            return Ok(StaleSweep::default());
        }
        let stale_after = chrono::Duration::from_std(stale_after).unwrap_or(chrono::Duration::MAX);
        let warn_after = chrono::Duration::from_std(warn_after).unwrap_or(chrono::Duration::MAX);
        let max_releases = self.max_releases;

        self.transact(|doc| {
            let mut sweep = StaleSweep::default();
            for task in doc.tasks.iter_mut() {
                if task.status != TaskStatus::InProgress {
                    continue;
                }
                let Some(claimed_at) = task.claimed_at else {
                    continue;
                };
                let age = now - claimed_at;
                let owner = task.owner.clone().unwrap_or_default();

                if age >= stale_after {
                    task.status = TaskStatus::Pending;
                    task.owner = None;
                    task.claimed_at = None;
                    task.warned = false;
                    task.release_count += 1;
                    warn!(
                        task_id = %task.id,
                        owner = %owner,
                        releases = task.release_count,
                        "Released stale claim"
                    );
                    sweep.released.push(ReleaseEvent {
                        task_id: task.id.clone(),
                        previous_owner: owner,
                        claimed_at,
                        released_at: now,
                    });
                } else if age >= warn_after && !task.warned {
                    task.warned = true;
                    warn!(
                        task_id = %task.id,
                        owner = %owner,
                        age_secs = age.num_seconds(),
                        "Claim is approaching the stale threshold"
                    );
                    sweep.warned.push(task.id.clone());
                }
            }
            sweep.repeatedly_failing = doc
                .tasks
                .iter()
                .filter(|t| t.status != TaskStatus::Completed && t.release_count >= max_releases)
                .map(|t| t.id.clone())
                .collect();
            doc.release_log.extend(sweep.released.iter().cloned());
            if !sweep.released.is_empty() {
                info!(count = sweep.released.len(), "Stale sweep released claims");
            }
            Ok(sweep)
        })
    }

    /// Remove the pool directory.
    pub fn destroy(&self) -> Result<(), PoolError> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(PoolError::Io {
                path: self.dir.clone(),
                source: e,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const MIN: Duration = Duration::from_secs(60);

    fn pool() -> (TaskPool, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        (TaskPool::new(&dir.path().join("tasks/team-a")), dir)
    }

    #[test]
    fn test_create_assigns_sequential_ids() {
        let (pool, _dir) = pool();
        assert_eq!(pool.create_task(TaskSpec::new("a")).unwrap(), "1");
        assert_eq!(pool.create_task(TaskSpec::new("b")).unwrap(), "2");
        assert_eq!(pool.list(None).unwrap().len(), 2);
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let (pool, _dir) = pool();
        let err = pool
            .create_task(TaskSpec::new("a").blocked_by(&["99"]))
            .unwrap_err();
        assert!(matches!(err, PoolError::UnknownDependency { .. }));
    }

    #[test]
    fn test_overlapping_targets_are_serialized() {
        let (pool, _dir) = pool();
        let first = pool.create_task(TaskSpec::new("Fix src/lib.rs parsing")).unwrap();
        let second = pool
            .create_task(TaskSpec::new("Add docs").with_targets(&["src/lib.rs"]))
            .unwrap();
        let third = pool.create_task(TaskSpec::new("Edit README.md")).unwrap();

        let unblocked: Vec<String> = pool.list_unblocked().unwrap().into_iter().map(|t| t.id).collect();
        assert_eq!(unblocked, vec![first.clone(), third]);

        let err = pool.claim(&second, "w1").unwrap_err();
        assert!(matches!(err, PoolError::Blocked { ref waiting_on, .. } if waiting_on == &vec![first.clone()]));

        pool.claim(&first, "w1").unwrap();
        pool.complete(&first, Some("w1")).unwrap();
        assert!(pool.list_unblocked().unwrap().iter().any(|t| t.id == second));
    }

    #[test]
    fn test_claim_errors() {
        let (pool, _dir) = pool();
        let id = pool.create_task(TaskSpec::new("a")).unwrap();
        assert!(matches!(pool.claim("404", "w"), Err(PoolError::NotFound { .. })));

        pool.claim(&id, "w1").unwrap();
        assert!(matches!(
            pool.claim(&id, "w2"),
            Err(PoolError::AlreadyClaimed { ref owner, .. }) if owner == "w1"
        ));

        pool.complete(&id, None).unwrap();
        assert!(matches!(pool.claim(&id, "w2"), Err(PoolError::AlreadyCompleted { .. })));
    }

    #[test]
    fn test_complete_checks_owner_and_is_idempotent() {
        let (pool, _dir) = pool();
        let id = pool.create_task(TaskSpec::new("a")).unwrap();
        assert!(matches!(pool.complete(&id, None), Err(PoolError::NotClaimed { .. })));

        pool.claim(&id, "w1").unwrap();
        assert!(matches!(
            pool.complete(&id, Some("w2")),
            Err(PoolError::OwnerMismatch { .. })
        ));
        let done = pool.complete(&id, Some("w1")).unwrap();
        assert_eq!(done.status, TaskStatus::Completed);
        let again = pool.complete(&id, Some("w2")).unwrap();
        assert_eq!(again.completed_at, done.completed_at);
    }

    #[test]
    fn test_stale_claim_released_exactly_once() {
        let (pool, _dir) = pool();
        let id = pool.create_task(TaskSpec::new("a")).unwrap();
        let claimed = pool.claim(&id, "w1").unwrap();
        let later = claimed.claimed_at.unwrap() + chrono::Duration::minutes(11);

        let first = pool.release_stale_at(later, 10 * MIN, 5 * MIN).unwrap();
        let second = pool.release_stale_at(later, 10 * MIN, 5 * MIN).unwrap();
        assert_eq!(first.released.len(), 1);
        assert_eq!(first.released[0].previous_owner, "w1");
        assert!(second.released.is_empty());
        assert_eq!(pool.release_log().unwrap().len(), 1);

        let task = pool.claim(&id, "w2").unwrap();
        assert_eq!(task.owner.as_deref(), Some("w2"));
        assert_eq!(task.release_count, 1);
    }

    #[test]
    fn test_warning_logged_once_per_claim() {
        let (pool, _dir) = pool();
        let id = pool.create_task(TaskSpec::new("a")).unwrap();
        let claimed = pool.claim(&id, "w1").unwrap();
        let at = claimed.claimed_at.unwrap() + chrono::Duration::minutes(6);

        assert_eq!(pool.release_stale_at(at, 10 * MIN, 5 * MIN).unwrap().warned, vec![id.clone()]);
        assert!(pool.release_stale_at(at, 10 * MIN, 5 * MIN).unwrap().warned.is_empty());
    }

    #[test]
    fn test_repeated_releases_are_reported() {
        let (pool, _dir) = pool();
        let pool = pool.with_max_releases(2);
        let id = pool.create_task(TaskSpec::new("a")).unwrap();
        let mut last = StaleSweep::default();
        for _ in 0..2 {
            let claimed = pool.claim(&id, "w").unwrap();
            let at = claimed.claimed_at.unwrap() + chrono::Duration::minutes(20);
            last = pool.release_stale_at(at, 10 * MIN, 5 * MIN).unwrap();
        }
        assert_eq!(last.repeatedly_failing, vec![id]);
    }

    #[test]
    fn test_claim_next_takes_first_unblocked() {
        let (pool, _dir) = pool();
        let a = pool.create_task(TaskSpec::new("a")).unwrap();
        pool.create_task(TaskSpec::new("b").blocked_by(&[a.as_str()])).unwrap();
        let got = pool.claim_next("w").unwrap().unwrap();
        assert_eq!(got.id, a);
        assert!(pool.claim_next("w").unwrap().is_none());
    }

    #[test]
    fn test_destroyed_pool_is_not_recreated_by_workers() {
        let (pool, _dir) = pool();
        pool.create_task(TaskSpec::new("a")).unwrap();
        pool.destroy().unwrap();
        assert!(matches!(pool.claim_next("w"), Err(PoolError::Io { .. })));
        assert!(!pool.dir().exists());
    }

    #[test]
    fn test_concurrent_claims_have_single_winner() {
        let (pool, _dir) = pool();
        let id = pool.create_task(TaskSpec::new("a")).unwrap();
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let pool = pool.clone();
                let id = id.clone();
                std::thread::spawn(move || pool.claim(&id, &format!("w{}", i)).is_ok())
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|won| *won)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(pool.list(Some(TaskStatus::InProgress)).unwrap().len(), 1);
    }
}
