//! Checkpoint persistence: atomic writes, migrate-on-load, run discovery.

use chrono::Utc;
use serde_json::Value;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use super::migrate::{migrate, schema_version_of};
use super::types::{CURRENT_SCHEMA_VERSION, Checkpoint};
use crate::config::ConvoyPaths;
use crate::errors::CheckpointError;

/// Result of reading a checkpoint file. Never an error: callers decide
/// between fresh start and abort.
#[derive(Debug, Clone)]
pub enum LoadOutcome {
    Loaded(Box<Checkpoint>),
    /// No file at the path.
    Missing,
    /// The file exists but cannot be used as-is.
    Unreadable { reason: String },
}

/// Read, migrate and parse a checkpoint file.
pub fn load(path: &Path) -> LoadOutcome {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return LoadOutcome::Missing,
        Err(e) => {
            return LoadOutcome::Unreadable {
                reason: format!("read failed: {}", e),
            };
        }
    };
    let value: Value = match serde_json::from_str(&content) {
        Ok(v) => v,
        Err(e) => {
            return LoadOutcome::Unreadable {
                reason: format!("invalid JSON: {}", e),
            };
        }
    };

    let version = schema_version_of(&value);
    let migrated = match migrate(value, version, CURRENT_SCHEMA_VERSION) {
        Ok(v) => v,
        Err(e) => {
            return LoadOutcome::Unreadable {
                reason: e.to_string(),
            };
        }
    };
    if version < CURRENT_SCHEMA_VERSION {
        debug!(
            path = %path.display(),
            from = version,
            to = CURRENT_SCHEMA_VERSION,
            "Migrated checkpoint"
        );
    }

    match serde_json::from_value::<Checkpoint>(migrated) {
        Ok(cp) => LoadOutcome::Loaded(Box::new(cp)),
        Err(e) => LoadOutcome::Unreadable {
            reason: format!("schema mismatch: {}", e),
        },
    }
}

/// Write `checkpoint` to `path` via a temp file and rename.
pub fn save(path: &Path, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
    let content = serde_json::to_string_pretty(checkpoint)?;
    write_atomic(path, content.as_bytes()).map_err(|source| CheckpointError::WriteFailed {
        path: path.to_path_buf(),
        source,
    })
}

/// Write-to-temp then rename, so readers see either the old or new file.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension(format!("tmp.{}", std::process::id()));
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path).inspect_err(|_| {
        let _ = fs::remove_file(&tmp);
    })
}

/// Checkpoints of one project, addressed by pipeline and run id.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    paths: ConvoyPaths,
}

/// A checkpoint found on disk during discovery.
#[derive(Debug, Clone)]
pub struct RunListing {
    pub path: PathBuf,
    pub outcome: LoadOutcome,
}

impl CheckpointStore {
    pub fn new(paths: ConvoyPaths) -> Self {
        Self { paths }
    }

    pub fn path_for(&self, pipeline: &str, run_id: &str) -> PathBuf {
        self.paths.checkpoint_file(pipeline, run_id)
    }

    pub fn load_run(&self, pipeline: &str, run_id: &str) -> LoadOutcome {
        load(&self.path_for(pipeline, run_id))
    }

    /// Persist, bumping `updated_at`. The schema version never goes down.
    pub fn save(&self, checkpoint: &mut Checkpoint) -> Result<PathBuf, CheckpointError> {
        checkpoint.updated_at = Utc::now();
        checkpoint.schema_version = checkpoint.schema_version.max(CURRENT_SCHEMA_VERSION);
        let path = self.path_for(&checkpoint.pipeline, &checkpoint.run_id);
        save(&path, checkpoint)?;
        Ok(path)
    }

    /// Every run directory of a pipeline with its load outcome.
    pub fn list(&self, pipeline: &str) -> Vec<RunListing> {
        let dir = self.paths.pipeline_runs_dir(pipeline);
        let Ok(entries) = fs::read_dir(&dir) else {
            return Vec::new();
        };
        let mut listings: Vec<RunListing> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|e| {
                let path = e.path().join("checkpoint.json");
                let outcome = load(&path);
                RunListing { path, outcome }
            })
            .collect();
        listings.sort_by(|a, b| a.path.cmp(&b.path));
        listings
    }

    /// Pipelines that have at least one run directory.
    pub fn pipelines(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(self.paths.runs_dir()) else {
            return Vec::new();
        };
        let mut names: Vec<String> = entries
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .filter_map(|e| e.file_name().to_str().map(str::to_string))
            .collect();
        names.sort();
        names
    }

    /// Most recently updated unfinished checkpoint accepted by `eligible`.
    pub fn discover_latest<F>(&self, pipeline: &str, eligible: F) -> Option<Checkpoint>
    where
        F: Fn(&Checkpoint) -> bool,
    {
        self.list(pipeline)
            .into_iter()
            .filter_map(|listing| match listing.outcome {
                LoadOutcome::Loaded(cp) => Some(*cp),
                LoadOutcome::Unreadable { reason } => {
                    warn!(path = %listing.path.display(), %reason, "Skipping unreadable checkpoint");
                    None
                }
                LoadOutcome::Missing => None,
            })
            .filter(|cp| !cp.is_finished() && eligible(cp))
            .max_by_key(|cp| cp.updated_at)
    }

    /// Move a run's directory under `archive/`. Returns the new location.
    pub fn archive(&self, checkpoint: &Checkpoint) -> Result<PathBuf, CheckpointError> {
        let from = self.paths.run_dir(&checkpoint.pipeline, &checkpoint.run_id);
        let to = self
            .paths
            .archived_run_dir(&checkpoint.pipeline, &checkpoint.run_id);
        let archive_err = |source| CheckpointError::ArchiveFailed {
            path: from.clone(),
            source,
        };
        if let Some(parent) = to.parent() {
            fs::create_dir_all(parent).map_err(archive_err)?;
        }
        if to.exists() {
            fs::remove_dir_all(&to).map_err(archive_err)?;
        }
        fs::rename(&from, &to).map_err(archive_err)?;
        info!(run_id = %checkpoint.run_id, to = %to.display(), "Archived run");
        Ok(to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::types::PhaseStatus;
    use crate::session::SessionState;
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn session() -> SessionState {
        SessionState {
            config_root: PathBuf::from("/p/.convoy"),
            owner_pid: 1,
            session_id: "s".into(),
            process_name: None,
        }
    }

    fn checkpoint(run_id: &str) -> Checkpoint {
        Checkpoint::new(
            run_id,
            "build",
            &["plan".to_string(), "review".to_string()],
            session(),
            60,
        )
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            load(&dir.path().join("nope.json")),
            LoadOutcome::Missing
        ));
    }

    #[test]
    fn test_load_garbage_is_unreadable_not_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        fs::write(&path, "{ truncated").unwrap();
        match load(&path) {
            LoadOutcome::Unreadable { reason } => assert!(reason.contains("invalid JSON")),
            other => panic!("expected Unreadable, got {:?}", other),
        }
    }

    #[test]
    fn test_load_newer_schema_is_unreadable() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        let mut value = serde_json::to_value(checkpoint("r")).unwrap();
        value["schema_version"] = serde_json::json!(CURRENT_SCHEMA_VERSION + 1);
        fs::write(&path, value.to_string()).unwrap();
        assert!(matches!(load(&path), LoadOutcome::Unreadable { .. }));
    }

    #[test]
    fn test_save_then_load_roundtrip_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(ConvoyPaths::new(dir.path()));
        let mut cp = checkpoint("r1");
        cp.phases[0].mark_completed(BTreeMap::from([("out.txt".into(), "ab".into())]));
        let path = store.save(&mut cp).unwrap();

        let LoadOutcome::Loaded(loaded) = load(&path) else {
            panic!("checkpoint did not load");
        };
        assert_eq!(*loaded, cp);

        let leftovers: Vec<_> = fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_discover_latest_skips_finished_and_ineligible() {
        let dir = tempdir().unwrap();
        let store = CheckpointStore::new(ConvoyPaths::new(dir.path()));

        let mut done = checkpoint("done");
        for p in &mut done.phases {
            p.status = PhaseStatus::Completed;
        }
        store.save(&mut done).unwrap();

        let mut older = checkpoint("older");
        store.save(&mut older).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let mut newer = checkpoint("newer");
        store.save(&mut newer).unwrap();

        let found = store.discover_latest("build", |_| true).unwrap();
        assert_eq!(found.run_id, "newer");

        let found = store
            .discover_latest("build", |cp| cp.run_id != "newer")
            .unwrap();
        assert_eq!(found.run_id, "older");
    }

    #[test]
    fn test_archive_moves_run_dir() {
        let dir = tempdir().unwrap();
        let paths = ConvoyPaths::new(dir.path());
        let store = CheckpointStore::new(paths.clone());
        let mut cp = checkpoint("r9");
        store.save(&mut cp).unwrap();

        let archived = store.archive(&cp).unwrap();
        assert!(archived.join("checkpoint.json").exists());
        assert!(!paths.run_dir("build", "r9").exists());
        assert!(store.list("build").is_empty());
    }
}
