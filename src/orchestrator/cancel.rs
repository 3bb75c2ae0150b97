//! Cancellation flags.
//!
//! A run is cancelled by creating `runs/<pipeline>/<run_id>/cancel`; a batch
//! meta-loop is stopped before its next run by creating `batch.cancel`. The
//! orchestrator only polls; it never blocks on a flag.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct CancelFlag {
    path: PathBuf,
}

impl CancelFlag {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_set(&self) -> bool {
        self.path.exists()
    }

    pub fn request(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        fs::write(&self.path, chrono::Utc::now().to_rfc3339())
            .with_context(|| format!("Failed to write {}", self.path.display()))
    }

    pub fn clear(&self) -> Result<()> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", self.path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_request_and_clear() {
        let dir = tempdir().unwrap();
        let flag = CancelFlag::new(&dir.path().join("runs/build/r1/cancel"));
        assert!(!flag.is_set());
        flag.request().unwrap();
        assert!(flag.is_set());
        flag.clear().unwrap();
        flag.clear().unwrap();
        assert!(!flag.is_set());
    }
}
