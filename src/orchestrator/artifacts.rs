//! Artifact content hashes recorded with completed phases.

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::warn;

/// sha256 hex digest of a file, `None` if it cannot be read.
pub fn hash_file(path: &Path) -> Option<String> {
    let bytes = fs::read(path).ok()?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Some(format!("{:x}", hasher.finalize()))
}

/// Recorded in place of a digest for a declared artifact that was absent.
pub const MISSING_DIGEST: &str = "";

/// Hash every declared artifact. Paths are relative to `project_dir`; an
/// absent artifact is recorded as [`MISSING_DIGEST`].
pub fn hash_artifacts(project_dir: &Path, artifacts: &[String]) -> BTreeMap<String, String> {
    let mut hashes = BTreeMap::new();
    for rel in artifacts {
        let digest = hash_file(&project_dir.join(rel)).unwrap_or_else(|| {
            warn!(artifact = %rel, "Declared artifact is missing");
            MISSING_DIGEST.to_string()
        });
        hashes.insert(rel.clone(), digest);
    }
    hashes
}

/// First recorded artifact that is missing or whose current content
/// differs from what was recorded.
pub fn first_mismatch(project_dir: &Path, recorded: &BTreeMap<String, String>) -> Option<String> {
    recorded.iter().find_map(|(rel, digest)| {
        match hash_file(&project_dir.join(rel)) {
            None if digest == MISSING_DIGEST => Some(format!("artifact {} was never produced", rel)),
            None => Some(format!("artifact {} is missing", rel)),
            Some(current) if &current == digest => None,
            Some(_) => Some(format!("artifact {} changed", rel)),
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_known_digest() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "abc").unwrap();
        assert_eq!(
            hash_file(&dir.path().join("a.txt")).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_mismatch_detection() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("out.md"), "v1").unwrap();
        let recorded = hash_artifacts(dir.path(), &["out.md".to_string()]);
        assert!(first_mismatch(dir.path(), &recorded).is_none());

        fs::write(dir.path().join("out.md"), "v2").unwrap();
        assert!(first_mismatch(dir.path(), &recorded).unwrap().contains("changed"));

        fs::remove_file(dir.path().join("out.md")).unwrap();
        assert!(first_mismatch(dir.path(), &recorded).unwrap().contains("missing"));
    }

    #[test]
    fn test_absent_artifact_never_verifies() {
        let dir = tempdir().unwrap();
        let recorded = hash_artifacts(dir.path(), &["plan.md".to_string()]);
        assert_eq!(recorded.get("plan.md").map(String::as_str), Some(MISSING_DIGEST));
        assert!(first_mismatch(dir.path(), &recorded).unwrap().contains("never produced"));

        fs::write(dir.path().join("plan.md"), "late").unwrap();
        assert!(first_mismatch(dir.path(), &recorded).unwrap().contains("changed"));
    }
}
