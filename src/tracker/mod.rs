//! Change tracking for the convergence tier heuristic.

pub mod git;

pub use git::GitTracker;

use serde::{Deserialize, Serialize};

/// Size and risk of the change a convergence loop is reviewing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeProfile {
    pub files_changed: u32,
    pub lines_added: u32,
    pub lines_removed: u32,
    /// Why the change is considered risky, one entry per matched category.
    #[serde(default)]
    pub risk_signals: Vec<String>,
    #[serde(default)]
    pub paths: Vec<String>,
}

impl ChangeProfile {
    pub fn lines_changed(&self) -> u32 {
        self.lines_added + self.lines_removed
    }
}

/// Path fragments that make a change risky, by category.
const RISK_PATTERNS: &[(&str, &[&str])] = &[
    ("security", &["auth", "security", "crypto", "secret", "password", "token"]),
    ("schema", &["migration", "schema", ".sql"]),
    ("dependencies", &["cargo.toml", "cargo.lock", "package.json", "go.mod"]),
    ("ci", &[".github/workflows", "dockerfile", ".gitlab-ci"]),
    ("concurrency", &["lock", "mutex", "atomic", "concurren"]),
];

/// Risk categories touched by any of `paths`.
pub fn risk_signals_for(paths: &[String]) -> Vec<String> {
    RISK_PATTERNS
        .iter()
        .filter(|(_, needles)| {
            paths.iter().any(|p| {
                let p = p.to_lowercase();
                needles.iter().any(|n| p.contains(n))
            })
        })
        .map(|(category, _)| category.to_string())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_risk_signals_by_category() {
        let paths = vec!["src/auth/login.rs".to_string(), "Cargo.toml".to_string()];
        assert_eq!(risk_signals_for(&paths), vec!["security", "dependencies"]);
        assert!(risk_signals_for(&["docs/guide.md".to_string()]).is_empty());
    }
}
