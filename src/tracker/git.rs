use anyhow::{Context, Result};
use git2::{Delta, DiffOptions, Repository};
use std::path::Path;

use super::{ChangeProfile, risk_signals_for};

pub struct GitTracker {
    repo: Repository,
}

impl GitTracker {
    pub fn new(project_dir: &Path) -> Result<Self> {
        let repo = Repository::open(project_dir).context("Failed to open git repository")?;
        Ok(Self { repo })
    }

    /// Get the HEAD commit if it exists (returns None for unborn branches)
    fn get_head_commit(&self) -> Option<git2::Commit<'_>> {
        self.repo
            .head()
            .ok()
            .and_then(|head| head.peel_to_commit().ok())
    }

    /// Uncommitted changes (index and worktree, untracked included) against HEAD.
    pub fn change_profile(&self) -> Result<ChangeProfile> {
        let head_tree = match self.get_head_commit() {
            Some(commit) => Some(commit.tree()?),
            None => None,
        };

        let mut opts = DiffOptions::new();
        opts.include_untracked(true)
            .recurse_untracked_dirs(true)
            .show_untracked_content(true);

        let diff = self
            .repo
            .diff_tree_to_workdir_with_index(head_tree.as_ref(), Some(&mut opts))
            .context("Failed to diff working tree against HEAD")?;

        let mut profile = ChangeProfile::default();
        diff.foreach(
            &mut |delta, _progress| {
                let path = delta.new_file().path().or_else(|| delta.old_file().path());
                if let Some(path) = path
                    && !matches!(delta.status(), Delta::Unmodified | Delta::Ignored)
                {
                    profile.paths.push(path.to_string_lossy().into_owned());
                }
                true
            },
            None,
            None,
            Some(&mut |_delta, _hunk, line| {
                match line.origin() {
                    '+' => profile.lines_added += 1,
                    '-' => profile.lines_removed += 1,
                    _ => {}
                }
                true
            }),
        )?;

        profile.paths.sort();
        profile.paths.dedup();
        profile.files_changed = profile.paths.len() as u32;
        profile.risk_signals = risk_signals_for(&profile.paths);
        Ok(profile)
    }
}
