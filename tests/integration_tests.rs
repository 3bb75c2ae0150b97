//! Integration tests for the convoy CLI
//!
//! These tests drive the built binary against temporary project directories.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

use convoy::checkpoint::{Checkpoint, CheckpointStore};
use convoy::config::ConvoyPaths;
use convoy::pool::{TaskPool, TaskSpec};
use convoy::session::SessionState;
use convoy::signals::SignalBus;

/// Helper to create a convoy Command rooted in `dir`
fn convoy(dir: &Path) -> Command {
    let mut cmd = cargo_bin_cmd!("convoy");
    cmd.current_dir(dir)
        .env_remove("CONVOY_TEAM")
        .env_remove("CONVOY_WORKER")
        .env("XDG_CONFIG_HOME", dir.join(".xdg"))
        .env("CONVOY_LOG", "warn");
    cmd
}

fn write_config(dir: &Path, content: &str) {
    let convoy_dir = dir.join(".convoy");
    fs::create_dir_all(&convoy_dir).unwrap();
    fs::write(convoy_dir.join("convoy.toml"), content).unwrap();
}

/// A pid that no process can have.
const DEAD_PID: u32 = 4_194_305;

const CLEAN_REVIEW: &str = r#"
[phases.commands.review]
cycle_command = "echo '{\"issues_total\": 0}'"
"#;

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_convoy_help() {
        let dir = TempDir::new().unwrap();
        convoy(dir.path())
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("run"))
            .stdout(predicate::str::contains("batch"));
    }

    #[test]
    fn test_convoy_version() {
        let dir = TempDir::new().unwrap();
        convoy(dir.path()).arg("--version").assert().success();
    }

    #[test]
    fn test_unknown_pipeline() {
        let dir = TempDir::new().unwrap();
        convoy(dir.path())
            .args(["run", "deploy"])
            .assert()
            .code(1)
            .stderr(predicate::str::contains("Unknown pipeline 'deploy'"));
    }

    #[test]
    fn test_status_without_runs() {
        let dir = TempDir::new().unwrap();
        convoy(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("No runs in progress"));
    }
}

// =============================================================================
// Pipeline Runs
// =============================================================================

mod runs {
    use super::*;

    #[test]
    fn test_halt_then_resume() {
        let dir = TempDir::new().unwrap();

        // No cycle command: the review loop cannot run.
        convoy(dir.path())
            .args(["run", "review", "--run-id", "r1"])
            .assert()
            .code(1)
            .stdout(predicate::str::contains("halted in phase 'review'"))
            .stdout(predicate::str::contains("--resume --run-id r1"));

        convoy(dir.path())
            .args(["status", "review"])
            .assert()
            .success()
            .stdout(predicate::str::contains("r1"))
            .stdout(predicate::str::contains("failed"));

        write_config(dir.path(), CLEAN_REVIEW);
        convoy(dir.path())
            .args(["run", "review", "--resume"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Pipeline 'review' completed (run r1)"));

        assert!(!dir.path().join(".convoy/runs/review/r1").exists());
        assert!(dir.path().join(".convoy/archive").exists());

        convoy(dir.path())
            .args(["run", "review", "--resume"])
            .assert()
            .code(1)
            .stderr(predicate::str::contains("No unfinished checkpoint"));
    }

    #[test]
    fn test_failing_gate_is_content_failure() {
        let dir = TempDir::new().unwrap();
        write_config(
            dir.path(),
            &format!(
                "{}\n[phases.commands.gate]\ncommand = \"echo 'lint failed' >&2; exit 1\"\n",
                CLEAN_REVIEW
            ),
        );

        convoy(dir.path())
            .args(["run", "review"])
            .assert()
            .code(3)
            .stdout(predicate::str::contains("halted in phase 'gate'"))
            .stdout(predicate::str::contains("lint failed"));
    }

    #[test]
    fn test_existing_run_id_is_refused() {
        let dir = TempDir::new().unwrap();
        convoy(dir.path())
            .args(["run", "review", "--run-id", "dup"])
            .assert()
            .code(1);

        convoy(dir.path())
            .args(["run", "review", "--run-id", "dup"])
            .assert()
            .code(1)
            .stderr(predicate::str::contains("already exists"));
    }

    #[test]
    fn test_incompatible_checkpoint_exits_5() {
        let dir = TempDir::new().unwrap();
        let paths = ConvoyPaths::new(dir.path());
        paths.ensure_directories().unwrap();
        let mut cp = Checkpoint::new(
            "old",
            "review",
            &["gate".to_string(), "review".to_string()],
            SessionState {
                config_root: paths.convoy_dir.clone(),
                owner_pid: DEAD_PID,
                session_id: "gone".to_string(),
                process_name: None,
            },
            3600,
        );
        CheckpointStore::new(paths).save(&mut cp).unwrap();

        convoy(dir.path())
            .args(["run", "review", "--resume", "--run-id", "old"])
            .assert()
            .code(5);
    }

    #[test]
    fn test_fix_pipeline_with_worker_scripts() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("worker.sh"),
            r#"
while true; do
  out=$("$CONVOY_BIN" task claim)
  [ -z "$out" ] && exit 0
  id=$(printf '%s' "$out" | sed 's/.*"id":"\([^"]*\)".*/\1/')
  "$CONVOY_BIN" task complete "$id" || exit 1
  "$CONVOY_BIN" signal done "$id" || exit 1
done
"#,
        )
        .unwrap();
        write_config(
            dir.path(),
            r#"
[defaults]
signal_poll_secs = 1
pool_poll_secs = 1
shutdown_grace_secs = 2

[phases.commands.fix]
plan_command = "printf '[{\"description\": \"Fix src/a.rs\"}, {\"description\": \"Fix src/b.rs\"}]'"
worker_command = "sh worker.sh"
"#,
        );

        convoy(dir.path())
            .env("CONVOY_BIN", env!("CARGO_BIN_EXE_convoy"))
            .args(["run", "fix", "--phase-timeout", "60"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Pipeline 'fix' completed"))
            .stdout(predicate::str::contains("Executed: triage, fix, verify"));

        let paths = ConvoyPaths::new(dir.path());
        assert_eq!(fs::read_dir(paths.teams_dir()).unwrap().count(), 0);
        assert_eq!(fs::read_dir(paths.tasks_dir()).unwrap().count(), 0);
    }
}

// =============================================================================
// Cancellation
// =============================================================================

mod cancel {
    use super::*;

    #[test]
    fn test_cancel_batch_writes_flag() {
        let dir = TempDir::new().unwrap();
        convoy(dir.path())
            .args(["cancel", "--batch"])
            .assert()
            .success();
        assert!(dir.path().join(".convoy/batch.cancel").exists());
    }

    #[test]
    fn test_cancel_without_runs() {
        let dir = TempDir::new().unwrap();
        convoy(dir.path())
            .args(["cancel", "review"])
            .assert()
            .code(1)
            .stderr(predicate::str::contains("No unfinished checkpoint"));
    }

    #[test]
    fn test_cancel_halted_run_archives_it() {
        let dir = TempDir::new().unwrap();
        convoy(dir.path())
            .args(["run", "review", "--run-id", "c1"])
            .assert()
            .code(1);

        convoy(dir.path())
            .args(["cancel", "review"])
            .assert()
            .success()
            .stdout(predicate::str::contains("archived as cancelled"));

        assert!(!dir.path().join(".convoy/runs/review/c1").exists());
    }

    #[test]
    fn test_batch_stops_at_first_failure() {
        let dir = TempDir::new().unwrap();
        convoy(dir.path())
            .args(["batch", "review", "build"])
            .assert()
            .code(1)
            .stdout(predicate::str::contains("1 pipeline(s) not run"));
    }
}

// =============================================================================
// Configuration and Teams
// =============================================================================

mod config {
    use super::*;

    #[test]
    fn test_config_show_defaults() {
        let dir = TempDir::new().unwrap();
        convoy(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("threshold = 0.7"))
            .stdout(predicate::str::contains("phase_timeout_secs = 1800"))
            .stdout(predicate::str::contains("fail-closed"));
    }

    #[test]
    fn test_config_show_project_override() {
        let dir = TempDir::new().unwrap();
        write_config(dir.path(), "[defaults]\nphase_timeout_secs = 90\n");
        convoy(dir.path())
            .args(["config", "show"])
            .env_remove("CONVOY_PHASE_TIMEOUT_SECS")
            .assert()
            .success()
            .stdout(predicate::str::contains("phase_timeout_secs = 90"));
    }

    #[test]
    fn test_config_validate_flags_bad_values() {
        let dir = TempDir::new().unwrap();
        write_config(dir.path(), "[convergence]\nthreshold = 1.5\n");
        convoy(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration warnings"));
    }

    #[test]
    fn test_teams_scan_empty() {
        let dir = TempDir::new().unwrap();
        convoy(dir.path())
            .args(["teams", "scan"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No stale teams"));
    }
}

// =============================================================================
// Worker Commands
// =============================================================================

mod worker {
    use super::*;

    fn pool_with_tasks(dir: &Path, team: &str) -> TaskPool {
        let paths = ConvoyPaths::new(dir);
        let pool = TaskPool::new(&paths.pool_dir(team));
        pool.create_task(TaskSpec::new("Update src/lib.rs")).unwrap();
        pool.create_task(TaskSpec::new("Update README.md").blocked_by(&["1"]))
            .unwrap();
        pool
    }

    #[test]
    fn test_claim_complete_list() {
        let dir = TempDir::new().unwrap();
        let pool = pool_with_tasks(dir.path(), "team-a");

        convoy(dir.path())
            .args(["task", "claim", "--team", "team-a", "--owner", "w1"])
            .assert()
            .success()
            .stdout(predicate::str::contains("\"id\":\"1\""));

        // Task 2 is blocked until 1 completes.
        convoy(dir.path())
            .args(["task", "claim"])
            .env("CONVOY_TEAM", "team-a")
            .env("CONVOY_WORKER", "w2")
            .assert()
            .success()
            .stdout(predicate::str::is_empty());

        convoy(dir.path())
            .args(["task", "complete", "--team", "team-a", "--owner", "w1", "1"])
            .assert()
            .success();

        convoy(dir.path())
            .args(["task", "list", "--team", "team-a", "--status", "completed", "--json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Update src/lib.rs"))
            .stdout(predicate::str::contains("Update README.md").not());

        assert_eq!(pool.completed_ids().unwrap().len(), 1);
    }

    #[test]
    fn test_complete_by_other_owner_fails() {
        let dir = TempDir::new().unwrap();
        pool_with_tasks(dir.path(), "team-b");

        convoy(dir.path())
            .args(["task", "claim", "--team", "team-b", "--owner", "w1", "1"])
            .assert()
            .success();
        convoy(dir.path())
            .args(["task", "complete", "--team", "team-b", "--owner", "w2", "1"])
            .assert()
            .code(1);
    }

    #[test]
    fn test_invalid_team_name_rejected() {
        let dir = TempDir::new().unwrap();
        convoy(dir.path())
            .args(["task", "list", "--team", "../x"])
            .assert()
            .code(1);
    }

    #[test]
    fn test_missing_pool_rejected() {
        let dir = TempDir::new().unwrap();
        convoy(dir.path())
            .args(["task", "claim", "--team", "nobody", "--owner", "w1"])
            .assert()
            .code(1)
            .stderr(predicate::str::contains("has no task pool"));
    }

    #[test]
    fn test_signal_done_writes_sentinel() {
        let dir = TempDir::new().unwrap();
        let paths = ConvoyPaths::new(dir.path());
        let signal_dir = paths.signal_dir("team-s");
        SignalBus::new(&signal_dir).prepare(1).unwrap();

        convoy(dir.path())
            .args(["signal", "done", "7", "--team", "team-s"])
            .assert()
            .success();

        assert!(signal_dir.join("7.done").exists());
        assert!(signal_dir.join("ALL_DONE").exists());
    }

    #[test]
    fn test_signal_done_without_directory_succeeds() {
        let dir = TempDir::new().unwrap();
        convoy(dir.path())
            .args(["signal", "done", "3", "--team", "team-gone"])
            .assert()
            .success();
        assert!(!ConvoyPaths::new(dir.path()).signal_dir("team-gone").exists());
    }
}
