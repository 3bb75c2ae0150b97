//! The seam between the orchestrator and the work a phase actually does.
//!
//! The orchestrator only sequences, budgets and records phases. What a phase
//! produces is opaque to it and comes from a [`PhaseDriver`]. The default
//! [`CommandDriver`] runs shell commands configured per phase in
//! `convoy.toml`.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::checkpoint::Verdict;
use crate::config::PhaseSettings;
use crate::pool::TaskSpec;
use crate::team::Team;
use crate::tracker::{ChangeProfile, GitTracker};

/// Everything a driver needs to know about the phase it runs.
#[derive(Debug, Clone)]
pub struct PhaseContext {
    pub run_id: String,
    pub pipeline: String,
    pub phase: String,
    pub project_dir: PathBuf,
    pub convoy_dir: PathBuf,
    pub settings: PhaseSettings,
}

impl PhaseContext {
    /// `CONVOY_*` variables exported to every command of the phase.
    pub fn env(&self) -> Vec<(String, String)> {
        vec![
            ("CONVOY_RUN_ID".into(), self.run_id.clone()),
            ("CONVOY_PIPELINE".into(), self.pipeline.clone()),
            ("CONVOY_PHASE".into(), self.phase.clone()),
            (
                "CONVOY_PROJECT_DIR".into(),
                self.project_dir.display().to_string(),
            ),
            ("CONVOY_DIR".into(), self.convoy_dir.display().to_string()),
        ]
    }
}

/// Result of an orchestrator-only phase.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LocalOutcome {
    pub success: bool,
    /// One-line description, shown on failure.
    pub summary: String,
}

/// One convergence cycle's findings, as reported by the reviewing command.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleReport {
    #[serde(default)]
    pub issues_total: u32,
    #[serde(default)]
    pub critical: u32,
    /// Severity-weighted issue count; lower is better.
    #[serde(default)]
    pub severity_index: f64,
    /// Fraction of the change that was reviewed, 0.0..=1.0.
    #[serde(default = "default_coverage")]
    pub scope_coverage: f64,
    #[serde(default)]
    pub fixes_attempted: u32,
    #[serde(default)]
    pub fixes_succeeded: u32,
    #[serde(default)]
    pub verdict: Verdict,
}

fn default_coverage() -> f64 {
    1.0
}

/// Phase payload provider.
#[async_trait]
pub trait PhaseDriver: Send + Sync {
    /// Run an orchestrator-only phase to completion.
    async fn run_local(&self, ctx: &PhaseContext) -> Result<LocalOutcome>;

    /// Tasks for a delegated phase, in creation order.
    async fn plan_tasks(&self, ctx: &PhaseContext) -> Result<Vec<TaskSpec>>;

    /// Start the team's workers. Returns member names.
    async fn launch_workers(&self, ctx: &PhaseContext, team: &Team) -> Result<Vec<String>>;

    /// Ask the team's workers to stop after their current task.
    async fn request_shutdown(&self, team: &str) -> Result<()>;

    /// Wait up to `grace` for the team's workers to exit, then stop the rest.
    /// Returns how many had to be stopped forcibly.
    async fn drain_workers(&self, _team: &str, _grace: Duration) -> usize {
        0
    }

    /// Describe the change a convergence loop reviews.
    async fn assess_change(&self, ctx: &PhaseContext) -> Result<ChangeProfile>;

    /// Run convergence cycle `cycle` (1-based).
    async fn run_cycle(&self, ctx: &PhaseContext, cycle: u32) -> Result<CycleReport>;
}

/// Driver backed by per-phase shell commands.
pub struct CommandDriver {
    workers: Mutex<HashMap<String, Vec<Child>>>,
}

impl Default for CommandDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandDriver {
    pub fn new() -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
        }
    }

    fn shell(ctx: &PhaseContext, command: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(command)
            .current_dir(&ctx.project_dir)
            .envs(ctx.env())
            .stdin(Stdio::null());
        cmd
    }

    async fn capture(ctx: &PhaseContext, command: &str, extra_env: &[(&str, String)]) -> Result<std::process::Output> {
        let mut cmd = Self::shell(ctx, command);
        for (k, v) in extra_env {
            cmd.env(k, v);
        }
        cmd.stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        debug!(phase = %ctx.phase, command, "Running phase command");
        cmd.output()
            .await
            .with_context(|| format!("Failed to run '{}'", command))
    }
}

/// Last non-empty line of a command's output, for one-line summaries.
fn last_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or_default()
        .trim()
        .to_string()
}

#[async_trait]
impl PhaseDriver for CommandDriver {
    async fn run_local(&self, ctx: &PhaseContext) -> Result<LocalOutcome> {
        let Some(command) = ctx.settings.commands.command.as_deref() else {
            info!(phase = %ctx.phase, "No command configured; nothing to run");
            return Ok(LocalOutcome {
                success: true,
                summary: "no command configured".into(),
            });
        };
        let output = Self::capture(ctx, command, &[]).await?;
        let summary = if output.status.success() {
            last_line(&output.stdout)
        } else {
            let err = last_line(&output.stderr);
            if err.is_empty() {
                format!("'{}' exited with {}", command, output.status)
            } else {
                err
            }
        };
        Ok(LocalOutcome {
            success: output.status.success(),
            summary,
        })
    }

    async fn plan_tasks(&self, ctx: &PhaseContext) -> Result<Vec<TaskSpec>> {
        let Some(command) = ctx.settings.commands.plan_command.as_deref() else {
            return Ok(Vec::new());
        };
        let output = Self::capture(ctx, command, &[]).await?;
        if !output.status.success() {
            bail!(
                "Plan command '{}' failed: {}",
                command,
                last_line(&output.stderr)
            );
        }
        serde_json::from_slice(&output.stdout)
            .with_context(|| format!("Plan command '{}' did not print a JSON task list", command))
    }

    async fn launch_workers(&self, ctx: &PhaseContext, team: &Team) -> Result<Vec<String>> {
        let Some(command) = ctx.settings.commands.worker_command.as_deref() else {
            warn!(phase = %ctx.phase, "No worker command configured; tasks must be completed externally");
            return Ok(Vec::new());
        };
        let count = ctx.settings.commands.workers.unwrap_or(1).max(1);
        let mut members = Vec::with_capacity(count);
        for i in 1..=count {
            let member = format!("worker-{}", i);
            let mut cmd = Self::shell(ctx, command);
            cmd.env("CONVOY_TEAM", &team.name)
                .env("CONVOY_WORKER", &member)
                .env("CONVOY_POOL_DIR", &team.pool_dir)
                .env("CONVOY_SIGNAL_DIR", &team.signal_dir)
                .stdout(Stdio::null())
                .stderr(Stdio::inherit())
                .kill_on_drop(true);
            let child = cmd
                .spawn()
                .with_context(|| format!("Failed to spawn worker '{}'", command))?;
            debug!(team = %team.name, member = %member, pid = ?child.id(), "Spawned worker");
            // Tracked immediately so a later spawn failure still drains it.
            self.workers
                .lock()
                .await
                .entry(team.name.clone())
                .or_default()
                .push(child);
            members.push(member);
        }
        Ok(members)
    }

    async fn request_shutdown(&self, team: &str) -> Result<()> {
        let workers = self.workers.lock().await;
        for child in workers.get(team).into_iter().flatten() {
            if let Some(pid) = child.id() {
                // SAFETY: plain signal delivery to a child we spawned.
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
            }
        }
        Ok(())
    }

    async fn drain_workers(&self, team: &str, grace: Duration) -> usize {
        let Some(children) = self.workers.lock().await.remove(team) else {
            return 0;
        };
        let deadline = tokio::time::Instant::now() + grace;
        let mut forced = 0;
        for mut child in children {
            match tokio::time::timeout_at(deadline, child.wait()).await {
                Ok(_) => {}
                Err(_) => {
                    forced += 1;
                    if let Err(e) = child.kill().await {
                        warn!(team, error = %e, "Failed to stop worker");
                    }
                }
            }
        }
        if forced > 0 {
            warn!(team, forced, "Stopped workers that outlived the grace period");
        }
        forced
    }

    async fn assess_change(&self, ctx: &PhaseContext) -> Result<ChangeProfile> {
        match GitTracker::new(&ctx.project_dir) {
            Ok(tracker) => tracker.change_profile(),
            Err(e) => {
                warn!(error = %e, "No git repository; assuming an empty change");
                Ok(ChangeProfile::default())
            }
        }
    }

    async fn run_cycle(&self, ctx: &PhaseContext, cycle: u32) -> Result<CycleReport> {
        let Some(command) = ctx.settings.commands.cycle_command.as_deref() else {
            bail!("Phase '{}' has no cycle_command configured", ctx.phase);
        };
        let output = Self::capture(ctx, command, &[("CONVOY_CYCLE", cycle.to_string())]).await?;
        if !output.status.success() {
            bail!(
                "Cycle command '{}' failed: {}",
                command,
                last_line(&output.stderr)
            );
        }
        serde_json::from_slice(&output.stdout)
            .with_context(|| format!("Cycle command '{}' did not print a JSON report", command))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PhaseCommands, PhaseSettings};
    use tempfile::tempdir;

    fn ctx(dir: &std::path::Path, commands: PhaseCommands) -> PhaseContext {
        PhaseContext {
            run_id: "run-1".into(),
            pipeline: "build".into(),
            phase: "plan".into(),
            project_dir: dir.to_path_buf(),
            convoy_dir: dir.join(".convoy"),
            settings: PhaseSettings {
                timeout: Duration::from_secs(60),
                fail_closed: false,
                commands,
            },
        }
    }

    #[tokio::test]
    async fn test_run_local_reports_failure_line() {
        let dir = tempdir().unwrap();
        let driver = CommandDriver::new();
        let commands = PhaseCommands {
            command: Some("echo working; echo 'lint failed' >&2; exit 3".into()),
            ..Default::default()
        };
        let outcome = driver.run_local(&ctx(dir.path(), commands)).await.unwrap();
        assert!(!outcome.success);
        assert_eq!(outcome.summary, "lint failed");
    }

    #[tokio::test]
    async fn test_run_local_exports_phase_env() {
        let dir = tempdir().unwrap();
        let driver = CommandDriver::new();
        let commands = PhaseCommands {
            command: Some("echo \"$CONVOY_PIPELINE/$CONVOY_PHASE\"".into()),
            ..Default::default()
        };
        let outcome = driver.run_local(&ctx(dir.path(), commands)).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.summary, "build/plan");
    }

    #[tokio::test]
    async fn test_plan_tasks_parses_json() {
        let dir = tempdir().unwrap();
        let driver = CommandDriver::new();
        let commands = PhaseCommands {
            plan_command: Some(
                r#"echo '[{"description":"edit src/a.rs"},{"description":"b","file_targets":["x"]}]'"#
                    .into(),
            ),
            ..Default::default()
        };
        let tasks = driver.plan_tasks(&ctx(dir.path(), commands)).await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[1].file_targets, vec!["x"]);
    }

    #[tokio::test]
    async fn test_run_cycle_parses_report_with_defaults() {
        let dir = tempdir().unwrap();
        let driver = CommandDriver::new();
        let commands = PhaseCommands {
            cycle_command: Some(
                r#"echo "{\"issues_total\": $CONVOY_CYCLE, \"verdict\": \"warn\"}""#.into(),
            ),
            ..Default::default()
        };
        let report = driver.run_cycle(&ctx(dir.path(), commands), 2).await.unwrap();
        assert_eq!(report.issues_total, 2);
        assert_eq!(report.verdict, Verdict::Warn);
        assert_eq!(report.scope_coverage, 1.0);
    }

    #[tokio::test]
    async fn test_spawned_workers_are_tracked_until_drained() {
        use crate::config::ConvoyPaths;
        use crate::session::{SessionContext, SessionState, StaticProbe};
        use crate::team::TeamGuard;

        let dir = tempdir().unwrap();
        let paths = ConvoyPaths::new(dir.path());
        let me = SessionContext::with_probe(
            SessionState {
                config_root: paths.convoy_dir.clone(),
                owner_pid: 10,
                session_id: "s10".into(),
                process_name: Some("convoy".into()),
            },
            Box::new(StaticProbe::new()),
        );
        let team = TeamGuard::new(paths, &me, vec![Duration::ZERO])
            .create_team("build-implement-run-1")
            .await
            .unwrap();

        let driver = CommandDriver::new();
        let commands = PhaseCommands {
            worker_command: Some("sleep 30".into()),
            workers: Some(2),
            ..Default::default()
        };
        let members = driver.launch_workers(&ctx(dir.path(), commands), &team).await.unwrap();
        assert_eq!(members, vec!["worker-1", "worker-2"]);
        assert_eq!(driver.workers.lock().await.get(&team.name).map(Vec::len), Some(2));

        assert_eq!(driver.drain_workers(&team.name, Duration::ZERO).await, 2);
        assert!(driver.workers.lock().await.get(&team.name).is_none());
    }

    #[tokio::test]
    async fn test_missing_cycle_command_is_an_error() {
        let dir = tempdir().unwrap();
        let driver = CommandDriver::new();
        assert!(
            driver
                .run_cycle(&ctx(dir.path(), PhaseCommands::default()), 1)
                .await
                .is_err()
        );
    }
}
