//! Layered configuration for convoy.
//!
//! Every tunable goes through one resolution chain with a fixed precedence:
//!
//! 1. explicit CLI flag
//! 2. `CONVOY_*` environment variable
//! 3. project config (`.convoy/convoy.toml`)
//! 4. user-global config (`<config_dir>/convoy/convoy.toml`)
//! 5. hardcoded default
//!
//! # Configuration File Format
//!
//! ```toml
//! [defaults]
//! phase_timeout_secs = 1800
//! total_timeout_secs = 14400
//! signal_poll_secs = 5
//! pool_poll_secs = 30
//! team_stale_mins = 30
//! task_stale_mins = 10
//! task_warn_mins = 5
//! shutdown_grace_secs = 30
//! max_task_releases = 3
//! retry_backoff_secs = [0, 3, 8]
//!
//! [timeouts.model_overrides]
//! "*opus*" = 600
//!
//! [phases.overrides."review*"]
//! timeout_secs = 3600
//! fail_closed = true
//!
//! [phases.commands.implement]
//! plan_command = "scripts/plan-tasks.sh"
//! worker_command = "scripts/worker.sh"
//! workers = 3
//! model = "opus"
//!
//! [convergence]
//! threshold = 0.7
//! weights = { issue_reduction = 0.40, severity = 0.25, coverage = 0.20, fix_success = 0.15 }
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the per-project state directory (the session config root).
pub const CONVOY_DIR: &str = ".convoy";

/// Name of the config file inside a config directory.
pub const CONFIG_FILE: &str = "convoy.toml";

const DEFAULT_PHASE_TIMEOUT_SECS: u64 = 1800;
const DEFAULT_TOTAL_TIMEOUT_SECS: u64 = 4 * 3600;
const DEFAULT_SIGNAL_POLL_SECS: u64 = 5;
const DEFAULT_POOL_POLL_SECS: u64 = 30;
const DEFAULT_TEAM_STALE_MINS: u64 = 30;
const DEFAULT_TASK_STALE_MINS: u64 = 10;
const DEFAULT_TASK_WARN_MINS: u64 = 5;
const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 30;
const DEFAULT_MAX_TASK_RELEASES: u32 = 3;
const DEFAULT_RETRY_BACKOFF_SECS: [u64; 3] = [0, 3, 8];
const DEFAULT_CONVERGENCE_THRESHOLD: f64 = 0.7;

/// One config file's `[defaults]` table. Every field is optional so a layer
/// only contributes what it sets.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DefaultsLayer {
    #[serde(default)]
    pub phase_timeout_secs: Option<u64>,
    #[serde(default)]
    pub total_timeout_secs: Option<u64>,
    #[serde(default)]
    pub signal_poll_secs: Option<u64>,
    #[serde(default)]
    pub pool_poll_secs: Option<u64>,
    #[serde(default)]
    pub team_stale_mins: Option<u64>,
    #[serde(default)]
    pub task_stale_mins: Option<u64>,
    #[serde(default)]
    pub task_warn_mins: Option<u64>,
    #[serde(default)]
    pub shutdown_grace_secs: Option<u64>,
    #[serde(default)]
    pub max_task_releases: Option<u32>,
    #[serde(default)]
    pub retry_backoff_secs: Option<Vec<u64>>,
}

/// Extra time granted to phases running on a matching model.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TimeoutsSection {
    /// Model glob -> additional seconds on top of the base allowance.
    #[serde(default)]
    pub model_overrides: HashMap<String, u64>,
}

/// Phase-name-pattern override.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseOverride {
    /// Replaces the base allowance for matching phases.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Halt instead of proceeding with partial results when the budget runs out.
    #[serde(default)]
    pub fail_closed: Option<bool>,
}

/// Commands that carry a phase's opaque work.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PhaseCommands {
    /// Orchestrator-only phases: run to completion; exit 0 passes.
    #[serde(default)]
    pub command: Option<String>,
    /// Delegated phases: prints a JSON array of task specs on stdout.
    #[serde(default)]
    pub plan_command: Option<String>,
    /// Delegated phases: spawned once per team member.
    #[serde(default)]
    pub worker_command: Option<String>,
    /// Number of workers for delegated phases.
    #[serde(default)]
    pub workers: Option<usize>,
    /// Convergence phases: prints a JSON cycle report on stdout.
    #[serde(default)]
    pub cycle_command: Option<String>,
    /// Model name used for budget overrides.
    #[serde(default)]
    pub model: Option<String>,
    /// Files whose content hashes are recorded on completion.
    #[serde(default)]
    pub artifacts: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhasesSection {
    /// Pattern-based overrides (e.g., "review*" -> PhaseOverride)
    #[serde(default)]
    pub overrides: HashMap<String, PhaseOverride>,
    /// Per-phase commands keyed by exact phase name.
    #[serde(default)]
    pub commands: HashMap<String, PhaseCommands>,
}

/// Weights of the convergence score. They need not sum to 1; the score is
/// normalised by their total.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreWeights {
    #[serde(default = "default_weight_issue_reduction")]
    pub issue_reduction: f64,
    #[serde(default = "default_weight_severity")]
    pub severity: f64,
    #[serde(default = "default_weight_coverage")]
    pub coverage: f64,
    #[serde(default = "default_weight_fix_success")]
    pub fix_success: f64,
}

fn default_weight_issue_reduction() -> f64 {
    0.40
}

fn default_weight_severity() -> f64 {
    0.25
}

fn default_weight_coverage() -> f64 {
    0.20
}

fn default_weight_fix_success() -> f64 {
    0.15
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            issue_reduction: default_weight_issue_reduction(),
            severity: default_weight_severity(),
            coverage: default_weight_coverage(),
            fix_success: default_weight_fix_success(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConvergenceSection {
    #[serde(default)]
    pub threshold: Option<f64>,
    #[serde(default)]
    pub weights: Option<ScoreWeights>,
}

/// The complete convoy.toml structure of a single layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConvoyToml {
    #[serde(default)]
    pub defaults: DefaultsLayer,
    #[serde(default)]
    pub timeouts: TimeoutsSection,
    #[serde(default)]
    pub phases: PhasesSection,
    #[serde(default)]
    pub convergence: ConvergenceSection,
}

impl ConvoyToml {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Invalid config file: {}", path.display()))
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse convoy.toml")
    }

    /// Load `convoy.toml` from a directory, or an empty layer if absent.
    pub fn load_or_default(dir: &Path) -> Result<Self> {
        let path = dir.join(CONFIG_FILE);
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if let Some(t) = self.convergence.threshold
            && !(0.0..=1.0).contains(&t)
        {
            warnings.push(format!(
                "convergence.threshold {} is outside 0.0..=1.0",
                t
            ));
        }
        if let Some(ref backoff) = self.defaults.retry_backoff_secs
            && backoff.is_empty()
        {
            warnings.push("defaults.retry_backoff_secs is empty; one attempt will be made".into());
        }
        if let (Some(warn), Some(stale)) =
            (self.defaults.task_warn_mins, self.defaults.task_stale_mins)
            && warn >= stale
        {
            warnings.push(format!(
                "task_warn_mins ({}) should be lower than task_stale_mins ({})",
                warn, stale
            ));
        }
        for (name, cmds) in &self.phases.commands {
            if cmds.workers == Some(0) {
                warnings.push(format!("phase '{}' configures zero workers", name));
            }
        }
        warnings
    }
}

/// Explicit CLI flag values. `None` means "not given on the command line".
#[derive(Debug, Clone, Default)]
pub struct TuningFlags {
    pub phase_timeout_secs: Option<u64>,
    pub total_timeout_secs: Option<u64>,
    pub signal_poll_secs: Option<u64>,
    pub pool_poll_secs: Option<u64>,
    pub team_stale_mins: Option<u64>,
    pub task_stale_mins: Option<u64>,
}

/// Fully resolved tunables.
#[derive(Debug, Clone, PartialEq)]
pub struct Tuning {
    pub phase_timeout: Duration,
    pub total_timeout: Duration,
    pub signal_poll: Duration,
    pub pool_poll: Duration,
    pub team_stale_after: Duration,
    pub task_stale_after: Duration,
    pub task_warn_after: Duration,
    pub shutdown_grace: Duration,
    pub max_task_releases: u32,
    pub retry_backoff: Vec<Duration>,
}

impl Default for Tuning {
    fn default() -> Self {
        Self {
            phase_timeout: Duration::from_secs(DEFAULT_PHASE_TIMEOUT_SECS),
            total_timeout: Duration::from_secs(DEFAULT_TOTAL_TIMEOUT_SECS),
            signal_poll: Duration::from_secs(DEFAULT_SIGNAL_POLL_SECS),
            pool_poll: Duration::from_secs(DEFAULT_POOL_POLL_SECS),
            team_stale_after: Duration::from_secs(DEFAULT_TEAM_STALE_MINS * 60),
            task_stale_after: Duration::from_secs(DEFAULT_TASK_STALE_MINS * 60),
            task_warn_after: Duration::from_secs(DEFAULT_TASK_WARN_MINS * 60),
            shutdown_grace: Duration::from_secs(DEFAULT_SHUTDOWN_GRACE_SECS),
            max_task_releases: DEFAULT_MAX_TASK_RELEASES,
            retry_backoff: DEFAULT_RETRY_BACKOFF_SECS
                .iter()
                .map(|s| Duration::from_secs(*s))
                .collect(),
        }
    }
}

/// Resolved settings for one phase.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseSettings {
    /// Base allowance (after pattern overrides) plus model extra.
    pub timeout: Duration,
    /// Pipeline default or a pattern override.
    pub fail_closed: bool,
    pub commands: PhaseCommands,
}

/// The configuration every component reads from, produced by [`ResolvedConfig::resolve`].
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub tuning: Tuning,
    pub model_overrides: HashMap<String, u64>,
    pub phase_overrides: HashMap<String, PhaseOverride>,
    pub phase_commands: HashMap<String, PhaseCommands>,
    pub convergence_threshold: f64,
    pub score_weights: ScoreWeights,
    /// Warnings collected from every layer.
    pub warnings: Vec<String>,
}

impl Default for ResolvedConfig {
    fn default() -> Self {
        Self::from_layers(&TuningFlags::default(), |_| None, &ConvoyToml::default(), &ConvoyToml::default())
    }
}

/// Location of the user-global config directory.
pub fn user_config_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("convoy"))
}

impl ResolvedConfig {
    /// Resolve the full chain for a project using the process environment.
    pub fn resolve(flags: &TuningFlags, convoy_dir: &Path) -> Result<Self> {
        let project = ConvoyToml::load_or_default(convoy_dir)?;
        let user = match user_config_dir() {
            Some(dir) => ConvoyToml::load_or_default(&dir)?,
            None => ConvoyToml::default(),
        };
        Ok(Self::from_layers(
            flags,
            |key| std::env::var(key).ok(),
            &project,
            &user,
        ))
    }

    /// Resolve from explicit layers. `env` looks up `CONVOY_*` variables.
    pub fn from_layers<F>(flags: &TuningFlags, env: F, project: &ConvoyToml, user: &ConvoyToml) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let env_u64 = |key: &str| env(key).and_then(|v| v.trim().parse::<u64>().ok());
        let pick = |flag: Option<u64>, key: &str, p: Option<u64>, u: Option<u64>, d: u64| {
            flag.or_else(|| env_u64(key)).or(p).or(u).unwrap_or(d)
        };
        let (pd, ud) = (&project.defaults, &user.defaults);

        let tuning = Tuning {
            phase_timeout: Duration::from_secs(pick(
                flags.phase_timeout_secs,
                "CONVOY_PHASE_TIMEOUT_SECS",
                pd.phase_timeout_secs,
                ud.phase_timeout_secs,
                DEFAULT_PHASE_TIMEOUT_SECS,
            )),
            total_timeout: Duration::from_secs(pick(
                flags.total_timeout_secs,
                "CONVOY_TOTAL_TIMEOUT_SECS",
                pd.total_timeout_secs,
                ud.total_timeout_secs,
                DEFAULT_TOTAL_TIMEOUT_SECS,
            )),
            signal_poll: Duration::from_secs(pick(
                flags.signal_poll_secs,
                "CONVOY_SIGNAL_POLL_SECS",
                pd.signal_poll_secs,
                ud.signal_poll_secs,
                DEFAULT_SIGNAL_POLL_SECS,
            )),
            pool_poll: Duration::from_secs(pick(
                flags.pool_poll_secs,
                "CONVOY_POOL_POLL_SECS",
                pd.pool_poll_secs,
                ud.pool_poll_secs,
                DEFAULT_POOL_POLL_SECS,
            )),
            team_stale_after: Duration::from_secs(
                60 * pick(
                    flags.team_stale_mins,
                    "CONVOY_TEAM_STALE_MINS",
                    pd.team_stale_mins,
                    ud.team_stale_mins,
                    DEFAULT_TEAM_STALE_MINS,
                ),
            ),
            task_stale_after: Duration::from_secs(
                60 * pick(
                    flags.task_stale_mins,
                    "CONVOY_TASK_STALE_MINS",
                    pd.task_stale_mins,
                    ud.task_stale_mins,
                    DEFAULT_TASK_STALE_MINS,
                ),
            ),
            task_warn_after: Duration::from_secs(
                60 * pick(
                    None,
                    "CONVOY_TASK_WARN_MINS",
                    pd.task_warn_mins,
                    ud.task_warn_mins,
                    DEFAULT_TASK_WARN_MINS,
                ),
            ),
            shutdown_grace: Duration::from_secs(pick(
                None,
                "CONVOY_SHUTDOWN_GRACE_SECS",
                pd.shutdown_grace_secs,
                ud.shutdown_grace_secs,
                DEFAULT_SHUTDOWN_GRACE_SECS,
            )),
            max_task_releases: pd
                .max_task_releases
                .or(ud.max_task_releases)
                .unwrap_or(DEFAULT_MAX_TASK_RELEASES),
            retry_backoff: pd
                .retry_backoff_secs
                .clone()
                .or_else(|| ud.retry_backoff_secs.clone())
                .unwrap_or_else(|| DEFAULT_RETRY_BACKOFF_SECS.to_vec())
                .into_iter()
                .map(Duration::from_secs)
                .collect(),
        };

        // Map-shaped sections merge by key; the project layer wins.
        let mut model_overrides = user.timeouts.model_overrides.clone();
        model_overrides.extend(project.timeouts.model_overrides.clone());
        let mut phase_overrides = user.phases.overrides.clone();
        phase_overrides.extend(project.phases.overrides.clone());
        let mut phase_commands = user.phases.commands.clone();
        phase_commands.extend(project.phases.commands.clone());

        let mut warnings = user.validate();
        warnings.extend(project.validate());

        Self {
            tuning,
            model_overrides,
            phase_overrides,
            phase_commands,
            convergence_threshold: project
                .convergence
                .threshold
                .or(user.convergence.threshold)
                .unwrap_or(DEFAULT_CONVERGENCE_THRESHOLD),
            score_weights: project
                .convergence
                .weights
                .or(user.convergence.weights)
                .unwrap_or_default(),
            warnings,
        }
    }

    /// Effective settings for a phase. `default_fail_closed` comes from the
    /// pipeline definition; pattern overrides may change it.
    pub fn phase_settings(&self, phase_name: &str, default_fail_closed: bool) -> PhaseSettings {
        let commands = self
            .phase_commands
            .get(phase_name)
            .cloned()
            .unwrap_or_default();

        let mut base = self.tuning.phase_timeout;
        let mut fail_closed = default_fail_closed;

        // Sorted so that overlapping patterns apply in a stable order.
        let mut patterns: Vec<_> = self.phase_overrides.iter().collect();
        patterns.sort_by(|a, b| a.0.cmp(b.0));
        for (pattern, o) in patterns {
            if pattern_matches(pattern, phase_name) {
                if let Some(secs) = o.timeout_secs {
                    base = Duration::from_secs(secs);
                }
                if let Some(fc) = o.fail_closed {
                    fail_closed = fc;
                }
            }
        }

        let extra = commands
            .model
            .as_deref()
            .map(|model| self.model_extra(model))
            .unwrap_or_default();

        PhaseSettings {
            timeout: base + extra,
            fail_closed,
            commands,
        }
    }

    /// Largest extra allowance among model patterns matching `model`.
    fn model_extra(&self, model: &str) -> Duration {
        self.model_overrides
            .iter()
            .filter(|(pattern, _)| pattern_matches(pattern, model))
            .map(|(_, secs)| Duration::from_secs(*secs))
            .max()
            .unwrap_or_default()
    }
}

/// Check if a pattern matches a phase or model name.
/// Supports simple glob patterns, case-insensitively:
/// - `*` matches any sequence of characters
/// - `?` matches any single character
pub fn pattern_matches(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    let name: Vec<char> = name.to_lowercase().chars().collect();
    glob_match(&pattern, &name)
}

fn glob_match(pattern: &[char], text: &[char]) -> bool {
    match pattern.split_first() {
        None => text.is_empty(),
        Some(('*', rest)) => (0..=text.len()).any(|i| glob_match(rest, &text[i..])),
        Some(('?', rest)) => !text.is_empty() && glob_match(rest, &text[1..]),
        Some((c, rest)) => text.first() == Some(c) && glob_match(rest, &text[1..]),
    }
}

/// Filesystem layout under a project's `.convoy/` directory.
#[derive(Debug, Clone)]
pub struct ConvoyPaths {
    pub project_dir: PathBuf,
    pub convoy_dir: PathBuf,
}

impl ConvoyPaths {
    pub fn new(project_dir: &Path) -> Self {
        Self {
            project_dir: project_dir.to_path_buf(),
            convoy_dir: project_dir.join(CONVOY_DIR),
        }
    }

    /// Create the directory skeleton. Idempotent.
    pub fn ensure_directories(&self) -> Result<()> {
        for dir in [
            self.runs_dir(),
            self.archive_dir(),
            self.teams_dir(),
            self.tasks_dir(),
            self.signals_dir(),
            self.log_dir(),
        ] {
            std::fs::create_dir_all(&dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.convoy_dir.join("runs")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.convoy_dir.join("archive")
    }

    pub fn teams_dir(&self) -> PathBuf {
        self.convoy_dir.join("teams")
    }

    pub fn tasks_dir(&self) -> PathBuf {
        self.convoy_dir.join("tasks")
    }

    pub fn signals_dir(&self) -> PathBuf {
        self.convoy_dir.join("signals")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.convoy_dir.join("logs")
    }

    pub fn batch_cancel_file(&self) -> PathBuf {
        self.convoy_dir.join("batch.cancel")
    }

    pub fn pipeline_runs_dir(&self, pipeline: &str) -> PathBuf {
        self.runs_dir().join(pipeline)
    }

    pub fn run_dir(&self, pipeline: &str, run_id: &str) -> PathBuf {
        self.pipeline_runs_dir(pipeline).join(run_id)
    }

    pub fn checkpoint_file(&self, pipeline: &str, run_id: &str) -> PathBuf {
        self.run_dir(pipeline, run_id).join("checkpoint.json")
    }

    pub fn cancel_file(&self, pipeline: &str, run_id: &str) -> PathBuf {
        self.run_dir(pipeline, run_id).join("cancel")
    }

    pub fn archived_run_dir(&self, pipeline: &str, run_id: &str) -> PathBuf {
        self.archive_dir().join(pipeline).join(run_id)
    }

    pub fn team_dir(&self, team: &str) -> PathBuf {
        self.teams_dir().join(team)
    }

    pub fn pool_dir(&self, team: &str) -> PathBuf {
        self.tasks_dir().join(team)
    }

    pub fn signal_dir(&self, team: &str) -> PathBuf {
        self.signals_dir().join(team)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    // =========================================
    // Pattern matching tests
    // =========================================

    #[test]
    fn test_pattern_matches_exact() {
        assert!(pattern_matches("review", "review"));
        assert!(!pattern_matches("review", "reviews"));
    }

    #[test]
    fn test_pattern_matches_star() {
        assert!(pattern_matches("review-*", "review-security"));
        assert!(pattern_matches("*opus*", "claude-opus-4"));
        assert!(pattern_matches("*", ""));
        assert!(!pattern_matches("*-gate", "gate"));
    }

    #[test]
    fn test_pattern_matches_question_mark_and_case() {
        assert!(pattern_matches("phase-0?", "PHASE-07"));
        assert!(!pattern_matches("phase-0?", "phase-10"));
    }

    // =========================================
    // Parsing tests
    // =========================================

    #[test]
    fn test_parse_empty_uses_defaults() {
        let toml = ConvoyToml::parse("").unwrap();
        let resolved =
            ResolvedConfig::from_layers(&TuningFlags::default(), no_env, &toml, &ConvoyToml::default());
        assert_eq!(resolved.tuning, Tuning::default());
        assert_eq!(resolved.convergence_threshold, 0.7);
        assert_eq!(resolved.score_weights, ScoreWeights::default());
    }

    #[test]
    fn test_parse_phase_commands() {
        let content = r#"
[phases.commands.implement]
plan_command = "plan.sh"
worker_command = "work.sh"
workers = 3
model = "opus"
artifacts = ["out/result.txt"]
"#;
        let toml = ConvoyToml::parse(content).unwrap();
        let cmds = toml.phases.commands.get("implement").unwrap();
        assert_eq!(cmds.plan_command.as_deref(), Some("plan.sh"));
        assert_eq!(cmds.workers, Some(3));
        assert_eq!(cmds.artifacts, vec!["out/result.txt".to_string()]);
    }

    #[test]
    fn test_parse_rejects_unknown_types() {
        let result = ConvoyToml::parse("[defaults]\nphase_timeout_secs = \"soon\"\n");
        assert!(result.is_err());
    }

    // =========================================
    // Precedence tests
    // =========================================

    #[test]
    fn test_precedence_flag_env_project_user_default() {
        let user = ConvoyToml::parse("[defaults]\nphase_timeout_secs = 10\npool_poll_secs = 11\nsignal_poll_secs = 12\ntotal_timeout_secs = 13\n").unwrap();
        let project = ConvoyToml::parse("[defaults]\nphase_timeout_secs = 20\npool_poll_secs = 21\nsignal_poll_secs = 22\n").unwrap();
        let env = |key: &str| match key {
            "CONVOY_PHASE_TIMEOUT_SECS" => Some("30".to_string()),
            "CONVOY_POOL_POLL_SECS" => Some("31".to_string()),
            _ => None,
        };
        let flags = TuningFlags {
            phase_timeout_secs: Some(40),
            ..Default::default()
        };

        let resolved = ResolvedConfig::from_layers(&flags, env, &project, &user);
        assert_eq!(resolved.tuning.phase_timeout, Duration::from_secs(40)); // flag
        assert_eq!(resolved.tuning.pool_poll, Duration::from_secs(31)); // env
        assert_eq!(resolved.tuning.signal_poll, Duration::from_secs(22)); // project
        assert_eq!(resolved.tuning.total_timeout, Duration::from_secs(13)); // user
        assert_eq!(resolved.tuning.team_stale_after, Duration::from_secs(30 * 60)); // default
    }

    #[test]
    fn test_invalid_env_value_is_ignored() {
        let env = |key: &str| (key == "CONVOY_SIGNAL_POLL_SECS").then(|| "fast".to_string());
        let resolved = ResolvedConfig::from_layers(
            &TuningFlags::default(),
            env,
            &ConvoyToml::default(),
            &ConvoyToml::default(),
        );
        assert_eq!(resolved.tuning.signal_poll, Duration::from_secs(5));
    }

    #[test]
    fn test_project_phase_commands_replace_user_entry() {
        let user = ConvoyToml::parse("[phases.commands.plan]\ncommand = \"user.sh\"\n").unwrap();
        let project =
            ConvoyToml::parse("[phases.commands.plan]\ncommand = \"project.sh\"\n").unwrap();
        let resolved = ResolvedConfig::from_layers(&TuningFlags::default(), no_env, &project, &user);
        assert_eq!(
            resolved.phase_commands["plan"].command.as_deref(),
            Some("project.sh")
        );
    }

    // =========================================
    // Phase settings tests
    // =========================================

    #[test]
    fn test_phase_settings_with_pattern_and_model_override() {
        let content = r#"
[defaults]
phase_timeout_secs = 100

[timeouts.model_overrides]
"*opus*" = 50
"*" = 5

[phases.overrides."review*"]
timeout_secs = 300
fail_closed = true

[phases.commands.review]
model = "big-opus-model"
"#;
        let project = ConvoyToml::parse(content).unwrap();
        let resolved =
            ResolvedConfig::from_layers(&TuningFlags::default(), no_env, &project, &ConvoyToml::default());

        let review = resolved.phase_settings("review", false);
        assert_eq!(review.timeout, Duration::from_secs(350));
        assert!(review.fail_closed);

        let plan = resolved.phase_settings("plan", false);
        assert_eq!(plan.timeout, Duration::from_secs(100));
        assert!(!plan.fail_closed);
    }

    #[test]
    fn test_validate_warns_on_bad_threshold_and_thresholds() {
        let toml = ConvoyToml::parse(
            "[defaults]\ntask_warn_mins = 12\ntask_stale_mins = 10\n[convergence]\nthreshold = 1.5\n",
        )
        .unwrap();
        let warnings = toml.validate();
        assert_eq!(warnings.len(), 2);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let toml = ConvoyToml::load_or_default(dir.path()).unwrap();
        assert!(toml.phases.commands.is_empty());
    }

    #[test]
    fn test_paths_layout() {
        let dir = tempdir().unwrap();
        let paths = ConvoyPaths::new(dir.path());
        paths.ensure_directories().unwrap();
        assert!(paths.teams_dir().exists());
        assert_eq!(
            paths.checkpoint_file("build", "r1"),
            dir.path().join(".convoy/runs/build/r1/checkpoint.json")
        );
        assert_eq!(paths.signal_dir("t"), dir.path().join(".convoy/signals/t"));
    }
}
