//! Configuration view and validation commands: `convoy config`.

use anyhow::Result;
use console::style;
use std::path::Path;

use convoy::config::{
    CONFIG_FILE, ConvoyPaths, ConvoyToml, ResolvedConfig, TuningFlags, user_config_dir,
};
use convoy::orchestrator::{BUILTIN_PIPELINES, EXIT_SUCCESS, PipelineSpec};

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<i32> {
    let paths = ConvoyPaths::new(project_dir);
    let project_file = paths.convoy_dir.join(CONFIG_FILE);
    let user_file = user_config_dir().map(|d| d.join(CONFIG_FILE));

    match command {
        None | Some(ConfigCommands::Show) => {
            let config = ResolvedConfig::resolve(&TuningFlags::default(), &paths.convoy_dir)?;
            let t = &config.tuning;

            println!();
            println!("Convoy Configuration");
            println!("====================");
            println!();
            println!("Project config: {}", describe(&project_file));
            if let Some(user_file) = &user_file {
                println!("User config:    {}", describe(user_file));
            }
            println!();

            println!("[defaults] (effective, including CONVOY_* overrides)");
            println!("  phase_timeout_secs = {}", t.phase_timeout.as_secs());
            println!("  total_timeout_secs = {}", t.total_timeout.as_secs());
            println!("  signal_poll_secs = {}", t.signal_poll.as_secs());
            println!("  pool_poll_secs = {}", t.pool_poll.as_secs());
            println!("  team_stale_mins = {}", t.team_stale_after.as_secs() / 60);
            println!("  task_stale_mins = {}", t.task_stale_after.as_secs() / 60);
            println!("  task_warn_mins = {}", t.task_warn_after.as_secs() / 60);
            println!("  shutdown_grace_secs = {}", t.shutdown_grace.as_secs());
            println!("  max_task_releases = {}", t.max_task_releases);
            println!(
                "  retry_backoff_secs = {:?}",
                t.retry_backoff.iter().map(|d| d.as_secs()).collect::<Vec<_>>()
            );
            println!();

            println!("[convergence]");
            println!("  threshold = {}", config.convergence_threshold);
            let w = &config.score_weights;
            println!(
                "  weights = {{ issue_reduction = {}, severity = {}, coverage = {}, fix_success = {} }}",
                w.issue_reduction, w.severity, w.coverage, w.fix_success
            );
            println!();

            println!("Phases:");
            for name in BUILTIN_PIPELINES {
                let Some(pipeline) = PipelineSpec::builtin(name) else {
                    continue;
                };
                println!("  {}", style(&pipeline.name).bold());
                for phase in &pipeline.phases {
                    let settings = config.phase_settings(&phase.name, phase.fail_closed);
                    let mut notes = Vec::new();
                    if settings.fail_closed {
                        notes.push("fail-closed".to_string());
                    }
                    if let Some(model) = &settings.commands.model {
                        notes.push(format!("model {}", model));
                    }
                    println!(
                        "    {:<12} {:<12} {:>6}s {}",
                        phase.name,
                        phase.kind.to_string(),
                        settings.timeout.as_secs(),
                        style(notes.join(", ")).dim()
                    );
                }
            }
            println!();

            for warning in &config.warnings {
                println!("{} {}", style("warning:").yellow(), warning);
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let mut warnings = Vec::new();
            for file in std::iter::once(&project_file).chain(user_file.as_ref()) {
                if file.exists() {
                    let toml = ConvoyToml::load(file)?;
                    warnings.extend(
                        toml.validate()
                            .into_iter()
                            .map(|w| format!("{}: {}", file.display(), w)),
                    );
                }
            }

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
    }

    Ok(EXIT_SUCCESS)
}

fn describe(path: &Path) -> String {
    if path.exists() {
        path.display().to_string()
    } else {
        format!("{} (not found)", path.display())
    }
}
