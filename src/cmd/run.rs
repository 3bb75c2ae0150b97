//! Pipeline execution commands: `convoy run` and `convoy batch`.

use anyhow::Result;
use console::style;
use std::path::Path;
use std::sync::Arc;
use tracing::warn;

use convoy::config::{ConvoyPaths, ResolvedConfig, TuningFlags};
use convoy::driver::CommandDriver;
use convoy::errors::OrchestratorError;
use convoy::orchestrator::{
    EXIT_CANCELLED, EXIT_SUCCESS, Orchestrator, PipelineSpec, RunOutcome, RunRequest, RunResult,
};
use convoy::session::SessionContext;

use super::super::TuningArgs;

/// Build an orchestrator for `project_dir` with the command-backed driver.
pub fn build_orchestrator(project_dir: &Path, flags: &TuningFlags) -> Result<Orchestrator> {
    let paths = ConvoyPaths::new(project_dir);
    paths.ensure_directories()?;
    let config = ResolvedConfig::resolve(flags, &paths.convoy_dir)?;
    for warning in &config.warnings {
        warn!("{}", warning);
    }
    let session = SessionContext::current(&paths.convoy_dir);
    Ok(Orchestrator::new(
        paths,
        config,
        session,
        Arc::new(CommandDriver::new()),
    ))
}

pub fn lookup_pipeline(name: &str) -> Result<PipelineSpec, OrchestratorError> {
    PipelineSpec::builtin(name).ok_or_else(|| OrchestratorError::UnknownPipeline(name.to_string()))
}

pub fn print_result(result: &RunResult) {
    println!();
    match &result.outcome {
        RunOutcome::Completed => {
            println!(
                "{} Pipeline '{}' completed (run {})",
                style("✓").green().bold(),
                result.pipeline,
                result.run_id
            );
        }
        RunOutcome::Halted {
            phase,
            reason,
            artifacts,
        } => {
            println!(
                "{} Pipeline '{}' halted in phase '{}': {}",
                style("✗").red().bold(),
                result.pipeline,
                phase,
                reason
            );
            for artifact in artifacts {
                println!("    {}", style(artifact.display()).dim());
            }
            println!(
                "  Resume with: convoy run {} --resume --run-id {}",
                result.pipeline, result.run_id
            );
        }
        RunOutcome::Cancelled { phase } => {
            let at = phase
                .as_deref()
                .map(|p| format!(" during phase '{}'", p))
                .unwrap_or_default();
            println!(
                "{} Pipeline '{}' cancelled{}",
                style("!").yellow().bold(),
                result.pipeline,
                at
            );
        }
    }

    if !result.phases_executed.is_empty() {
        println!("  Executed: {}", result.phases_executed.join(", "));
    }
    if !result.phases_skipped.is_empty() {
        println!(
            "  Skipped:  {}",
            style(result.phases_skipped.join(", ")).dim()
        );
    }
    for flag in &result.flagged {
        println!(
            "  {} {}: {}",
            style("flagged").yellow(),
            flag.phase,
            flag.reason
        );
    }
    println!("  Checkpoint: {}", result.checkpoint_path.display());
    println!();
}

pub async fn cmd_run(
    project_dir: &Path,
    pipeline: &str,
    resume: bool,
    run_id: Option<String>,
    tuning: &TuningArgs,
) -> Result<i32> {
    let spec = lookup_pipeline(pipeline)?;
    let orchestrator = build_orchestrator(project_dir, &tuning.to_flags())?;
    let request = if resume {
        RunRequest::resume(spec, run_id)
    } else {
        RunRequest {
            pipeline: spec,
            resume: false,
            run_id,
        }
    };
    let result = orchestrator.run(request).await?;
    print_result(&result);
    Ok(result.exit_code())
}

pub async fn cmd_batch(project_dir: &Path, pipelines: &[String], tuning: &TuningArgs) -> Result<i32> {
    let specs = pipelines
        .iter()
        .map(|name| lookup_pipeline(name))
        .collect::<Result<Vec<_>, _>>()?;
    let orchestrator = build_orchestrator(project_dir, &tuning.to_flags())?;
    let results = orchestrator.run_batch(&specs).await?;

    for result in &results {
        print_result(result);
    }
    let not_run = specs.len() - results.len();
    if not_run > 0 {
        println!(
            "{} {} pipeline(s) not run",
            style("!").yellow().bold(),
            not_run
        );
    }
    let failed = results
        .iter()
        .map(RunResult::exit_code)
        .find(|code| *code != EXIT_SUCCESS);
    Ok(match failed {
        Some(code) => code,
        // Every run succeeded but some never started: the batch was cancelled.
        None if not_run > 0 => EXIT_CANCELLED,
        None => EXIT_SUCCESS,
    })
}
