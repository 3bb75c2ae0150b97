//! `convoy cancel`.

use anyhow::Result;
use console::style;
use std::path::Path;

use convoy::config::{ConvoyPaths, TuningFlags};
use convoy::orchestrator::{CancelFlag, CancelOutcome, EXIT_SUCCESS};

use super::run::build_orchestrator;

pub fn cmd_cancel(
    project_dir: &Path,
    pipeline: Option<&str>,
    run_id: Option<&str>,
    batch: bool,
) -> Result<i32> {
    if batch {
        let paths = ConvoyPaths::new(project_dir);
        let flag = CancelFlag::new(&paths.batch_cancel_file());
        flag.request()?;
        println!(
            "{} Batch will stop after its current run ({})",
            style("!").yellow().bold(),
            flag.path().display()
        );
        return Ok(EXIT_SUCCESS);
    }

    let Some(pipeline) = pipeline else {
        anyhow::bail!("A pipeline name is required unless --batch is given");
    };
    let orchestrator = build_orchestrator(project_dir, &TuningFlags::default())?;
    match orchestrator.request_cancel(pipeline, run_id)? {
        CancelOutcome::Requested { run_id } => {
            println!(
                "{} Cancellation requested for run {}; workers get {}s to drain",
                style("!").yellow().bold(),
                run_id,
                orchestrator.config().tuning.shutdown_grace.as_secs()
            );
        }
        CancelOutcome::Archived { run_id, path } => {
            println!(
                "{} Run {} was not running; archived as cancelled at {}",
                style("✓").green().bold(),
                run_id,
                path.display()
            );
        }
    }
    Ok(EXIT_SUCCESS)
}
