//! `convoy status`: checkpoints and their phase statuses.

use anyhow::Result;
use console::style;
use std::path::Path;

use convoy::checkpoint::{Checkpoint, CheckpointStore, LoadOutcome, PhaseStatus};
use convoy::config::ConvoyPaths;
use convoy::orchestrator::EXIT_SUCCESS;
use convoy::session::SessionContext;

fn styled_status(status: PhaseStatus) -> console::StyledObject<String> {
    let text = status.to_string();
    match status {
        PhaseStatus::Completed => style(text).green(),
        PhaseStatus::Running => style(text).cyan(),
        PhaseStatus::Failed => style(text).red(),
        PhaseStatus::Pending | PhaseStatus::Skipped => style(text).dim(),
    }
}

fn print_checkpoint(checkpoint: &Checkpoint, session: &SessionContext) {
    let owner = if session.is_self(&checkpoint.session) {
        "this session".to_string()
    } else if session.is_owned_by_live_session(&checkpoint.session) {
        format!("live (pid {})", checkpoint.session.owner_pid)
    } else {
        format!("dead (pid {})", checkpoint.session.owner_pid)
    };
    println!(
        "  {}  updated {}  owner {}",
        style(&checkpoint.run_id).bold(),
        checkpoint.updated_at.format("%Y-%m-%d %H:%M:%S UTC"),
        owner
    );
    for phase in &checkpoint.phases {
        let note = phase
            .partial_reason
            .as_deref()
            .or(phase.failure.as_deref())
            .map(|n| format!("  ({})", n))
            .unwrap_or_default();
        println!("    {:<12} {}{}", phase.name, styled_status(phase.status), note);
    }
    if let Some(conv) = &checkpoint.convergence {
        let last = conv
            .cycle_history
            .last()
            .map(|c| format!(", last score {:.2}", c.score))
            .unwrap_or_default();
        println!(
            "    convergence: {} tier, {} of {} cycles{}",
            conv.tier,
            conv.cycle_history.len(),
            conv.max_cycles,
            last
        );
    }
    if let Some(halt) = &checkpoint.halt {
        println!(
            "    {} in '{}': {}",
            style("halted").red(),
            halt.phase,
            halt.reason
        );
    }
}

pub fn cmd_status(project_dir: &Path, pipeline: Option<&str>) -> Result<i32> {
    let paths = ConvoyPaths::new(project_dir);
    let session = SessionContext::current(&paths.convoy_dir);
    let store = CheckpointStore::new(paths);

    let pipelines = match pipeline {
        Some(p) => vec![p.to_string()],
        None => store.pipelines(),
    };

    println!();
    if pipelines.is_empty() {
        println!("No runs in progress.");
        println!();
        return Ok(EXIT_SUCCESS);
    }

    for name in pipelines {
        let listings = store.list(&name);
        println!("{} ({} run(s))", style(&name).bold(), listings.len());
        for listing in listings {
            match &listing.outcome {
                LoadOutcome::Loaded(cp) => print_checkpoint(cp, &session),
                LoadOutcome::Unreadable { reason } => println!(
                    "  {} {}: {}",
                    style("unreadable").red(),
                    listing.path.display(),
                    reason
                ),
                LoadOutcome::Missing => println!(
                    "  {} {}",
                    style("no checkpoint").dim(),
                    listing.path.display()
                ),
            }
        }
        println!();
    }
    Ok(EXIT_SUCCESS)
}
