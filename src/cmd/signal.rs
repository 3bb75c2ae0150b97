//! `convoy signal done`.

use anyhow::Result;
use std::path::Path;
use tracing::info;

use convoy::config::ConvoyPaths;
use convoy::orchestrator::EXIT_SUCCESS;
use convoy::signals::{SignalBus, SignalOutcome};
use convoy::team::validate_team_name;

use super::super::SignalCommands;

pub fn cmd_signal(project_dir: &Path, command: SignalCommands) -> Result<i32> {
    let SignalCommands::Done { task_id, team } = command;
    validate_team_name(&team)?;

    let paths = ConvoyPaths::new(project_dir);
    let bus = SignalBus::new(&paths.signal_dir(&team));
    match bus.signal_done(&task_id)? {
        SignalOutcome::Recorded => info!(%team, %task_id, "Signal recorded"),
        SignalOutcome::SentinelWritten => {
            info!(%team, %task_id, "Signal recorded; all expected tasks are done")
        }
        SignalOutcome::NoSignalDirectory => {
            info!(%team, %task_id, "No signal directory; completion is tracked by the task pool")
        }
    }
    Ok(EXIT_SUCCESS)
}
