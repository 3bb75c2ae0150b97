//! `convoy teams`.

use anyhow::Result;
use console::style;
use std::path::Path;
use std::time::Duration;

use convoy::config::{ConvoyPaths, ResolvedConfig, TuningFlags};
use convoy::orchestrator::EXIT_SUCCESS;
use convoy::session::SessionContext;
use convoy::team::TeamGuard;

use super::super::TeamsCommands;

pub fn cmd_teams(project_dir: &Path, command: TeamsCommands) -> Result<i32> {
    let TeamsCommands::Scan { max_age_mins, reap } = command;

    let paths = ConvoyPaths::new(project_dir);
    let flags = TuningFlags {
        team_stale_mins: max_age_mins,
        ..Default::default()
    };
    let config = ResolvedConfig::resolve(&flags, &paths.convoy_dir)?;
    let max_age = config.tuning.team_stale_after;
    let session = SessionContext::current(&paths.convoy_dir);
    let guard = TeamGuard::new(paths, &session, config.tuning.retry_backoff.clone());

    let stale = guard.scan_for_stale(max_age);
    println!();
    if stale.is_empty() {
        println!(
            "No stale teams older than {} minutes.",
            max_age.as_secs() / 60
        );
        println!();
        return Ok(EXIT_SUCCESS);
    }

    println!("{:<40} {:>8}  Owner", "Team", "Age");
    println!("{:<40} {:>8}  -----", "-".repeat(40), "--------");
    for team in &stale {
        let owner = team
            .owner
            .as_ref()
            .map(|o| format!("pid {} (dead)", o.owner_pid))
            .unwrap_or_else(|| "unknown".to_string());
        println!(
            "{:<40} {:>8}  {}",
            team.name,
            format_age(team.age),
            style(owner).dim()
        );
    }
    println!();

    if reap {
        let removed = guard.reap_stale(max_age);
        println!(
            "{} Removed {} stale team(s)",
            style("✓").green().bold(),
            removed.len()
        );
        println!();
    } else {
        println!("Run with --reap to remove them.");
        println!();
    }
    Ok(EXIT_SUCCESS)
}

fn format_age(age: Duration) -> String {
    let mins = age.as_secs() / 60;
    if mins >= 60 {
        format!("{}h{:02}m", mins / 60, mins % 60)
    } else {
        format!("{}m", mins)
    }
}
