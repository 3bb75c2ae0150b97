//! Worker-side task pool commands: `convoy task ...`.
//!
//! Workers find their team through `CONVOY_TEAM` and their identity through
//! `CONVOY_WORKER`, both set by the orchestrator when it spawns them.

use anyhow::{Result, bail};
use console::style;
use std::path::Path;

use convoy::config::{ConvoyPaths, ResolvedConfig, TuningFlags};
use convoy::orchestrator::EXIT_SUCCESS;
use convoy::pool::{Task, TaskPool, TaskStatus};
use convoy::team::validate_team_name;

use super::super::TaskCommands;

fn open_pool(paths: &ConvoyPaths, team: &str, max_releases: u32) -> Result<TaskPool> {
    validate_team_name(team)?;
    let dir = paths.pool_dir(team);
    if !dir.is_dir() {
        bail!("Team '{}' has no task pool at {}", team, dir.display());
    }
    Ok(TaskPool::new(&dir).with_max_releases(max_releases))
}

fn parse_status(raw: &str) -> Result<TaskStatus> {
    Ok(match raw {
        "pending" => TaskStatus::Pending,
        "in_progress" | "in-progress" => TaskStatus::InProgress,
        "completed" => TaskStatus::Completed,
        other => bail!(
            "Unknown task status '{}' (expected pending, in_progress or completed)",
            other
        ),
    })
}

fn print_table(tasks: &[Task]) {
    println!(
        "{:<5} {:<12} {:<12} {:<10} Description",
        "Id", "Status", "Owner", "Blocked by"
    );
    println!(
        "{:<5} {:<12} {:<12} {:<10} -----------",
        "-----", "------------", "------------", "----------"
    );
    for task in tasks {
        let status = match task.status {
            TaskStatus::Completed => style(task.status.to_string()).green(),
            TaskStatus::InProgress => style(task.status.to_string()).cyan(),
            TaskStatus::Pending => style(task.status.to_string()).dim(),
        };
        println!(
            "{:<5} {:<12} {:<12} {:<10} {}",
            task.id,
            status,
            task.owner.as_deref().unwrap_or("-"),
            if task.blocked_by.is_empty() {
                "-".to_string()
            } else {
                task.blocked_by.join(",")
            },
            task.description
        );
    }
}

pub fn cmd_task(project_dir: &Path, command: TaskCommands) -> Result<i32> {
    let paths = ConvoyPaths::new(project_dir);

    match command {
        TaskCommands::List { team, status, json } => {
            let config = ResolvedConfig::resolve(&TuningFlags::default(), &paths.convoy_dir)?;
            let pool = open_pool(&paths, &team, config.tuning.max_task_releases)?;
            let status = status.as_deref().map(parse_status).transpose()?;
            let tasks = pool.list(status)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&tasks)?);
            } else {
                print_table(&tasks);
            }
        }
        TaskCommands::Claim {
            team,
            owner,
            task_id,
        } => {
            let config = ResolvedConfig::resolve(&TuningFlags::default(), &paths.convoy_dir)?;
            let pool = open_pool(&paths, &team, config.tuning.max_task_releases)?;
            let claimed = match task_id {
                Some(id) => Some(pool.claim(&id, &owner)?),
                None => pool.claim_next(&owner)?,
            };
            // Empty stdout means nothing is claimable right now.
            if let Some(task) = claimed {
                println!("{}", serde_json::to_string(&task)?);
            }
        }
        TaskCommands::Complete {
            team,
            owner,
            task_id,
        } => {
            let config = ResolvedConfig::resolve(&TuningFlags::default(), &paths.convoy_dir)?;
            let pool = open_pool(&paths, &team, config.tuning.max_task_releases)?;
            let task = pool.complete(&task_id, owner.as_deref())?;
            eprintln!("{} Task {} completed", style("✓").green(), task.id);
        }
        TaskCommands::ReleaseStale { team, stale_mins } => {
            let flags = TuningFlags {
                task_stale_mins: stale_mins,
                ..Default::default()
            };
            let config = ResolvedConfig::resolve(&flags, &paths.convoy_dir)?;
            let pool = open_pool(&paths, &team, config.tuning.max_task_releases)?;
            let sweep = pool.release_stale(
                config.tuning.task_stale_after,
                config.tuning.task_warn_after,
            )?;
            for event in &sweep.released {
                println!(
                    "released {} (was {})",
                    event.task_id, event.previous_owner
                );
            }
            for id in &sweep.repeatedly_failing {
                println!("{} task {} keeps going stale", style("!").yellow(), id);
            }
            if sweep.is_empty() {
                println!("No stale claims.");
            }
        }
    }
    Ok(EXIT_SUCCESS)
}
