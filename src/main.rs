use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use convoy::config::TuningFlags;
use convoy::errors::OrchestratorError;
use convoy::orchestrator::EXIT_ERROR;

mod cmd;

#[derive(Parser)]
#[command(name = "convoy")]
#[command(version, about = "Checkpointed multi-phase pipeline orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Tuning flags shared by `run` and `batch`. They win over every other
/// configuration layer.
#[derive(Args, Debug, Clone, Default)]
pub struct TuningArgs {
    /// Per-phase budget in seconds
    #[arg(long, value_name = "SECS")]
    pub phase_timeout: Option<u64>,

    /// Total pipeline budget in seconds for this invocation
    #[arg(long, value_name = "SECS")]
    pub total_timeout: Option<u64>,

    /// Signal directory poll interval in seconds
    #[arg(long, value_name = "SECS")]
    pub signal_poll: Option<u64>,

    /// Task pool poll interval in seconds
    #[arg(long, value_name = "SECS")]
    pub pool_poll: Option<u64>,

    /// Age in minutes after which a dead-session team is stale
    #[arg(long, value_name = "MINS")]
    pub team_stale_mins: Option<u64>,

    /// Age in minutes after which an in-progress claim is released
    #[arg(long, value_name = "MINS")]
    pub task_stale_mins: Option<u64>,
}

impl TuningArgs {
    pub fn to_flags(&self) -> TuningFlags {
        TuningFlags {
            phase_timeout_secs: self.phase_timeout,
            total_timeout_secs: self.total_timeout,
            signal_poll_secs: self.signal_poll,
            pool_poll_secs: self.pool_poll,
            team_stale_mins: self.team_stale_mins,
            task_stale_mins: self.task_stale_mins,
        }
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a pipeline, or resume its latest unfinished run
    Run {
        pipeline: String,

        /// Continue from the latest checkpoint instead of starting fresh
        #[arg(long)]
        resume: bool,

        /// Run id to resume, or to give a fresh run
        #[arg(long)]
        run_id: Option<String>,

        #[command(flatten)]
        tuning: TuningArgs,
    },
    /// Cancel a running pipeline, or stop a batch before its next run
    Cancel {
        #[arg(required_unless_present = "batch")]
        pipeline: Option<String>,

        #[arg(long)]
        run_id: Option<String>,

        /// Stop the running batch after its current run
        #[arg(long, conflicts_with_all = ["pipeline", "run_id"])]
        batch: bool,
    },
    /// Run several pipelines one after another
    Batch {
        #[arg(required = true)]
        pipelines: Vec<String>,

        #[command(flatten)]
        tuning: TuningArgs,
    },
    /// Show checkpoints and their phase statuses
    Status { pipeline: Option<String> },
    /// Inspect worker teams
    Teams {
        #[command(subcommand)]
        command: TeamsCommands,
    },
    /// Worker-side task pool commands
    Task {
        #[command(subcommand)]
        command: TaskCommands,
    },
    /// Worker-side completion signals
    Signal {
        #[command(subcommand)]
        command: SignalCommands,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum TeamsCommands {
    /// List stale teams left by dead sessions
    Scan {
        /// Minimum age in minutes (defaults to the configured stale age)
        #[arg(long)]
        max_age_mins: Option<u64>,

        /// Remove the stale teams found
        #[arg(long)]
        reap: bool,
    },
}

#[derive(Subcommand, Clone)]
pub enum TaskCommands {
    /// List tasks in a team's pool
    List {
        #[arg(long, env = "CONVOY_TEAM")]
        team: String,

        /// Only tasks with this status: pending, in_progress, completed
        #[arg(long)]
        status: Option<String>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Claim a task (or the first unblocked one) and print it as JSON
    Claim {
        #[arg(long, env = "CONVOY_TEAM")]
        team: String,

        #[arg(long, env = "CONVOY_WORKER")]
        owner: String,

        task_id: Option<String>,
    },
    /// Mark a claimed task completed
    Complete {
        #[arg(long, env = "CONVOY_TEAM")]
        team: String,

        #[arg(long, env = "CONVOY_WORKER")]
        owner: Option<String>,

        task_id: String,
    },
    /// Release claims held longer than the stale age
    ReleaseStale {
        #[arg(long, env = "CONVOY_TEAM")]
        team: String,

        #[arg(long)]
        stale_mins: Option<u64>,
    },
}

#[derive(Subcommand, Clone)]
pub enum SignalCommands {
    /// Record that a task finished
    Done {
        task_id: String,

        #[arg(long, env = "CONVOY_TEAM")]
        team: String,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the resolved configuration
    Show,
    /// Validate configuration files and show any warnings
    Validate,
}

async fn dispatch(cli: &Cli, project_dir: PathBuf) -> Result<i32> {
    match &cli.command {
        Commands::Run {
            pipeline,
            resume,
            run_id,
            tuning,
        } => cmd::cmd_run(&project_dir, pipeline, *resume, run_id.clone(), tuning).await,
        Commands::Cancel {
            pipeline,
            run_id,
            batch,
        } => cmd::cmd_cancel(&project_dir, pipeline.as_deref(), run_id.as_deref(), *batch),
        Commands::Batch { pipelines, tuning } => {
            cmd::cmd_batch(&project_dir, pipelines, tuning).await
        }
        Commands::Status { pipeline } => cmd::cmd_status(&project_dir, pipeline.as_deref()),
        Commands::Teams { command } => cmd::cmd_teams(&project_dir, command.clone()),
        Commands::Task { command } => cmd::cmd_task(&project_dir, command.clone()),
        Commands::Signal { command } => cmd::cmd_signal(&project_dir, command.clone()),
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone()),
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(&cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", console::style("error:").red().bold(), e);
            e.downcast_ref::<OrchestratorError>()
                .map(OrchestratorError::exit_code)
                .unwrap_or(EXIT_ERROR)
        }
    };
    std::process::exit(code);
}

async fn run(cli: &Cli) -> Result<i32> {
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    // Worker-side and read-only commands log to stderr only.
    let log_dir = match cli.command {
        Commands::Run { .. } | Commands::Batch { .. } | Commands::Cancel { .. } => {
            Some(convoy::config::ConvoyPaths::new(&project_dir).log_dir())
        }
        _ => None,
    };
    let _guard = convoy::logging::init(cli.verbose, log_dir.as_deref());

    dispatch(cli, project_dir).await
}
