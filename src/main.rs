use clap::{Parser, Subcommand};
use console::style;
use std::path::PathBuf;
use std::process::ExitCode;

use sysrev::config::{DEFAULT_DATA_DIR, ENV_DATA_DIR};
use sysrev::telemetry::LogOptions;

mod cmd;

#[derive(Parser)]
#[command(name = "sysrev")]
#[command(version, about = "Resumable systematic-review pipeline with dual-reviewer consensus")]
pub struct Cli {
    /// Debug-level logs and one line per decided item
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs on stderr as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Directory holding the workflow registry and per-workflow state
    #[arg(long, global = true, env = ENV_DATA_DIR)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

impl Cli {
    pub fn log_options(&self) -> LogOptions {
        LogOptions {
            verbose: self.verbose,
            json: self.log_json,
        }
    }

    /// Data directory for commands that have no config file to read it from.
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start a review, or continue the one started with the same config
    Run {
        /// Path to the review config (TOML)
        config: PathBuf,
    },
    /// Continue an interrupted or failed workflow from its last checkpoint
    Resume {
        #[arg(long)]
        workflow_id: String,
    },
    /// Show checkpoints, outcome counts and cost for a workflow
    Status {
        #[arg(long)]
        workflow_id: String,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::Run { config } => cmd::cmd_run(&cli, config).await,
        Commands::Resume { workflow_id } => cmd::cmd_resume(&cli, workflow_id).await,
        Commands::Status { workflow_id } => cmd::cmd_status(&cli, workflow_id).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {:#}", style("error:").red().bold(), err);
            ExitCode::from(cmd::exit_code(&err))
        }
    }
}
