use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(
    name = "stagehand",
    version,
    about = "Run autonomous workers through a phased, human-gated pipeline"
)]
pub struct Cli {
    /// Verbose output (debug logging, per-unit findings)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Skip confirmation prompts
    #[arg(short, long, global = true)]
    pub yes: bool,

    /// Project directory (defaults to the current directory)
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Plan file (defaults to .stagehand/plan.json)
    #[arg(long, global = true)]
    pub plan: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create .stagehand/ with a starter plan and config
    Init,
    /// Run the pipeline until it completes or needs a human
    Run {
        /// Units dispatched concurrently within a wave
        #[arg(long)]
        max_parallel: Option<usize>,
        /// Per-dispatch deadline in seconds
        #[arg(long)]
        timeout: Option<u64>,
        /// Correction cycles allowed per unit
        #[arg(long)]
        max_corrections: Option<u32>,
        /// Output mode: full, minimal, json
        #[arg(long, default_value = "full")]
        ui: String,
        /// Ask for phase approval on the terminal instead of stopping at the gate
        #[arg(short, long)]
        interactive: bool,
    },
    /// Show the current phase, wave and unit states
    Status {
        /// Print the status report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Phase gate decisions
    Gate {
        #[command(subcommand)]
        command: GateCommands,
    },
    /// Submit an escalation against a guidance domain
    Escalate {
        domain: String,
        description: String,
        /// Who raised it (a unit id or a person)
        #[arg(long, default_value = "human")]
        raised_by: String,
    },
    /// Put failed units back in the queue
    Requeue {
        #[arg(required = true)]
        units: Vec<String>,
    },
    /// Inspect the plan
    Plan {
        #[command(subcommand)]
        command: Option<PlanCommands>,
    },
    /// Print ledger entries
    Ledger {
        /// Only entries for this entity type (unit, phase, wave, lease, ...)
        #[arg(long)]
        entity: Option<String>,
        /// Only entries for this entity id
        #[arg(long)]
        id: Option<String>,
        /// Only the last N matching entries
        #[arg(long)]
        tail: Option<usize>,
        /// Print raw JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Manage stagehand.toml
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum GateCommands {
    /// Approve a phase that is awaiting approval
    Approve {
        phase: String,
        #[arg(short, long, default_value = "")]
        message: String,
    },
    /// Reject a phase that is awaiting approval
    Reject {
        phase: String,
        #[arg(short, long, default_value = "")]
        message: String,
    },
    /// Put a rejected phase back in progress and resolve its blockers
    Resume { phase: String },
    /// Close a checklist item
    Check { phase: String, item: String },
    /// Reopen the most recently approved phase
    Reopen {
        phase: String,
        #[arg(long)]
        reason: String,
    },
}

#[derive(Subcommand, Clone)]
pub enum PlanCommands {
    /// List phases, checklists and units
    Show,
    /// Validate the plan and its dependency graph
    Validate,
    /// Show the waves each phase resolves to
    Waves,
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default stagehand.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let _log_guard = cmd::init_logging(&project_dir, &cli)?;

    match &cli.command {
        Commands::Init => cmd::cmd_init(&project_dir)?,
        Commands::Run {
            max_parallel,
            timeout,
            max_corrections,
            ui,
            interactive,
        } => {
            let overrides = cmd::RunOverrides {
                max_parallel: *max_parallel,
                unit_timeout_secs: *timeout,
                max_corrections: *max_corrections,
            };
            cmd::run_engine(&cli, project_dir, overrides, ui, *interactive).await?;
        }
        Commands::Status { json } => cmd::cmd_status(&project_dir, &cli, *json)?,
        Commands::Gate { command } => cmd::cmd_gate(&project_dir, &cli, command.clone())?,
        Commands::Escalate {
            domain,
            description,
            raised_by,
        } => cmd::cmd_escalate(&project_dir, &cli, domain, description, raised_by)?,
        Commands::Requeue { units } => cmd::cmd_requeue(&project_dir, &cli, units)?,
        Commands::Plan { command } => cmd::cmd_plan(&project_dir, &cli, command.clone())?,
        Commands::Ledger {
            entity,
            id,
            tail,
            json,
        } => cmd::cmd_ledger(
            &project_dir,
            entity.as_deref(),
            id.as_deref(),
            *tail,
            *json,
        )?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}
