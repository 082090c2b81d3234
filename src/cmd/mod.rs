//! CLI command implementations.
//!
//! | Module     | Commands handled                 |
//! |------------|----------------------------------|
//! | `project`  | `Init`, `Plan`                   |
//! | `run`      | `Run`                            |
//! | `status`   | `Status`, `Ledger`               |
//! | `gate`     | `Gate`, `Requeue`, `Escalate`    |
//! | `config`   | `Config`                         |

pub mod config;
pub mod gate;
pub mod project;
pub mod run;
pub mod status;

pub use config::cmd_config;
pub use gate::{cmd_escalate, cmd_gate, cmd_requeue};
pub use project::{cmd_init, cmd_plan};
pub use run::{RunOverrides, run_engine};
pub use status::{cmd_ledger, cmd_status};

use anyhow::Result;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;

use stagehand::init::{get_stagehand_dir, is_initialized};
use stagehand::stagehand_config::StagehandToml;

use super::Cli;

/// Set up tracing from `[logging]`. The log file is only written once the
/// project has a `.stagehand/` directory.
pub fn init_logging(project_dir: &Path, cli: &Cli) -> Result<Option<WorkerGuard>> {
    let stagehand_dir = get_stagehand_dir(project_dir);
    // a broken config is reported by the command itself
    let toml = StagehandToml::load_or_default(&stagehand_dir).unwrap_or_default();
    let log_dir = stagehand_dir.join("logs");
    let log_dir = is_initialized(project_dir).then_some(log_dir.as_path());
    stagehand::logging::init(&toml.logging, log_dir, cli.verbose)
}

/// Fail with a hint when the project has no `.stagehand/` directory.
pub fn check_initialized(project_dir: &Path) -> Result<()> {
    if !is_initialized(project_dir) {
        anyhow::bail!("Project not initialized. Run 'stagehand init' first.");
    }
    Ok(())
}

/// Load the plan named on the command line, or `.stagehand/plan.json`.
pub fn load_plan(project_dir: &Path, cli: &Cli) -> Result<stagehand::unit::PlanFile> {
    let path = match &cli.plan {
        Some(path) => path.clone(),
        None => {
            check_initialized(project_dir)?;
            get_stagehand_dir(project_dir).join("plan.json")
        }
    };
    stagehand::unit::PlanFile::load(&path)
}
