//! Pipeline execution: `stagehand run`.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;

use super::super::Cli;

/// Scheduler and verification limits given on the command line.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunOverrides {
    pub max_parallel: Option<usize>,
    pub unit_timeout_secs: Option<u64>,
    pub max_corrections: Option<u32>,
}

pub async fn run_engine(
    cli: &Cli,
    project_dir: PathBuf,
    overrides: RunOverrides,
    ui_mode: &str,
    interactive: bool,
) -> Result<()> {
    use stagehand::config::Config;
    use stagehand::gates::PromptApprovals;
    use stagehand::ledger::Ledger;
    use stagehand::orchestrator::{Engine, EngineEvent};
    use stagehand::ui::{UiMode, WaveUI};
    use stagehand::unit::UnitStatus;
    use tokio::sync::mpsc;

    super::check_initialized(&project_dir)?;

    let config = Config::with_overrides(
        project_dir,
        cli.verbose,
        cli.plan.clone(),
        overrides.max_parallel,
        overrides.unit_timeout_secs,
        overrides.max_corrections,
    )?;
    config.ensure_directories()?;

    for warning in config.settings().validate() {
        tracing::warn!("{}", warning);
    }

    let plan = stagehand::unit::PlanFile::load(&config.plan_file)?;
    let ledger = Ledger::open(&config.ledger_file)
        .with_context(|| format!("Failed to open ledger {}", config.ledger_file.display()))?;
    let dag_config = config.settings().dag_config();

    let mode = UiMode::parse(ui_mode);
    let total_units = plan.units().count();
    if mode == UiMode::Full {
        println!();
        println!("{}", console::style("stagehand").bold().cyan());
        println!("─────────");
        println!("Phases: {}", plan.phases.len());
        println!("Units: {}", total_units);
        println!("Max parallel: {}", dag_config.max_parallel);
        println!("Unit timeout: {}s", dag_config.unit_timeout_secs);
        println!("Max corrections: {}", dag_config.max_corrections);
    }

    let ui = Arc::new(WaveUI::new(total_units, mode, cli.verbose));
    ui.set_verified(
        ledger
            .view()?
            .units_in(UnitStatus::Verified)
            .iter()
            .filter(|id| plan.get_unit(id).is_some())
            .count(),
    );

    let (event_tx, mut event_rx) = mpsc::channel::<EngineEvent>(256);
    let ui_task = ui.clone();
    let display_handle = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            ui_task.handle_event(&event);
        }
    });

    let mut engine = Engine::new(ledger, plan, config.settings().worker_pool(), dag_config)
        .with_events(event_tx);
    if interactive {
        engine = engine.with_approvals(Arc::new(PromptApprovals));
    }

    // Dropping the run future kills worker processes; the next run's
    // recovery pass interrupts whatever was in flight.
    let outcome = tokio::select! {
        outcome = engine.run() => outcome?,
        _ = tokio::signal::ctrl_c() => {
            eprintln!();
            eprintln!("Interrupted. In-flight units will be requeued on the next run.");
            return Ok(());
        }
    };

    drop(engine);
    // the display task ends once every event sender is gone
    display_handle.await.ok();
    ui.finish(&outcome);

    match outcome {
        stagehand::orchestrator::RunOutcome::Halted { phase, .. } => {
            anyhow::bail!("Phase {} halted; see 'stagehand status'", phase)
        }
        stagehand::orchestrator::RunOutcome::Rejected { phase, .. } => {
            anyhow::bail!("Phase {} was rejected", phase)
        }
        _ => Ok(()),
    }
}
