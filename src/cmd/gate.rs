//! Human decisions: `stagehand gate`, `stagehand requeue`, `stagehand escalate`.
//!
//! These take the ledger lock, so they cannot run while `stagehand run` is
//! active; the next run picks up whatever they record.

use anyhow::{Context, Result};
use dialoguer::Confirm;
use std::path::Path;

use stagehand::ledger::Ledger;

use super::super::{Cli, GateCommands};

fn open_ledger(project_dir: &Path) -> Result<Ledger> {
    let path = stagehand::init::get_stagehand_dir(project_dir).join("ledger.jsonl");
    Ledger::open(&path).with_context(|| {
        format!(
            "Failed to open ledger {} (is `stagehand run` still active?)",
            path.display()
        )
    })
}

fn confirm(cli: &Cli, prompt: &str) -> Result<bool> {
    if cli.yes {
        return Ok(true);
    }
    Ok(Confirm::new()
        .with_prompt(prompt)
        .default(false)
        .interact()?)
}

pub fn cmd_gate(project_dir: &Path, cli: &Cli, command: GateCommands) -> Result<()> {
    use stagehand::gates::{ApprovalSignal, PhaseGateController};
    use stagehand::ledger::ACTOR_HUMAN;

    let plan = super::load_plan(project_dir, cli)?;
    let gates = PhaseGateController::new(open_ledger(project_dir)?, plan.phases.clone());

    match command {
        GateCommands::Approve { phase, message } => {
            gates.apply_signal(&phase, &ApprovalSignal::approve(&message), ACTOR_HUMAN)?;
            println!("Phase {} approved. Run 'stagehand run' to continue.", phase);
        }
        GateCommands::Reject { phase, message } => {
            if !confirm(cli, &format!("Reject phase {}?", phase))? {
                println!("Aborted.");
                return Ok(());
            }
            gates.apply_signal(&phase, &ApprovalSignal::reject(&message), ACTOR_HUMAN)?;
            println!("Phase {} rejected and blocked.", phase);
        }
        GateCommands::Resume { phase } => {
            gates.resume(&phase, ACTOR_HUMAN)?;
            println!("Phase {} resumed. Run 'stagehand run' to continue.", phase);
        }
        GateCommands::Check { phase, item } => {
            gates.complete_checklist_item(&phase, &item, ACTOR_HUMAN)?;
            let open = gates.open_checklist_items(&phase)?;
            if open.is_empty() {
                println!("Closed {}; phase {} has no open checklist items.", item, phase);
            } else {
                println!("Closed {}; still open: {}", item, open.join(", "));
            }
        }
        GateCommands::Reopen { phase, reason } => {
            if !confirm(cli, &format!("Reopen approved phase {}?", phase))? {
                println!("Aborted.");
                return Ok(());
            }
            gates.reopen(&phase, &reason, ACTOR_HUMAN)?;
            println!("Phase {} reopened.", phase);
        }
    }

    Ok(())
}

pub fn cmd_requeue(project_dir: &Path, cli: &Cli, units: &[String]) -> Result<()> {
    use stagehand::ledger::ACTOR_HUMAN;
    use stagehand::orchestrator::RecoveryManager;

    let plan = super::load_plan(project_dir, cli)?;
    let recovery = RecoveryManager::new(open_ledger(project_dir)?);
    for unit in units {
        let gate = recovery.requeue_unit(&plan, unit, ACTOR_HUMAN)?;
        println!("Requeued {} (phase gate: {}).", unit, gate);
    }
    Ok(())
}

pub fn cmd_escalate(
    project_dir: &Path,
    cli: &Cli,
    domain: &str,
    description: &str,
    raised_by: &str,
) -> Result<()> {
    use stagehand::escalation::{EscalationRequest, record_submission};

    let plan = super::load_plan(project_dir, cli)?;
    if !plan.domains().iter().any(|d| d == domain) {
        tracing::warn!(domain, "domain is not used by any unit in the plan");
    }

    let ledger = open_ledger(project_dir)?;
    let position = ledger.view()?.next_escalation_position();
    let request = EscalationRequest::new(raised_by, domain, description);
    record_submission(&ledger, &request, position)?;

    println!(
        "Escalation {} queued at position {}; it is applied when 'stagehand run' next starts.",
        request.id, position
    );
    Ok(())
}
