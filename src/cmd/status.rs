//! Read-only inspection: `stagehand status`, `stagehand ledger`.
//!
//! Both read the ledger file without taking its lock, so they work while a
//! run is in progress.

use anyhow::Result;
use console::style;
use std::path::Path;

use super::super::Cli;

pub fn cmd_status(project_dir: &Path, cli: &Cli, json: bool) -> Result<()> {
    use stagehand::init::get_stagehand_dir;
    use stagehand::ledger::{Ledger, LedgerView};
    use stagehand::orchestrator::StatusReport;
    use stagehand::unit::UnitStatus;

    super::check_initialized(project_dir)?;
    let plan = super::load_plan(project_dir, cli)?;
    let entries = Ledger::load_entries(&get_stagehand_dir(project_dir).join("ledger.jsonl"))?;
    let report = StatusReport::build(&LedgerView::fold(&entries)?, Some(&plan));

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    println!();
    match &report.current_phase {
        Some(phase) => println!("Current phase: {}", style(phase).bold()),
        None => println!("Current phase: {}", style("all phases approved").green()),
    }
    if let Some(wave) = &report.current_wave {
        println!(
            "Current wave: {} #{} ({})",
            wave.phase,
            wave.index,
            wave.units.join(", ")
        );
    }
    println!();

    println!("{:<20} {:<20} Notes", "Phase", "Gate");
    for phase in &report.phases {
        let mut notes = Vec::new();
        if !phase.open_checklist.is_empty() {
            notes.push(format!("open checklist: {}", phase.open_checklist.join(", ")));
        }
        if !phase.open_blockers.is_empty() {
            notes.push(format!("{} open blocker(s)", phase.open_blockers.len()));
        }
        println!(
            "{:<20} {:<20} {}",
            phase.id,
            phase.status.to_string(),
            notes.join("; ")
        );
        if cli.verbose {
            for blocker in &phase.open_blockers {
                for finding in blocker {
                    println!("{:<20} - {}", "", finding);
                }
            }
        }
    }
    println!();

    println!(
        "{:<20} {:<12} {:<22} {:<8} Last error",
        "Unit", "Phase", "Status", "Retries"
    );
    for unit in &report.units {
        let status = match unit.status {
            UnitStatus::Verified => style(unit.status.to_string()).green(),
            UnitStatus::Failed => style(unit.status.to_string()).red(),
            UnitStatus::Pending => style(unit.status.to_string()).dim(),
            _ => style(unit.status.to_string()).yellow(),
        };
        let last_error = unit
            .last_error
            .map(|e| e.to_string())
            .unwrap_or_default();
        let orphan = if unit.orphan { " (not in plan)" } else { "" };
        println!(
            "{:<20} {:<12} {:<22} {:<8} {}{}",
            unit.id, unit.phase, status, unit.retry_count, last_error, orphan
        );
    }
    println!();

    if !report.guidance.is_empty() {
        let versions: Vec<String> = report
            .guidance
            .iter()
            .map(|(domain, version)| format!("{}=v{}", domain, version))
            .collect();
        println!("Guidance: {}", versions.join(", "));
    }
    if report.pending_escalations > 0 {
        println!("Pending escalations: {}", report.pending_escalations);
    }
    if !report.leases.is_empty() {
        for (scope, holder) in &report.leases {
            println!("Lease: {} held by {}", scope, holder);
        }
    }
    println!(
        "Verified: {}/{}  Ledger entries: {}",
        report.count(UnitStatus::Verified),
        report.units.iter().filter(|u| !u.orphan).count(),
        report.ledger_entries
    );
    println!();

    Ok(())
}

pub fn cmd_ledger(
    project_dir: &Path,
    entity: Option<&str>,
    id: Option<&str>,
    tail: Option<usize>,
    json: bool,
) -> Result<()> {
    use stagehand::init::get_stagehand_dir;
    use stagehand::ledger::{EntityKind, Ledger};

    super::check_initialized(project_dir)?;
    let entity: Option<EntityKind> = entity.map(str::parse).transpose()?;
    let entries = Ledger::load_entries(&get_stagehand_dir(project_dir).join("ledger.jsonl"))?;

    let matching: Vec<_> = entries
        .iter()
        .filter(|e| entity.is_none_or(|k| e.entity == k))
        .filter(|e| id.is_none_or(|i| e.entity_id == i))
        .collect();
    let skip = tail.map_or(0, |n| matching.len().saturating_sub(n));

    for entry in matching.into_iter().skip(skip) {
        if json {
            println!("{}", serde_json::to_string(entry)?);
            continue;
        }
        println!(
            "{:>6} {} {:<11} {:<24} {:>16} -> {:<22} {}",
            entry.seq,
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.entity.to_string(),
            entry.entity_id,
            entry.old_status.as_deref().unwrap_or("-"),
            entry.new_status,
            style(&entry.actor).dim()
        );
    }

    Ok(())
}
