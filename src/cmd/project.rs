//! Project setup and plan inspection: `stagehand init`, `stagehand plan`.

use anyhow::Result;
use console::style;
use std::path::Path;

use super::super::{Cli, PlanCommands};

pub fn cmd_init(project_dir: &Path) -> Result<()> {
    use stagehand::init::init_project;

    let result = init_project(project_dir)?;

    println!();
    if result.created {
        println!(
            "Initialized stagehand project at {}",
            result.stagehand_dir.display()
        );
    } else {
        println!(
            "Project already initialized at {}; missing files were restored.",
            result.stagehand_dir.display()
        );
    }
    println!();
    println!("Next steps:");
    println!("  1. Describe your phases and units in .stagehand/plan.json");
    println!("  2. Point [workers] in .stagehand/stagehand.toml at your worker command");
    println!("  3. Run 'stagehand plan validate', then 'stagehand run'");
    println!();
    Ok(())
}

pub fn cmd_plan(project_dir: &Path, cli: &Cli, command: Option<PlanCommands>) -> Result<()> {
    use stagehand::dag::{DagConfig, DagScheduler};

    let plan = super::load_plan(project_dir, cli)?;

    match command {
        None | Some(PlanCommands::Show) => {
            println!();
            println!("Plan generated at: {}", plan.generated_at);
            println!("Plan hash: {}", &plan.content_hash()[..12]);
            for phase in &plan.phases {
                println!();
                println!(
                    "{} {}",
                    style(&phase.id).bold(),
                    style(&phase.name).dim()
                );
                for item in &phase.checklist {
                    println!("  [ ] {:<20} {}", item.id, item.description);
                }
                println!(
                    "  {:<20} {:<16} {:<10} {:<24} Depends on",
                    "Unit", "Domain", "Role", "Scopes"
                );
                for unit in &phase.units {
                    println!(
                        "  {:<20} {:<16} {:<10} {:<24} {}",
                        unit.id,
                        unit.domain,
                        unit.role,
                        unit.scopes.join(","),
                        unit.depends_on.join(", ")
                    );
                }
            }
            println!();
        }
        Some(PlanCommands::Validate) => {
            let units: Vec<_> = plan.units().cloned().collect();
            DagScheduler::from_units(&units, DagConfig::default())?;
            println!(
                "Plan is valid: {} phases, {} units, {} domains.",
                plan.phases.len(),
                units.len(),
                plan.domains().len()
            );
        }
        Some(PlanCommands::Waves) => {
            let units: Vec<_> = plan.units().cloned().collect();
            let scheduler = DagScheduler::from_units(&units, DagConfig::default())?;
            let waves = scheduler.compute_waves();
            println!();
            for phase in &plan.phases {
                println!("{}", style(&phase.id).bold());
                let phase_waves = waves.iter().map(|wave| {
                    wave.iter()
                        .filter(|id| phase.units.iter().any(|u| &u.id == *id))
                        .cloned()
                        .collect::<Vec<_>>()
                });
                for (index, wave) in phase_waves.filter(|w| !w.is_empty()).enumerate() {
                    println!("  wave {}: {}", index, wave.join(", "));
                }
            }
            println!();
        }
    }

    Ok(())
}
