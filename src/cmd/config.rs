//! Configuration view and validation commands: `stagehand config`.

use anyhow::Result;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    use stagehand::init::get_stagehand_dir;
    use stagehand::stagehand_config::{StagehandConfig, StagehandToml};

    let stagehand_dir = get_stagehand_dir(project_dir);
    let config_path = stagehand_dir.join("stagehand.toml");

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Stagehand Configuration");
            println!("=======================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No stagehand.toml found at {}", config_path.display());
                println!("Using default configuration.");
            }
            println!();

            let toml = StagehandToml::load_or_default(&stagehand_dir)?;
            println!("[scheduler]");
            println!("  max_parallel = {}", toml.scheduler.max_parallel);
            println!("  unit_timeout_secs = {}", toml.scheduler.unit_timeout_secs);
            println!();
            println!("[verification]");
            println!("  max_corrections = {}", toml.verification.max_corrections);
            println!();
            for (key, worker) in &toml.workers {
                println!("[workers.{}]", key);
                println!("  command = \"{}\"", worker.command);
                if !worker.args.is_empty() {
                    println!("  args = {:?}", worker.args);
                }
                println!();
            }
            println!("[logging]");
            println!("  level = \"{}\"", toml.logging.level);
            println!("  json = {}", toml.logging.json);
            println!("  file = {}", toml.logging.file);
            println!();

            // Show effective values (including env overrides)
            let config = StagehandConfig::new(project_dir.to_path_buf())?;
            let dag = config.dag_config();
            println!("Effective values (with env overrides):");
            println!("  max_parallel = {}", dag.max_parallel);
            println!("  unit_timeout_secs = {}", dag.unit_timeout_secs);
            println!("  max_corrections = {}", dag.max_corrections);
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            let toml = StagehandToml::load_or_default(&stagehand_dir)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("stagehand.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&stagehand_dir)?;
            StagehandToml::default().save(&config_path)?;

            println!("Created stagehand.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [scheduler] max_parallel, unit_timeout_secs");
            println!("  - [verification] max_corrections");
            println!("  - [workers.<role>] command, args");
            println!();
        }
    }

    Ok(())
}
