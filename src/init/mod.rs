//! `stagehand init`: create the `.stagehand/` directory in a project.
//!
//! ```text
//! .stagehand/
//! ├── plan.json        # Phases, checklists and work units
//! ├── stagehand.toml   # Scheduler, verification, worker and logging settings
//! ├── ledger.jsonl     # Transition ledger (created on first run)
//! └── logs/            # Daily-rolling log files
//! ```

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::stagehand_config::{DEFAULT_WORKER, StagehandToml, WorkerCommand};
use crate::unit::{ChecklistItem, PhaseDef, PlanFile, WorkUnit, WorkerRole};

pub const STAGEHAND_DIR: &str = ".stagehand";

#[derive(Debug)]
pub struct InitResult {
    pub stagehand_dir: PathBuf,
    /// False if the directory already existed
    pub created: bool,
}

/// Initialize a stagehand project in `project_dir`.
///
/// Existing `plan.json` and `stagehand.toml` files are left untouched.
pub fn init_project(project_dir: &Path) -> Result<InitResult> {
    let stagehand_dir = get_stagehand_dir(project_dir);
    let created = !stagehand_dir.exists();

    std::fs::create_dir_all(stagehand_dir.join("logs")).with_context(|| {
        format!("Failed to create directory: {}", stagehand_dir.display())
    })?;

    let config_file = stagehand_dir.join("stagehand.toml");
    if !config_file.exists() {
        sample_config().save(&config_file)?;
    }

    let plan_file = stagehand_dir.join("plan.json");
    if !plan_file.exists() {
        sample_plan().save(&plan_file)?;
    }

    Ok(InitResult {
        stagehand_dir,
        created,
    })
}

fn sample_config() -> StagehandToml {
    let mut toml = StagehandToml::default();
    toml.workers.insert(
        DEFAULT_WORKER.to_string(),
        WorkerCommand {
            command: "stagehand-worker".to_string(),
            args: Vec::new(),
        },
    );
    toml
}

/// A two-phase starter plan.
pub fn sample_plan() -> PlanFile {
    PlanFile::new(vec![
        PhaseDef::new("design", "Design").with_units(vec![
            WorkUnit::new("survey", "architecture", vec![])
                .with_role(WorkerRole::Scout)
                .with_scopes(vec!["docs/survey".to_string()]),
        ]),
        PhaseDef::new("build", "Build")
            .with_checklist(vec![ChecklistItem {
                id: "review".to_string(),
                description: "Reviewed the built artifacts".to_string(),
            }])
            .with_units(vec![
                WorkUnit::new("core", "core", vec![])
                    .with_scopes(vec!["src/core".to_string()]),
                WorkUnit::new("cli", "cli", vec!["core".to_string()])
                    .with_scopes(vec!["src/cli".to_string()]),
            ]),
    ])
}

pub fn is_initialized(project_dir: &Path) -> bool {
    get_stagehand_dir(project_dir).exists()
}

pub fn get_stagehand_dir(project_dir: &Path) -> PathBuf {
    project_dir.join(STAGEHAND_DIR)
}

/// True if `.stagehand/plan.json` exists and parses as a valid plan.
pub fn has_plan(project_dir: &Path) -> bool {
    let plan_file = get_stagehand_dir(project_dir).join("plan.json");
    plan_file.exists() && PlanFile::load(&plan_file).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_init_project_creates_directory() {
        let dir = tempdir().unwrap();
        let result = init_project(dir.path()).unwrap();

        assert!(result.created);
        assert!(result.stagehand_dir.join("logs").is_dir());
        assert!(result.stagehand_dir.join("stagehand.toml").exists());
        assert!(result.stagehand_dir.join("plan.json").exists());
        assert!(is_initialized(dir.path()));
    }

    #[test]
    fn test_init_project_existing_keeps_files() {
        let dir = tempdir().unwrap();
        let stagehand_dir = dir.path().join(STAGEHAND_DIR);
        std::fs::create_dir_all(&stagehand_dir).unwrap();
        std::fs::write(stagehand_dir.join("stagehand.toml"), "[scheduler]\nmax_parallel = 9\n")
            .unwrap();

        let result = init_project(dir.path()).unwrap();
        assert!(!result.created);

        let content = std::fs::read_to_string(stagehand_dir.join("stagehand.toml")).unwrap();
        assert!(content.contains("max_parallel = 9"));
        assert!(has_plan(dir.path()));
    }

    #[test]
    fn test_sample_plan_is_valid() {
        let plan = sample_plan();
        plan.validate().unwrap();
        assert_eq!(plan.phases.len(), 2);
        assert_eq!(plan.get_unit("cli").unwrap().phase, "build");
    }

    #[test]
    fn test_sample_config_has_default_worker() {
        let dir = tempdir().unwrap();
        init_project(dir.path()).unwrap();
        let toml = StagehandToml::load_or_default(&get_stagehand_dir(dir.path())).unwrap();
        assert_eq!(toml.workers[DEFAULT_WORKER].command, "stagehand-worker");
        assert!(toml.validate().is_empty());
    }

    #[test]
    fn test_has_plan_false_when_missing_or_invalid() {
        let dir = tempdir().unwrap();
        assert!(!has_plan(dir.path()));

        let stagehand_dir = dir.path().join(STAGEHAND_DIR);
        std::fs::create_dir_all(&stagehand_dir).unwrap();
        std::fs::write(stagehand_dir.join("plan.json"), "not json").unwrap();
        assert!(!has_plan(dir.path()));
    }
}
