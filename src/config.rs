use anyhow::{Context, Result};
use std::path::PathBuf;

use crate::init::STAGEHAND_DIR;
use crate::stagehand_config::StagehandConfig;

/// Runtime configuration for stagehand.
///
/// Bridges the unified `StagehandConfig` with the paths the engine and the
/// CLI need.
#[derive(Debug, Clone)]
pub struct Config {
    pub project_dir: PathBuf,
    pub stagehand_dir: PathBuf,
    pub plan_file: PathBuf,
    pub ledger_file: PathBuf,
    pub config_file: PathBuf,
    pub log_dir: PathBuf,
    pub verbose: bool,
    settings: StagehandConfig,
}

impl Config {
    pub fn new(project_dir: PathBuf, verbose: bool, plan_file: Option<PathBuf>) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let settings = StagehandConfig::new(project_dir.clone())?;
        Self::from_settings(project_dir, verbose, plan_file, settings)
    }

    /// Like `new`, but with CLI overrides for scheduler and verification limits.
    pub fn with_overrides(
        project_dir: PathBuf,
        verbose: bool,
        plan_file: Option<PathBuf>,
        max_parallel: Option<usize>,
        unit_timeout_secs: Option<u64>,
        max_corrections: Option<u32>,
    ) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let settings = StagehandConfig::with_cli_args(
            project_dir.clone(),
            max_parallel,
            unit_timeout_secs,
            max_corrections,
        )?;
        Self::from_settings(project_dir, verbose, plan_file, settings)
    }

    fn from_settings(
        project_dir: PathBuf,
        verbose: bool,
        plan_file: Option<PathBuf>,
        settings: StagehandConfig,
    ) -> Result<Self> {
        let stagehand_dir = project_dir.join(STAGEHAND_DIR);
        let plan_file = match plan_file {
            Some(path) => path
                .canonicalize()
                .context("Failed to resolve plan file path")?,
            None => stagehand_dir.join("plan.json"),
        };

        Ok(Self {
            ledger_file: stagehand_dir.join("ledger.jsonl"),
            config_file: stagehand_dir.join("stagehand.toml"),
            log_dir: stagehand_dir.join("logs"),
            plan_file,
            stagehand_dir,
            project_dir,
            verbose,
            settings,
        })
    }

    pub fn settings(&self) -> &StagehandConfig {
        &self.settings
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(&self.stagehand_dir)
            .context("Failed to create .stagehand directory")?;
        std::fs::create_dir_all(&self.log_dir).context("Failed to create log directory")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_config_paths_in_stagehand_directory() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf(), false, None).unwrap();
        let root = dir.path().canonicalize().unwrap().join(".stagehand");
        assert_eq!(config.plan_file, root.join("plan.json"));
        assert_eq!(config.ledger_file, root.join("ledger.jsonl"));
        assert_eq!(config.config_file, root.join("stagehand.toml"));
        assert_eq!(config.log_dir, root.join("logs"));
    }

    #[test]
    fn test_config_explicit_plan_file() {
        let dir = tempdir().unwrap();
        let plan = dir.path().join("my-plan.json");
        fs::write(&plan, "{}").unwrap();
        let config = Config::new(dir.path().to_path_buf(), true, Some(plan.clone())).unwrap();
        assert!(config.verbose);
        assert_eq!(config.plan_file, plan.canonicalize().unwrap());
    }

    #[test]
    fn test_config_missing_plan_file_errors() {
        let dir = tempdir().unwrap();
        let result = Config::new(
            dir.path().to_path_buf(),
            false,
            Some(dir.path().join("nope.json")),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_ensure_directories() {
        let dir = tempdir().unwrap();
        let config = Config::new(dir.path().to_path_buf(), false, None).unwrap();
        config.ensure_directories().unwrap();
        assert!(config.stagehand_dir.exists());
        assert!(config.log_dir.exists());
    }

    #[test]
    fn test_overrides_reach_dag_config() {
        let dir = tempdir().unwrap();
        let config =
            Config::with_overrides(dir.path().to_path_buf(), false, None, Some(7), Some(9), Some(0))
                .unwrap();
        let dag = config.settings().dag_config();
        assert_eq!(dag.max_parallel, 7);
        assert_eq!(dag.unit_timeout_secs, 9);
        assert_eq!(dag.max_corrections, 0);
    }
}
