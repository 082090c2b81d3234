//! Unified configuration for stagehand.
//!
//! Reads `.stagehand/stagehand.toml` and layers environment overrides on top
//! (file → environment → CLI).
//!
//! # Configuration File Format
//!
//! ```toml
//! [scheduler]
//! max_parallel = 4
//! unit_timeout_secs = 1800
//!
//! [verification]
//! max_corrections = 2
//!
//! [workers.coder]
//! command = "my-agent"
//! args = ["--role", "coder"]
//!
//! [workers.default]
//! command = "my-agent"
//!
//! [logging]
//! level = "info"
//! json = false
//! file = true
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::dag::DagConfig;
use crate::orchestrator::{ProcessWorker, WorkerPool};
use crate::unit::WorkerRole;

pub const ENV_MAX_PARALLEL: &str = "STAGEHAND_MAX_PARALLEL";
pub const ENV_UNIT_TIMEOUT_SECS: &str = "STAGEHAND_UNIT_TIMEOUT_SECS";
pub const ENV_MAX_CORRECTIONS: &str = "STAGEHAND_MAX_CORRECTIONS";
pub const ENV_LOG: &str = "STAGEHAND_LOG";

/// Worker key used when no role-specific worker is configured.
pub const DEFAULT_WORKER: &str = "default";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSection {
    /// Units dispatched concurrently within one wave
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,
    /// Deadline for a single dispatch, lease wait included
    #[serde(default = "default_unit_timeout_secs")]
    pub unit_timeout_secs: u64,
}

fn default_max_parallel() -> usize {
    4
}

fn default_unit_timeout_secs() -> u64 {
    1800
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            unit_timeout_secs: default_unit_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationSection {
    /// Correction cycles allowed before a unit fails
    #[serde(default = "default_max_corrections")]
    pub max_corrections: u32,
}

fn default_max_corrections() -> u32 {
    2
}

impl Default for VerificationSection {
    fn default() -> Self {
        Self {
            max_corrections: default_max_corrections(),
        }
    }
}

/// An external worker process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerCommand {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Default filter directive when no env filter is set
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
    /// Also write a daily-rolling log file under `.stagehand/logs/`
    #[serde(default = "default_log_file")]
    pub file: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> bool {
    true
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            file: default_log_file(),
        }
    }
}

/// The `stagehand.toml` file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StagehandToml {
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub verification: VerificationSection,
    /// Keyed by role name (`scout`, `coder`, `verifier`, `domain_authority`)
    /// or `default`
    #[serde(default)]
    pub workers: BTreeMap<String, WorkerCommand>,
    #[serde(default)]
    pub logging: LoggingSection,
}

impl StagehandToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Invalid stagehand.toml")
    }

    /// Load from `<stagehand_dir>/stagehand.toml`, or defaults when the file is absent.
    pub fn load_or_default(stagehand_dir: &Path) -> Result<Self> {
        let path = stagehand_dir.join("stagehand.toml");
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `STAGEHAND_*` environment overrides. Unparsable values are
    /// ignored with a warning.
    pub fn apply_env(&mut self) {
        if let Some(v) = env_parse::<usize>(ENV_MAX_PARALLEL) {
            self.scheduler.max_parallel = v;
        }
        if let Some(v) = env_parse::<u64>(ENV_UNIT_TIMEOUT_SECS) {
            self.scheduler.unit_timeout_secs = v;
        }
        if let Some(v) = env_parse::<u32>(ENV_MAX_CORRECTIONS) {
            self.verification.max_corrections = v;
        }
    }

    pub fn worker_command(&self, role: WorkerRole) -> Option<&WorkerCommand> {
        self.workers
            .get(role.as_str())
            .or_else(|| self.workers.get(DEFAULT_WORKER))
            .filter(|w| !w.command.trim().is_empty())
    }

    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.scheduler.max_parallel == 0 {
            warnings.push(
                "scheduler.max_parallel is 0; waves will dispatch one unit at a time".to_string(),
            );
        }
        if self.scheduler.unit_timeout_secs == 0 {
            warnings.push(
                "scheduler.unit_timeout_secs is 0; every dispatch will time out".to_string(),
            );
        }
        for (key, worker) in &self.workers {
            if key != DEFAULT_WORKER && key.parse::<WorkerRole>().is_err() {
                warnings.push(format!("workers.{}: unknown worker role", key));
            }
            if worker.command.trim().is_empty() {
                warnings.push(format!("workers.{}: command is empty", key));
            }
        }
        if self.workers.is_empty() {
            warnings.push("no [workers] configured; `stagehand run` has nothing to dispatch to".to_string());
        }
        if tracing_subscriber::EnvFilter::try_new(&self.logging.level).is_err() {
            warnings.push(format!(
                "logging.level '{}' is not a valid filter directive",
                self.logging.level
            ));
        }

        warnings
    }

    pub fn dag_config(&self) -> DagConfig {
        DagConfig::default()
            .with_max_parallel(self.scheduler.max_parallel)
            .with_unit_timeout_secs(self.scheduler.unit_timeout_secs)
            .with_max_corrections(self.verification.max_corrections)
    }

    /// Build process workers for every configured role.
    pub fn worker_pool(&self, working_dir: &Path) -> WorkerPool {
        let mut pool = WorkerPool::new();
        for role in WorkerRole::all() {
            if let Some(worker) = self.workers.get(role.as_str())
                && !worker.command.trim().is_empty()
            {
                pool = pool.with_worker(
                    role,
                    Arc::new(ProcessWorker::new(
                        &worker.command,
                        worker.args.clone(),
                        working_dir.to_path_buf(),
                    )),
                );
            }
        }
        if let Some(worker) = self.workers.get(DEFAULT_WORKER)
            && !worker.command.trim().is_empty()
        {
            pool = pool.with_fallback(Arc::new(ProcessWorker::new(
                &worker.command,
                worker.args.clone(),
                working_dir.to_path_buf(),
            )));
        }
        pool
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}

/// Resolved configuration for one project.
#[derive(Debug, Clone)]
pub struct StagehandConfig {
    pub project_dir: PathBuf,
    pub toml: StagehandToml,
}

impl StagehandConfig {
    /// Load `.stagehand/stagehand.toml` under `project_dir`, then the
    /// project's `.env`, then `STAGEHAND_*` overrides.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let stagehand_dir = project_dir.join(crate::init::STAGEHAND_DIR);
        let mut toml = StagehandToml::load_or_default(&stagehand_dir)?;
        dotenvy::from_path(project_dir.join(".env")).ok();
        toml.apply_env();
        Ok(Self { project_dir, toml })
    }

    /// Apply CLI overrides on top of file and environment.
    pub fn with_cli_args(
        project_dir: PathBuf,
        max_parallel: Option<usize>,
        unit_timeout_secs: Option<u64>,
        max_corrections: Option<u32>,
    ) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        if let Some(v) = max_parallel {
            config.toml.scheduler.max_parallel = v;
        }
        if let Some(v) = unit_timeout_secs {
            config.toml.scheduler.unit_timeout_secs = v;
        }
        if let Some(v) = max_corrections {
            config.toml.verification.max_corrections = v;
        }
        Ok(config)
    }

    pub fn dag_config(&self) -> DagConfig {
        self.toml.dag_config()
    }

    pub fn worker_pool(&self) -> WorkerPool {
        self.toml.worker_pool(&self.project_dir)
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}
