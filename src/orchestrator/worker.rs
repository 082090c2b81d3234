//! Worker invocation.
//!
//! Workers are opaque executors. The engine hands them a `TaskRequest` and
//! gets a `TaskResponse` back; what happens in between is the worker's
//! business. `ProcessWorker` runs an external command per role, writing the
//! request as JSON on stdin and reading the response from the last JSON line
//! on stdout.

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, trace, warn};

use crate::unit::{ArtifactRef, WorkerRole};
use crate::verification::ArtifactManifest;

/// Everything a worker is told about the unit it runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskRequest {
    pub unit: String,
    pub domain: String,
    pub role: WorkerRole,
    /// 1-based dispatch attempt
    pub attempt: u32,
    /// Guidance versions in effect at dispatch
    pub guidance: BTreeMap<String, u64>,
    /// Artifacts produced by the unit's dependencies
    pub dependency_artifacts: Vec<ArtifactRef>,
    pub deadline: DateTime<Utc>,
    /// Findings from the previous attempt, if it needed corrections
    #[serde(default)]
    pub prior_findings: Vec<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Success,
    CorrectionsNeeded,
    Failure,
}

/// A situation the worker hit that its guidance does not cover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationDraft {
    pub domain: String,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResponse {
    pub status: WorkerStatus,
    #[serde(default)]
    pub artifacts: Vec<ArtifactRef>,
    #[serde(default)]
    pub manifest: ArtifactManifest,
    #[serde(default)]
    pub findings: Vec<String>,
    /// Escalations raised while working, submitted on the worker's behalf
    #[serde(default)]
    pub escalations: Vec<EscalationDraft>,
}

impl TaskResponse {
    pub fn success(artifacts: Vec<ArtifactRef>, manifest: ArtifactManifest) -> Self {
        Self {
            status: WorkerStatus::Success,
            artifacts,
            manifest,
            findings: Vec::new(),
            escalations: Vec::new(),
        }
    }

    pub fn with_escalation(mut self, domain: &str, description: &str) -> Self {
        self.escalations.push(EscalationDraft {
            domain: domain.to_string(),
            description: description.to_string(),
        });
        self
    }

    pub fn corrections(findings: Vec<String>) -> Self {
        Self {
            status: WorkerStatus::CorrectionsNeeded,
            artifacts: Vec::new(),
            manifest: ArtifactManifest::default(),
            findings,
            escalations: Vec::new(),
        }
    }

    pub fn failure(findings: Vec<String>) -> Self {
        Self {
            status: WorkerStatus::Failure,
            artifacts: Vec::new(),
            manifest: ArtifactManifest::default(),
            findings,
            escalations: Vec::new(),
        }
    }
}

/// A worker implementation for one or more roles.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn run(&self, request: TaskRequest) -> Result<TaskResponse>;
}

/// Spawns a configured command for every task.
#[derive(Debug, Clone)]
pub struct ProcessWorker {
    command: String,
    args: Vec<String>,
    working_dir: PathBuf,
}

impl ProcessWorker {
    pub fn new(command: &str, args: Vec<String>, working_dir: PathBuf) -> Self {
        Self {
            command: command.to_string(),
            args,
            working_dir,
        }
    }
}

#[async_trait]
impl Worker for ProcessWorker {
    async fn run(&self, request: TaskRequest) -> Result<TaskResponse> {
        let payload =
            serde_json::to_string(&request).context("Failed to serialize task request")?;

        debug!(unit = %request.unit, command = %self.command, attempt = request.attempt, "spawning worker");

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .env("STAGEHAND_UNIT", &request.unit)
            .env("STAGEHAND_ROLE", request.role.as_str())
            .env("STAGEHAND_ATTEMPT", request.attempt.to_string())
            // aborting the dispatch drops the child and kills it
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn worker command: {}", self.command))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(payload.as_bytes())
                .await
                .context("Failed to write task request to worker stdin")?;
            stdin.shutdown().await.context("Failed to close worker stdin")?;
        }

        let stdout = child.stdout.take().context("Failed to get worker stdout")?;
        let mut reader = BufReader::new(stdout).lines();
        let mut response: Option<TaskResponse> = None;

        while let Some(line) = reader.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<TaskResponse>(line) {
                Ok(parsed) => response = Some(parsed),
                Err(_) => trace!(unit = %request.unit, line, "worker output"),
            }
        }

        let status = child.wait().await.context("Failed to wait for worker")?;
        match response {
            Some(r) => {
                if !status.success() {
                    warn!(unit = %request.unit, code = ?status.code(), "worker exited non-zero after responding");
                }
                Ok(r)
            }
            None => bail!(
                "worker for unit {} exited ({}) without a JSON response",
                request.unit,
                status.code().map_or("signal".to_string(), |c| c.to_string())
            ),
        }
    }
}

/// Workers keyed by role.
#[derive(Clone, Default)]
pub struct WorkerPool {
    workers: HashMap<WorkerRole, Arc<dyn Worker>>,
    fallback: Option<Arc<dyn Worker>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut roles: Vec<&str> = self.workers.keys().map(|r| r.as_str()).collect();
        roles.sort();
        f.debug_struct("WorkerPool")
            .field("roles", &roles)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl WorkerPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_worker(mut self, role: WorkerRole, worker: Arc<dyn Worker>) -> Self {
        self.workers.insert(role, worker);
        self
    }

    /// Worker used for any role without a dedicated one.
    pub fn with_fallback(mut self, worker: Arc<dyn Worker>) -> Self {
        self.fallback = Some(worker);
        self
    }

    pub fn get(&self, role: WorkerRole) -> Option<Arc<dyn Worker>> {
        self.workers
            .get(&role)
            .or(self.fallback.as_ref())
            .cloned()
    }

    pub fn has(&self, role: WorkerRole) -> bool {
        self.get(role).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn request() -> TaskRequest {
        TaskRequest {
            unit: "A".into(),
            domain: "core".into(),
            role: WorkerRole::Coder,
            attempt: 1,
            guidance: BTreeMap::from([("core".to_string(), 1)]),
            dependency_artifacts: vec![],
            deadline: Utc::now(),
            prior_findings: vec![],
            scopes: vec!["src".into()],
        }
    }

    struct Echo;

    #[async_trait]
    impl Worker for Echo {
        async fn run(&self, request: TaskRequest) -> Result<TaskResponse> {
            Ok(TaskResponse::success(
                vec![format!("{}.out", request.unit)],
                ArtifactManifest::default(),
            ))
        }
    }

    #[tokio::test]
    async fn test_pool_fallback() {
        let pool = WorkerPool::new().with_fallback(Arc::new(Echo));
        assert!(pool.has(WorkerRole::Scout));
        let resp = pool
            .get(WorkerRole::Coder)
            .unwrap()
            .run(request())
            .await
            .unwrap();
        assert_eq!(resp.artifacts, vec!["A.out"]);
        assert!(!WorkerPool::new().has(WorkerRole::Coder));
    }

    #[test]
    fn test_response_defaults() {
        let resp: TaskResponse = serde_json::from_str(r#"{"status":"corrections_needed"}"#).unwrap();
        assert_eq!(resp.status, WorkerStatus::CorrectionsNeeded);
        assert!(resp.artifacts.is_empty());
        assert!(resp.manifest.symbols.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_worker_reads_last_json_line() {
        let dir = tempfile::tempdir().unwrap();
        let script = r#"cat > /dev/null; echo "working..."; echo '{"status":"failure"}'; echo '{"status":"success","artifacts":["out.txt"]}'"#;
        let worker = ProcessWorker::new(
            "sh",
            vec!["-c".into(), script.into()],
            dir.path().to_path_buf(),
        );
        let resp = tokio::time::timeout(Duration::from_secs(10), worker.run(request()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resp.status, WorkerStatus::Success);
        assert_eq!(resp.artifacts, vec!["out.txt"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_process_worker_without_response_errors() {
        let dir = tempfile::tempdir().unwrap();
        let worker = ProcessWorker::new(
            "sh",
            vec!["-c".into(), "cat > /dev/null; echo nothing".into()],
            dir.path().to_path_buf(),
        );
        let err = worker.run(request()).await.unwrap_err();
        assert!(err.to_string().contains("without a JSON response"));
    }
}
