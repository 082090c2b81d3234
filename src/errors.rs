//! Typed error hierarchy for the stagehand engine.
//!
//! The orchestration taxonomy lives in `OrchestratorError`; the three
//! failure shapes other subsystems need to hand around on their own
//! (`DependencyCycleError`, `ResourceConflictError`, `GuidanceVersionMismatch`)
//! are standalone structs that convert into it. Storage, gate and plan
//! failures each get their own enum:
//! - `LedgerError`: append/load failures of the durable log
//! - `GateError`: illegal phase gate transitions
//! - `PlanError`: malformed or unsafe pipeline definitions

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Classification recorded in the ledger whenever a unit fails or is interrupted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DependencyCycle,
    ResourceConflict,
    GuidanceVersionMismatch,
    VerificationFailure,
    Timeout,
    HumanRejection,
    WorkerFailure,
    Aborted,
}

impl ErrorKind {
    /// Whether the unit's own correction loop may absorb this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::GuidanceVersionMismatch | Self::VerificationFailure | Self::Timeout
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::DependencyCycle => "dependency_cycle",
            Self::ResourceConflict => "resource_conflict",
            Self::GuidanceVersionMismatch => "guidance_version_mismatch",
            Self::VerificationFailure => "verification_failure",
            Self::Timeout => "timeout",
            Self::HumanRejection => "human_rejection",
            Self::WorkerFailure => "worker_failure",
            Self::Aborted => "aborted",
        };
        write!(f, "{}", s)
    }
}

/// The dependency graph contains at least one cycle.
///
/// `units` is the sorted union of every non-trivial strongly connected
/// component; units that merely depend on a cycle are not named.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("dependency cycle detected among units {units:?}")]
pub struct DependencyCycleError {
    pub units: Vec<String>,
    pub cycles: Vec<Vec<String>>,
}

/// Two holders would own overlapping resource scopes at the same instant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("resource conflict on scope '{scope}': requested by '{holder}', held by '{conflicting_holder}'")]
pub struct ResourceConflictError {
    pub scope: String,
    pub holder: String,
    pub conflicting_holder: String,
}

/// A unit worked against guidance that has since been superseded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("guidance for domain '{domain}' moved from v{dispatched} to v{current}")]
pub struct GuidanceVersionMismatch {
    pub domain: String,
    pub dispatched: u64,
    pub current: u64,
}

/// Errors from the durable ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Failed to access ledger at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Ledger at {path} is locked by another engine")]
    Locked { path: PathBuf },

    #[error("Corrupt ledger entry at line {line}: {message}")]
    Corrupt { line: usize, message: String },

    #[error("Ledger sequence gap: expected {expected}, found {found}")]
    SequenceGap { expected: u64, found: u64 },

    #[error("Failed to serialize ledger entry: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("Ledger lock poisoned")]
    LockPoisoned,
}

/// Errors from the phase gate controller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GateError {
    #[error("Unknown phase '{0}'")]
    UnknownPhase(String),

    #[error("Phase '{phase}' cannot move from {from} to {to}")]
    InvalidTransition {
        phase: String,
        from: String,
        to: String,
    },

    #[error("Phase '{phase}' cannot start before phase '{previous}' is approved")]
    OutOfOrder { phase: String, previous: String },

    #[error("Phase '{phase}' has open checklist item '{item}'")]
    ChecklistOpen { phase: String, item: String },

    #[error("Phase '{phase}' has no checklist item '{item}'")]
    UnknownChecklistItem { phase: String, item: String },

    #[error("Phase '{phase}' still has unverified units {units:?}")]
    UnitsOutstanding { phase: String, units: Vec<String> },

    #[error("Only the most recently approved phase can be reopened, '{phase}' is followed by '{later}'")]
    ReopenNotLatest { phase: String, later: String },
}

/// Errors from loading or extending the pipeline plan.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlanError {
    #[error("Duplicate unit id: {0}")]
    DuplicateUnit(String),

    #[error("Duplicate phase id: {0}")]
    DuplicatePhase(String),

    #[error("Unknown dependency '{dependency}' in unit '{unit}': no unit with that id exists")]
    UnknownDependency { unit: String, dependency: String },

    #[error("Unit '{unit}' in phase '{phase}' depends on '{dependency}' from later phase '{dependency_phase}'")]
    ForwardPhaseDependency {
        unit: String,
        phase: String,
        dependency: String,
        dependency_phase: String,
    },

    #[error("Unit '{unit}' cannot depend on '{dependency}' which is already {status}")]
    DependsOnDispatched {
        unit: String,
        dependency: String,
        status: String,
    },

    #[error("Unit '{0}' declares an empty resource scope")]
    EmptyScope(String),
}

/// Errors from the orchestration engine.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    DependencyCycle(#[from] DependencyCycleError),

    #[error(transparent)]
    ResourceConflict(#[from] ResourceConflictError),

    #[error(transparent)]
    GuidanceVersionMismatch(#[from] GuidanceVersionMismatch),

    #[error("Unit {unit} failed verification after {attempts} attempts")]
    VerificationFailure {
        unit: String,
        attempts: u32,
        findings: Vec<String>,
    },

    #[error("Unit {unit} exceeded its {timeout_secs}s deadline")]
    Timeout { unit: String, timeout_secs: u64 },

    #[error("Phase {phase} was rejected: {comments}")]
    HumanRejection { phase: String, comments: String },

    #[error("Unknown unit '{0}'")]
    UnknownUnit(String),

    #[error("Unit {unit} cannot move from {from} to {to}")]
    InvalidTransition {
        unit: String,
        from: String,
        to: String,
    },

    #[error("No worker registered for role {0}")]
    NoWorker(String),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Gate(#[from] GateError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl OrchestratorError {
    /// The ledger classification for this error, if it belongs to the taxonomy.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::DependencyCycle(_) => Some(ErrorKind::DependencyCycle),
            Self::ResourceConflict(_) => Some(ErrorKind::ResourceConflict),
            Self::GuidanceVersionMismatch(_) => Some(ErrorKind::GuidanceVersionMismatch),
            Self::VerificationFailure { .. } => Some(ErrorKind::VerificationFailure),
            Self::Timeout { .. } => Some(ErrorKind::Timeout),
            Self::HumanRejection { .. } => Some(ErrorKind::HumanRejection),
            _ => None,
        }
    }
}
