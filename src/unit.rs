//! Work unit and pipeline plan definitions.
//!
//! This module provides:
//! - `WorkUnit`, the schedulable piece of work, and its `UnitStatus` lifecycle
//! - `WorkerRole`, the tagged variant describing which kind of worker runs a unit
//! - `PlanFile`, the `.stagehand/plan.json` format of ordered phases and their units

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::Path;

use crate::errors::PlanError;

/// Reference to an artifact produced by a worker (path, commit, URI, ...).
pub type ArtifactRef = String;

/// Lifecycle status of a work unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitStatus {
    #[default]
    Pending,
    Ready,
    Dispatched,
    InProgress,
    Verifying,
    CorrectionsRequested,
    Verified,
    Interrupted,
    Failed,
}

impl UnitStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Dispatched => "dispatched",
            Self::InProgress => "in_progress",
            Self::Verifying => "verifying",
            Self::CorrectionsRequested => "corrections_requested",
            Self::Verified => "verified",
            Self::Interrupted => "interrupted",
            Self::Failed => "failed",
        }
    }

    /// Terminal for the current pipeline pass.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Verified | Self::Failed)
    }

    /// A worker may currently be executing this unit.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Dispatched | Self::InProgress | Self::Verifying)
    }

    /// Whether a unit in this status may be admitted to a wave.
    pub fn is_admissible(&self) -> bool {
        matches!(
            self,
            Self::Pending | Self::Ready | Self::Interrupted | Self::CorrectionsRequested
        )
    }

    /// Check the unit lifecycle transition table.
    pub fn can_transition_to(&self, next: UnitStatus) -> bool {
        use UnitStatus::*;
        match self {
            Pending => matches!(next, Ready | Failed),
            Ready => matches!(next, Dispatched | Failed),
            Dispatched => matches!(next, InProgress | Interrupted | Failed),
            InProgress => matches!(next, Verifying | CorrectionsRequested | Interrupted | Failed),
            Verifying => matches!(
                next,
                Verified | CorrectionsRequested | Ready | Interrupted | Failed
            ),
            CorrectionsRequested => matches!(next, Dispatched | Interrupted | Failed),
            Interrupted => matches!(next, Ready | Failed),
            Failed => matches!(next, Pending),
            Verified => false,
        }
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for UnitStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "pending" => Self::Pending,
            "ready" => Self::Ready,
            "dispatched" => Self::Dispatched,
            "in_progress" => Self::InProgress,
            "verifying" => Self::Verifying,
            "corrections_requested" => Self::CorrectionsRequested,
            "verified" => Self::Verified,
            "interrupted" => Self::Interrupted,
            "failed" => Self::Failed,
            other => anyhow::bail!("Invalid unit status '{}'", other),
        })
    }
}

/// Kind of worker a unit is assigned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerRole {
    /// Read-only investigation, reports findings
    Scout,
    /// Produces artifacts inside its declared scopes
    #[default]
    Coder,
    /// Read-only checking of other units' artifacts
    Verifier,
    /// Issues binding rulings for a domain
    DomainAuthority,
}

/// The fixed capability set of a worker role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleCapability {
    /// May touch paths inside its resource scopes
    pub may_write: bool,
    /// Must return at least one artifact reference on success
    pub requires_artifact: bool,
}

impl WorkerRole {
    pub fn capability(&self) -> RoleCapability {
        match self {
            Self::Scout | Self::Verifier => RoleCapability {
                may_write: false,
                requires_artifact: false,
            },
            Self::Coder => RoleCapability {
                may_write: true,
                requires_artifact: true,
            },
            Self::DomainAuthority => RoleCapability {
                may_write: false,
                requires_artifact: true,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scout => "scout",
            Self::Coder => "coder",
            Self::Verifier => "verifier",
            Self::DomainAuthority => "domain_authority",
        }
    }

    pub fn all() -> [WorkerRole; 4] {
        [
            Self::Scout,
            Self::Coder,
            Self::Verifier,
            Self::DomainAuthority,
        ]
    }
}

impl fmt::Display for WorkerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for WorkerRole {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "scout" => Ok(Self::Scout),
            "coder" => Ok(Self::Coder),
            "verifier" => Ok(Self::Verifier),
            "domain_authority" => Ok(Self::DomainAuthority),
            _ => anyhow::bail!(
                "Invalid worker role '{}'. Valid values: scout, coder, verifier, domain_authority",
                s
            ),
        }
    }
}

/// What a unit promises to deliver, checked by the verification gate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitSpec {
    /// Symbols the artifact must export
    #[serde(default)]
    pub interface: Vec<String>,
    /// Side effects the unit is allowed to perform (e.g. "fs_write", "network")
    #[serde(default)]
    pub side_effects: Vec<String>,
    /// Error kinds the artifact is allowed to raise
    #[serde(default)]
    pub error_kinds: Vec<String>,
    /// Guidance domains consulted besides the unit's own domain
    #[serde(default)]
    pub consults: Vec<String>,
}

/// A single schedulable piece of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    pub id: String,
    /// Domain tag, also the guidance domain the unit works under
    pub domain: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default)]
    pub role: WorkerRole,
    /// Resource scopes the unit writes to
    #[serde(default)]
    pub scopes: Vec<String>,
    #[serde(default)]
    pub spec: UnitSpec,
    /// Owning phase, filled in from the enclosing phase when loading a plan
    #[serde(default, skip_serializing)]
    pub phase: String,
    #[serde(skip)]
    pub status: UnitStatus,
    #[serde(skip)]
    pub artifacts: Vec<ArtifactRef>,
    #[serde(skip)]
    pub retry_count: u32,
}

impl WorkUnit {
    pub fn new(id: &str, domain: &str, depends_on: Vec<String>) -> Self {
        Self {
            id: id.to_string(),
            domain: domain.to_string(),
            depends_on,
            role: WorkerRole::default(),
            scopes: Vec::new(),
            spec: UnitSpec::default(),
            phase: String::new(),
            status: UnitStatus::Pending,
            artifacts: Vec::new(),
            retry_count: 0,
        }
    }

    pub fn with_role(mut self, role: WorkerRole) -> Self {
        self.role = role;
        self
    }

    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    pub fn with_spec(mut self, spec: UnitSpec) -> Self {
        self.spec = spec;
        self
    }

    pub fn in_phase(mut self, phase: &str) -> Self {
        self.phase = phase.to_string();
        self
    }

    /// Every guidance domain whose version is pinned at dispatch.
    pub fn guidance_domains(&self) -> Vec<String> {
        let mut domains = vec![self.domain.clone()];
        for d in &self.spec.consults {
            if !domains.contains(d) {
                domains.push(d.clone());
            }
        }
        domains
    }
}

/// An explicit, human-closed step of a phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChecklistItem {
    pub id: String,
    pub description: String,
}

/// One ordered stage of the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseDef {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub checklist: Vec<ChecklistItem>,
    #[serde(default)]
    pub units: Vec<WorkUnit>,
}

impl PhaseDef {
    pub fn new(id: &str, name: &str) -> Self {
        Self {
            id: id.to_string(),
            name: name.to_string(),
            checklist: Vec::new(),
            units: Vec::new(),
        }
    }

    pub fn with_units(mut self, units: Vec<WorkUnit>) -> Self {
        self.units = units;
        self
    }

    pub fn with_checklist(mut self, items: Vec<ChecklistItem>) -> Self {
        self.checklist = items;
        self
    }
}

/// The full `plan.json` file format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanFile {
    /// Timestamp when the plan was written
    pub generated_at: DateTime<Utc>,
    pub phases: Vec<PhaseDef>,
}

impl PlanFile {
    pub fn new(phases: Vec<PhaseDef>) -> Self {
        let mut plan = Self {
            generated_at: Utc::now(),
            phases,
        };
        plan.assign_phases();
        plan
    }

    /// Load and validate a plan from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan file: {}", path.display()))?;

        let mut plan: PlanFile = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse plan JSON: {}", path.display()))?;
        plan.assign_phases();
        plan.validate()
            .with_context(|| format!("Invalid plan: {}", path.display()))?;

        Ok(plan)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize plan to JSON")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write plan file: {}", path.display()))?;
        Ok(())
    }

    fn assign_phases(&mut self) {
        for phase in &mut self.phases {
            for unit in &mut phase.units {
                unit.phase = phase.id.clone();
            }
        }
    }

    /// Structural validation: unique ids, known dependencies, no forward
    /// dependencies across phases, non-empty scopes. Cycles are left to the
    /// dependency resolver.
    pub fn validate(&self) -> Result<(), PlanError> {
        let mut phase_ids = HashSet::new();
        let mut unit_phase: HashMap<&str, usize> = HashMap::new();

        for (phase_idx, phase) in self.phases.iter().enumerate() {
            if !phase_ids.insert(phase.id.as_str()) {
                return Err(PlanError::DuplicatePhase(phase.id.clone()));
            }
            for unit in &phase.units {
                if unit_phase.insert(unit.id.as_str(), phase_idx).is_some() {
                    return Err(PlanError::DuplicateUnit(unit.id.clone()));
                }
                if unit.scopes.iter().any(|s| s.trim_matches('/').is_empty()) {
                    return Err(PlanError::EmptyScope(unit.id.clone()));
                }
            }
        }

        for (phase_idx, phase) in self.phases.iter().enumerate() {
            for unit in &phase.units {
                for dep in &unit.depends_on {
                    let dep_phase = *unit_phase.get(dep.as_str()).ok_or_else(|| {
                        PlanError::UnknownDependency {
                            unit: unit.id.clone(),
                            dependency: dep.clone(),
                        }
                    })?;
                    if dep_phase > phase_idx {
                        return Err(PlanError::ForwardPhaseDependency {
                            unit: unit.id.clone(),
                            phase: phase.id.clone(),
                            dependency: dep.clone(),
                            dependency_phase: self.phases[dep_phase].id.clone(),
                        });
                    }
                }
            }
        }

        Ok(())
    }

    pub fn get_phase(&self, id: &str) -> Option<&PhaseDef> {
        self.phases.iter().find(|p| p.id == id)
    }

    pub fn get_unit(&self, id: &str) -> Option<&WorkUnit> {
        self.units().find(|u| u.id == id)
    }

    /// All units in plan order.
    pub fn units(&self) -> impl Iterator<Item = &WorkUnit> {
        self.phases.iter().flat_map(|p| p.units.iter())
    }

    /// Every guidance domain any unit works under or consults.
    pub fn domains(&self) -> Vec<String> {
        let mut domains: Vec<String> = Vec::new();
        for unit in self.units() {
            for d in unit.guidance_domains() {
                if !domains.contains(&d) {
                    domains.push(d);
                }
            }
        }
        domains
    }

    /// SHA-256 over the phase/unit structure, ignoring `generated_at`.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        let body = serde_json::to_vec(&self.phases).unwrap_or_default();
        hasher.update(&body);
        hex::encode(hasher.finalize())
    }
}
