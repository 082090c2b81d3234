//! Ledger record types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::errors::ErrorKind;
use crate::unit::{ArtifactRef, UnitStatus};

/// Who performed a transition when it was not a work unit.
pub const ACTOR_ENGINE: &str = "engine";
pub const ACTOR_RECOVERY: &str = "recovery";
pub const ACTOR_HUMAN: &str = "human";
pub const ACTOR_ESCALATION: &str = "escalation-queue";

/// Status strings for entities that have no enum of their own.
pub mod status {
    pub const STARTED: &str = "started";
    pub const COMPLETED: &str = "completed";
    pub const HELD: &str = "held";
    pub const RELEASED: &str = "released";
    pub const SUBMITTED: &str = "submitted";
    pub const APPLIED: &str = "applied";
    pub const OPEN: &str = "open";
    pub const RESOLVED: &str = "resolved";
    pub const DONE: &str = "done";
}

/// Ledger id of a checklist item.
pub fn checklist_key(phase: &str, item: &str) -> String {
    format!("{}:{}", phase, item)
}

/// Ledger id of a wave.
pub fn wave_key(phase: &str, index: usize) -> String {
    format!("{}#{}", phase, index)
}

/// Guidance versions are stored as `v<n>`.
pub fn version_label(version: u64) -> String {
    format!("v{}", version)
}

pub fn parse_version_label(label: &str) -> Option<u64> {
    label.strip_prefix('v')?.parse().ok()
}

/// Entity type a ledger entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Session,
    Unit,
    Phase,
    Checklist,
    Wave,
    Lease,
    Escalation,
    Guidance,
    Blocker,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Session => "session",
            Self::Unit => "unit",
            Self::Phase => "phase",
            Self::Checklist => "checklist",
            Self::Wave => "wave",
            Self::Lease => "lease",
            Self::Escalation => "escalation",
            Self::Guidance => "guidance",
            Self::Blocker => "blocker",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for EntityKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "session" => Self::Session,
            "unit" => Self::Unit,
            "phase" => Self::Phase,
            "checklist" => Self::Checklist,
            "wave" => Self::Wave,
            "lease" => Self::Lease,
            "escalation" => Self::Escalation,
            "guidance" => Self::Guidance,
            "blocker" => Self::Blocker,
            other => anyhow::bail!("Unknown entity type '{}'", other),
        })
    }
}

/// Typed payload attached to an entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntryDetail {
    Session {
        plan_hash: String,
    },
    Dispatch {
        wave: usize,
        attempt: u32,
        guidance: BTreeMap<String, u64>,
        deadline: DateTime<Utc>,
    },
    Completion {
        artifacts: Vec<ArtifactRef>,
        #[serde(default)]
        findings: Vec<String>,
    },
    Failure {
        error: ErrorKind,
        #[serde(default)]
        findings: Vec<String>,
    },
    Wave {
        phase: String,
        index: usize,
        units: Vec<String>,
    },
    Lease {
        holder: String,
    },
    Escalation {
        position: u64,
        domain: String,
        description: String,
        raised_by: String,
    },
    Ruling {
        escalation: String,
        ruling: String,
    },
    Approval {
        approved: bool,
        comments: String,
    },
    Blocker {
        phase: String,
        error: ErrorKind,
        #[serde(default)]
        findings: Vec<String>,
    },
    Note {
        text: String,
    },
}

/// One immutable, sequenced ledger record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Gap-free sequence number starting at 1
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub entity: EntityKind,
    pub entity_id: String,
    #[serde(default)]
    pub old_status: Option<String>,
    pub new_status: String,
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<EntryDetail>,
}

/// A transition waiting to be appended; the ledger assigns `seq` and `timestamp`.
#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub entity: EntityKind,
    pub entity_id: String,
    pub old_status: Option<String>,
    pub new_status: String,
    pub actor: String,
    pub detail: Option<EntryDetail>,
}

impl Transition {
    pub fn new(entity: EntityKind, entity_id: &str, old: Option<&str>, new: &str) -> Self {
        Self {
            entity,
            entity_id: entity_id.to_string(),
            old_status: old.map(str::to_string),
            new_status: new.to_string(),
            actor: ACTOR_ENGINE.to_string(),
            detail: None,
        }
    }

    /// A work unit status change.
    pub fn unit(id: &str, from: Option<UnitStatus>, to: UnitStatus) -> Self {
        Self::new(EntityKind::Unit, id, from.map(|s| s.as_str()), to.as_str())
    }

    /// A guidance snapshot moving to a new version.
    pub fn guidance(domain: &str, from: Option<u64>, to: u64) -> Self {
        let from = from.map(version_label);
        Self::new(
            EntityKind::Guidance,
            domain,
            from.as_deref(),
            &version_label(to),
        )
    }

    /// A lease grant or release on one scope.
    pub fn lease(scope: &str, holder: &str, held: bool) -> Self {
        let (old, new) = if held {
            (None, status::HELD)
        } else {
            (Some(status::HELD), status::RELEASED)
        };
        Self::new(EntityKind::Lease, scope, old, new).with_detail(EntryDetail::Lease {
            holder: holder.to_string(),
        })
    }

    pub fn by(mut self, actor: &str) -> Self {
        self.actor = actor.to_string();
        self
    }

    pub fn with_detail(mut self, detail: EntryDetail) -> Self {
        self.detail = Some(detail);
        self
    }
}
