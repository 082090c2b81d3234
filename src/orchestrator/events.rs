//! Events emitted while the engine runs.

use serde::{Deserialize, Serialize};

use crate::errors::ErrorKind;
use crate::orchestrator::worker::WorkerStatus;
use crate::unit::ArtifactRef;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    /// Recovery finished and the run is about to walk the phases.
    Resumed {
        interrupted: Vec<String>,
        escalations_requeued: usize,
    },
    PhaseStarted {
        phase: String,
    },
    WaveStarted {
        phase: String,
        wave: usize,
        units: Vec<String>,
    },
    UnitDispatched {
        unit: String,
        wave: usize,
        attempt: u32,
    },
    /// The unit holds its leases and its worker is running.
    UnitStarted {
        unit: String,
    },
    /// The worker returned a response.
    UnitCompleted {
        unit: String,
        status: WorkerStatus,
    },
    UnitVerified {
        unit: String,
        artifacts: Vec<ArtifactRef>,
    },
    CorrectionsRequested {
        unit: String,
        attempt: u32,
        findings: Vec<String>,
    },
    /// Stale guidance; the unit is redispatched once the domain settles.
    GuidanceRefetch {
        unit: String,
        domain: String,
        dispatched: u64,
        current: u64,
    },
    /// The unit was interrupted and requeued within the wave.
    UnitInterrupted {
        unit: String,
        error: ErrorKind,
    },
    UnitFailed {
        unit: String,
        error: ErrorKind,
        findings: Vec<String>,
    },
    GuidanceUpdated {
        domain: String,
        version: u64,
        /// In-flight units that pinned an older version
        affected: Vec<String>,
    },
    WaveCompleted {
        phase: String,
        wave: usize,
        verified: usize,
        failed: usize,
    },
    PhaseAwaitingApproval {
        phase: String,
    },
    PhaseApproved {
        phase: String,
    },
    PhaseRejected {
        phase: String,
        comments: String,
    },
    PhaseBlocked {
        phase: String,
        failed_units: Vec<String>,
    },
}

impl EngineEvent {
    /// Unit the event is about, if any.
    pub fn unit(&self) -> Option<&str> {
        match self {
            Self::UnitDispatched { unit, .. }
            | Self::UnitStarted { unit }
            | Self::UnitCompleted { unit, .. }
            | Self::UnitVerified { unit, .. }
            | Self::CorrectionsRequested { unit, .. }
            | Self::GuidanceRefetch { unit, .. }
            | Self::UnitInterrupted { unit, .. }
            | Self::UnitFailed { unit, .. } => Some(unit),
            _ => None,
        }
    }
}
