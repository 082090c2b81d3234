//! Result types for wave execution.

use crate::errors::ErrorKind;
use crate::unit::{ArtifactRef, UnitStatus};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Outcome of one unit within a wave pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitResult {
    pub unit: String,
    /// Status the unit ended the pass in (`Verified` or `Failed`)
    pub status: UnitStatus,
    /// Dispatches used this pass
    pub attempts: u32,
    #[serde(default)]
    pub artifacts: Vec<ArtifactRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorKind>,
    #[serde(default)]
    pub findings: Vec<String>,
    #[serde(with = "duration_serde")]
    pub duration: Duration,
}

impl UnitResult {
    pub fn verified(unit: &str, attempts: u32, artifacts: Vec<ArtifactRef>, duration: Duration) -> Self {
        Self {
            unit: unit.to_string(),
            status: UnitStatus::Verified,
            attempts,
            artifacts,
            error: None,
            findings: Vec::new(),
            duration,
        }
    }

    pub fn failed(
        unit: &str,
        attempts: u32,
        error: ErrorKind,
        findings: Vec<String>,
        duration: Duration,
    ) -> Self {
        Self {
            unit: unit.to_string(),
            status: UnitStatus::Failed,
            attempts,
            artifacts: Vec::new(),
            error: Some(error),
            findings,
            duration,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == UnitStatus::Verified
    }
}

/// Summary of one wave.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WaveSummary {
    pub phase: String,
    pub index: usize,
    pub verified: usize,
    pub failed: usize,
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    #[serde(default)]
    pub results: Vec<UnitResult>,
}

impl WaveSummary {
    pub fn new(phase: &str, index: usize) -> Self {
        Self {
            phase: phase.to_string(),
            index,
            ..Default::default()
        }
    }

    pub fn add_result(&mut self, result: UnitResult) {
        if result.is_success() {
            self.verified += 1;
        } else {
            self.failed += 1;
        }
        self.results.push(result);
    }

    pub fn all_success(&self) -> bool {
        self.failed == 0
    }

    pub fn failures(&self) -> impl Iterator<Item = &UnitResult> {
        self.results.iter().filter(|r| !r.is_success())
    }
}

/// Tracks execution timing.
pub struct ExecutionTimer {
    start: Instant,
}

impl ExecutionTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

/// Serde helpers for Duration serialization.
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
