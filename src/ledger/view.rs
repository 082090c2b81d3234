//! Current state as a fold over ledger entries.
//!
//! Nothing in the engine keeps authoritative state outside the ledger; every
//! component that needs to know "where are we" folds the entries into a
//! `LedgerView`. The fold also re-checks the unit transition table and the
//! gap-free guidance versioning, so a tampered or inconsistent ledger is
//! rejected as `Corrupt` instead of being resumed from.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use super::entry::{EntityKind, EntryDetail, LedgerEntry, checklist_key, parse_version_label, status};
use crate::errors::{ErrorKind, LedgerError};
use crate::gates::GateStatus;
use crate::unit::{ArtifactRef, UnitStatus};

/// Folded state of one work unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct UnitRecord {
    pub status: UnitStatus,
    /// Correction cycles consumed since the last requeue
    pub retry_count: u32,
    /// Number of dispatches since the last requeue
    pub attempts: u32,
    pub timeouts: u32,
    pub artifacts: Vec<ArtifactRef>,
    /// Guidance versions pinned by the latest dispatch
    pub guidance: BTreeMap<String, u64>,
    pub last_error: Option<ErrorKind>,
    pub findings: Vec<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WaveRecord {
    pub phase: String,
    pub index: usize,
    pub units: Vec<String>,
    pub completed: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EscalationRecord {
    pub id: String,
    pub position: u64,
    pub domain: String,
    pub description: String,
    pub raised_by: String,
    pub applied: bool,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GuidanceRecord {
    pub version: u64,
    /// Ruling text per applied version, oldest first
    pub rulings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlockerRecord {
    pub id: String,
    pub phase: String,
    pub error: ErrorKind,
    pub findings: Vec<String>,
    pub open: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionRecord {
    pub id: String,
    pub plan_hash: String,
    pub started_at: DateTime<Utc>,
}

/// Everything the ledger says about the current run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LedgerView {
    pub units: BTreeMap<String, UnitRecord>,
    /// Unit ids in creation order
    pub unit_order: Vec<String>,
    pub phases: BTreeMap<String, GateStatus>,
    pub checklist_done: BTreeSet<String>,
    pub waves: Vec<WaveRecord>,
    /// scope -> holder
    pub leases: BTreeMap<String, String>,
    pub guidance: BTreeMap<String, GuidanceRecord>,
    pub escalations: Vec<EscalationRecord>,
    pub blockers: Vec<BlockerRecord>,
    pub sessions: Vec<SessionRecord>,
    pub last_seq: u64,
}

fn corrupt(entry: &LedgerEntry, message: String) -> LedgerError {
    LedgerError::Corrupt {
        line: entry.seq as usize,
        message,
    }
}

impl LedgerView {
    pub fn fold(entries: &[LedgerEntry]) -> Result<Self, LedgerError> {
        let mut view = Self::default();
        for entry in entries {
            view.apply(entry)?;
        }
        Ok(view)
    }

    /// Apply one entry on top of the current view.
    pub fn apply(&mut self, entry: &LedgerEntry) -> Result<(), LedgerError> {
        match entry.entity {
            EntityKind::Session => self.apply_session(entry),
            EntityKind::Unit => self.apply_unit(entry)?,
            EntityKind::Phase => {
                let status: GateStatus = entry
                    .new_status
                    .parse()
                    .map_err(|e: anyhow::Error| corrupt(entry, e.to_string()))?;
                self.phases.insert(entry.entity_id.clone(), status);
            }
            EntityKind::Checklist => {
                if entry.new_status == status::DONE {
                    self.checklist_done.insert(entry.entity_id.clone());
                } else {
                    self.checklist_done.remove(&entry.entity_id);
                }
            }
            EntityKind::Wave => self.apply_wave(entry),
            EntityKind::Lease => self.apply_lease(entry),
            EntityKind::Escalation => self.apply_escalation(entry),
            EntityKind::Guidance => self.apply_guidance(entry)?,
            EntityKind::Blocker => self.apply_blocker(entry),
        }
        self.last_seq = entry.seq;
        Ok(())
    }

    fn apply_session(&mut self, entry: &LedgerEntry) {
        if let Some(EntryDetail::Session { plan_hash }) = &entry.detail {
            self.sessions.push(SessionRecord {
                id: entry.entity_id.clone(),
                plan_hash: plan_hash.clone(),
                started_at: entry.timestamp,
            });
        }
    }

    fn apply_unit(&mut self, entry: &LedgerEntry) -> Result<(), LedgerError> {
        let new: UnitStatus = entry
            .new_status
            .parse()
            .map_err(|e: anyhow::Error| corrupt(entry, e.to_string()))?;

        let record = match &entry.old_status {
            None => {
                if self.units.contains_key(&entry.entity_id) {
                    return Err(corrupt(
                        entry,
                        format!("unit {} created twice", entry.entity_id),
                    ));
                }
                self.unit_order.push(entry.entity_id.clone());
                let record = self.units.entry(entry.entity_id.clone()).or_default();
                record.status = new;
                record.updated_at = Some(entry.timestamp);
                return Ok(());
            }
            Some(old) => {
                let old: UnitStatus = old
                    .parse()
                    .map_err(|e: anyhow::Error| corrupt(entry, e.to_string()))?;
                let record = self.units.get_mut(&entry.entity_id).ok_or_else(|| {
                    corrupt(entry, format!("unit {} used before creation", entry.entity_id))
                })?;
                if record.status != old {
                    return Err(corrupt(
                        entry,
                        format!(
                            "unit {} recorded as {} but ledger says {}",
                            entry.entity_id, old, record.status
                        ),
                    ));
                }
                if !old.can_transition_to(new) {
                    return Err(corrupt(
                        entry,
                        format!("unit {} cannot move from {} to {}", entry.entity_id, old, new),
                    ));
                }
                record
            }
        };

        match new {
            UnitStatus::Dispatched => record.attempts += 1,
            UnitStatus::CorrectionsRequested => record.retry_count += 1,
            UnitStatus::Pending => {
                // human requeue starts a fresh budget
                record.retry_count = 0;
                record.attempts = 0;
                record.timeouts = 0;
                record.last_error = None;
                record.findings.clear();
            }
            _ => {}
        }

        match &entry.detail {
            Some(EntryDetail::Dispatch { guidance, .. }) => {
                record.guidance = guidance.clone();
            }
            Some(EntryDetail::Completion {
                artifacts,
                findings,
            }) => {
                record.artifacts = artifacts.clone();
                record.findings = findings.clone();
            }
            Some(EntryDetail::Failure { error, findings }) => {
                if *error == ErrorKind::Timeout && new == UnitStatus::Interrupted {
                    record.timeouts += 1;
                }
                record.last_error = Some(*error);
                record.findings = findings.clone();
            }
            _ => {}
        }

        record.status = new;
        record.updated_at = Some(entry.timestamp);
        Ok(())
    }

    fn apply_wave(&mut self, entry: &LedgerEntry) {
        match (&entry.detail, entry.new_status.as_str()) {
            (Some(EntryDetail::Wave { phase, index, units }), status::STARTED) => {
                self.waves.push(WaveRecord {
                    phase: phase.clone(),
                    index: *index,
                    units: units.clone(),
                    completed: false,
                });
            }
            (Some(EntryDetail::Wave { phase, index, .. }), status::COMPLETED) => {
                if let Some(wave) = self
                    .waves
                    .iter_mut()
                    .rev()
                    .find(|w| &w.phase == phase && w.index == *index)
                {
                    wave.completed = true;
                }
            }
            _ => {}
        }
    }

    fn apply_lease(&mut self, entry: &LedgerEntry) {
        let holder = match &entry.detail {
            Some(EntryDetail::Lease { holder }) => holder.clone(),
            _ => entry.actor.clone(),
        };
        if entry.new_status == status::HELD {
            self.leases.insert(entry.entity_id.clone(), holder);
        } else {
            self.leases.remove(&entry.entity_id);
        }
    }

    fn apply_escalation(&mut self, entry: &LedgerEntry) {
        match (&entry.detail, entry.new_status.as_str()) {
            (
                Some(EntryDetail::Escalation {
                    position,
                    domain,
                    description,
                    raised_by,
                }),
                status::SUBMITTED,
            ) => {
                self.escalations.push(EscalationRecord {
                    id: entry.entity_id.clone(),
                    position: *position,
                    domain: domain.clone(),
                    description: description.clone(),
                    raised_by: raised_by.clone(),
                    applied: false,
                    submitted_at: entry.timestamp,
                });
            }
            (_, status::APPLIED) => {
                if let Some(esc) = self
                    .escalations
                    .iter_mut()
                    .find(|e| e.id == entry.entity_id)
                {
                    esc.applied = true;
                }
            }
            _ => {}
        }
    }

    fn apply_guidance(&mut self, entry: &LedgerEntry) -> Result<(), LedgerError> {
        let version = parse_version_label(&entry.new_status).ok_or_else(|| {
            corrupt(
                entry,
                format!("bad guidance version '{}'", entry.new_status),
            )
        })?;
        let record = self.guidance.entry(entry.entity_id.clone()).or_default();
        let expected = match &entry.old_status {
            None if record.version == 0 => version,
            _ => record.version + 1,
        };
        if version != expected {
            return Err(corrupt(
                entry,
                format!(
                    "guidance for {} jumped from v{} to v{}",
                    entry.entity_id, record.version, version
                ),
            ));
        }
        record.version = version;
        if let Some(EntryDetail::Ruling { escalation, ruling }) = &entry.detail {
            record.rulings.push(ruling.clone());
            // a recorded ruling applies its escalation even without the marker
            if let Some(esc) = self.escalations.iter_mut().find(|e| &e.id == escalation) {
                esc.applied = true;
            }
        }
        Ok(())
    }

    fn apply_blocker(&mut self, entry: &LedgerEntry) {
        if entry.new_status == status::OPEN {
            if let Some(EntryDetail::Blocker {
                phase,
                error,
                findings,
            }) = &entry.detail
            {
                self.blockers.push(BlockerRecord {
                    id: entry.entity_id.clone(),
                    phase: phase.clone(),
                    error: *error,
                    findings: findings.clone(),
                    open: true,
                });
            }
        } else if let Some(b) = self
            .blockers
            .iter_mut()
            .rev()
            .find(|b| b.id == entry.entity_id && b.open)
        {
            b.open = false;
        }
    }

    pub fn unit(&self, id: &str) -> Option<&UnitRecord> {
        self.units.get(id)
    }

    pub fn unit_status(&self, id: &str) -> Option<UnitStatus> {
        self.units.get(id).map(|u| u.status)
    }

    /// Unit ids currently in `status`, in creation order.
    pub fn units_in(&self, status: UnitStatus) -> Vec<String> {
        self.unit_order
            .iter()
            .filter(|id| self.unit_status(id) == Some(status))
            .cloned()
            .collect()
    }

    pub fn phase_status(&self, phase: &str) -> GateStatus {
        self.phases.get(phase).copied().unwrap_or_default()
    }

    pub fn is_checklist_done(&self, phase: &str, item: &str) -> bool {
        self.checklist_done.contains(&checklist_key(phase, item))
    }

    pub fn current_wave(&self) -> Option<&WaveRecord> {
        self.waves.last()
    }

    /// Highest wave index started in a phase.
    pub fn last_wave_index(&self, phase: &str) -> Option<usize> {
        self.waves
            .iter()
            .filter(|w| w.phase == phase)
            .map(|w| w.index)
            .max()
    }

    /// Submitted but unapplied escalations in submission order.
    pub fn pending_escalations(&self) -> Vec<&EscalationRecord> {
        let mut pending: Vec<_> = self.escalations.iter().filter(|e| !e.applied).collect();
        pending.sort_by_key(|e| e.position);
        pending
    }

    pub fn next_escalation_position(&self) -> u64 {
        self.escalations
            .iter()
            .map(|e| e.position)
            .max()
            .map_or(1, |p| p + 1)
    }

    pub fn guidance_version(&self, domain: &str) -> Option<u64> {
        self.guidance.get(domain).map(|g| g.version)
    }

    pub fn open_blockers(&self, phase: &str) -> Vec<&BlockerRecord> {
        self.blockers
            .iter()
            .filter(|b| b.open && b.phase == phase)
            .collect()
    }

    pub fn last_session(&self) -> Option<&SessionRecord> {
        self.sessions.last()
    }

    /// Leases grouped by holder.
    pub fn leases_by_holder(&self) -> HashMap<&str, Vec<&str>> {
        let mut grouped: HashMap<&str, Vec<&str>> = HashMap::new();
        for (scope, holder) in &self.leases {
            grouped.entry(holder.as_str()).or_default().push(scope.as_str());
        }
        grouped
    }
}
