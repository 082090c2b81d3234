//! Startup reconciliation from the ledger.
//!
//! Recovery folds the ledger, interrupts anything that was in flight when
//! the previous engine stopped, drops leases nobody holds any more and
//! brings the ledger in line with the current plan. Running it twice in a
//! row appends nothing the second time.

use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{info, warn};

use crate::errors::{ErrorKind, LedgerError, OrchestratorError};
use crate::escalation::EscalationQueue;
use crate::gates::{GateStatus, PhaseGateController};
use crate::ledger::{
    ACTOR_RECOVERY, EntryDetail, Ledger, LedgerView, Transition, WaveRecord, checklist_key,
};
use crate::unit::{PlanFile, UnitStatus};

/// What a reconciliation pass changed.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecoveryReport {
    /// Units moved to `Interrupted`
    pub interrupted: Vec<String>,
    /// Scopes whose stale leases were released
    pub leases_released: Vec<String>,
    /// Plan units that got their first ledger entry
    pub created: Vec<String>,
    /// Units in the ledger that the plan no longer has
    pub orphans: Vec<String>,
    /// The plan differs from the one the last session ran
    pub plan_changed: bool,
}

impl RecoveryReport {
    pub fn is_clean(&self) -> bool {
        self.interrupted.is_empty() && self.leases_released.is_empty() && self.created.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PhaseReport {
    pub id: String,
    pub name: String,
    pub status: GateStatus,
    pub open_checklist: Vec<String>,
    pub open_blockers: Vec<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnitReport {
    pub id: String,
    pub phase: String,
    pub status: UnitStatus,
    pub retry_count: u32,
    pub attempts: u32,
    pub last_error: Option<ErrorKind>,
    pub artifacts: Vec<String>,
    /// Not part of the current plan
    pub orphan: bool,
}

/// Read-only position of the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub current_phase: Option<String>,
    pub phases: Vec<PhaseReport>,
    pub current_wave: Option<WaveRecord>,
    pub units: Vec<UnitReport>,
    pub guidance: BTreeMap<String, u64>,
    pub pending_escalations: usize,
    /// scope -> holder
    pub leases: BTreeMap<String, String>,
    pub ledger_entries: u64,
}

impl StatusReport {
    pub fn build(view: &LedgerView, plan: Option<&PlanFile>) -> Self {
        let mut phases = Vec::new();
        let mut units = Vec::new();

        if let Some(plan) = plan {
            for phase in &plan.phases {
                phases.push(PhaseReport {
                    id: phase.id.clone(),
                    name: phase.name.clone(),
                    status: view.phase_status(&phase.id),
                    open_checklist: phase
                        .checklist
                        .iter()
                        .filter(|c| !view.checklist_done.contains(&checklist_key(&phase.id, &c.id)))
                        .map(|c| c.id.clone())
                        .collect(),
                    open_blockers: view
                        .open_blockers(&phase.id)
                        .into_iter()
                        .map(|b| b.findings.clone())
                        .collect(),
                });
                for unit in &phase.units {
                    let record = view.unit(&unit.id).cloned().unwrap_or_default();
                    units.push(UnitReport {
                        id: unit.id.clone(),
                        phase: phase.id.clone(),
                        status: record.status,
                        retry_count: record.retry_count,
                        attempts: record.attempts,
                        last_error: record.last_error,
                        artifacts: record.artifacts,
                        orphan: false,
                    });
                }
            }
        } else {
            for (id, status) in &view.phases {
                phases.push(PhaseReport {
                    id: id.clone(),
                    name: id.clone(),
                    status: *status,
                    open_checklist: Vec::new(),
                    open_blockers: view
                        .open_blockers(id)
                        .into_iter()
                        .map(|b| b.findings.clone())
                        .collect(),
                });
            }
        }

        for id in &view.unit_order {
            if units.iter().any(|u| &u.id == id) {
                continue;
            }
            if let Some(record) = view.unit(id) {
                units.push(UnitReport {
                    id: id.clone(),
                    phase: String::new(),
                    status: record.status,
                    retry_count: record.retry_count,
                    attempts: record.attempts,
                    last_error: record.last_error,
                    artifacts: record.artifacts.clone(),
                    orphan: plan.is_some(),
                });
            }
        }

        let current_phase = phases
            .iter()
            .find(|p| p.status != GateStatus::Approved)
            .map(|p| p.id.clone());

        Self {
            current_phase,
            phases,
            current_wave: view.current_wave().cloned(),
            units,
            guidance: view
                .guidance
                .iter()
                .map(|(d, g)| (d.clone(), g.version))
                .collect(),
            pending_escalations: view.pending_escalations().len(),
            leases: view.leases.clone(),
            ledger_entries: view.last_seq,
        }
    }

    pub fn count(&self, status: UnitStatus) -> usize {
        self.units.iter().filter(|u| u.status == status).count()
    }
}

pub struct RecoveryManager {
    ledger: Ledger,
}

impl RecoveryManager {
    pub fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }

    /// Bring the ledger to a consistent resting state for `plan`.
    pub fn reconcile(&self, plan: &PlanFile) -> Result<RecoveryReport, OrchestratorError> {
        let view = self.ledger.view()?;
        let mut report = RecoveryReport::default();

        let hash = plan.content_hash();
        if let Some(session) = view.last_session()
            && session.plan_hash != hash
        {
            warn!(
                previous = %session.plan_hash,
                current = %hash,
                "plan changed since the last session"
            );
            report.plan_changed = true;
        }

        for id in &view.unit_order {
            let Some(status) = view.unit_status(id) else {
                continue;
            };
            if status.is_in_flight() {
                self.ledger.append(
                    Transition::unit(id, Some(status), UnitStatus::Interrupted)
                        .by(ACTOR_RECOVERY)
                        .with_detail(EntryDetail::Note {
                            text: format!("was {} when the engine stopped", status),
                        }),
                )?;
                info!(unit = %id, was = %status, "unit interrupted");
                report.interrupted.push(id.clone());
            }
        }

        for (scope, holder) in &view.leases {
            self.ledger.append(Transition::lease(scope, holder, false).by(ACTOR_RECOVERY))?;
            info!(scope = %scope, holder = %holder, "stale lease released");
            report.leases_released.push(scope.clone());
        }

        for unit in plan.units() {
            if view.unit(&unit.id).is_none() {
                self.ledger.append(
                    Transition::unit(&unit.id, None, UnitStatus::Pending).by(ACTOR_RECOVERY),
                )?;
                report.created.push(unit.id.clone());
            }
        }

        report.orphans = view
            .unit_order
            .iter()
            .filter(|id| plan.get_unit(id).is_none())
            .cloned()
            .collect();
        if !report.orphans.is_empty() {
            warn!(units = ?report.orphans, "ledger has units the plan no longer defines");
        }

        Ok(report)
    }

    /// Hand unapplied escalations back to the queue in submission order.
    pub fn requeue_escalations(&self, queue: &EscalationQueue) -> Result<Vec<String>, LedgerError> {
        let view = self.ledger.view()?;
        let pending = view.pending_escalations();
        for record in &pending {
            queue.resubmit(record);
        }
        if !pending.is_empty() {
            info!(count = pending.len(), "pending escalations re-enqueued");
        }
        Ok(pending.into_iter().map(|r| r.id.clone()).collect())
    }

    pub fn status(&self, plan: Option<&PlanFile>) -> Result<StatusReport, LedgerError> {
        Ok(StatusReport::build(&self.ledger.view()?, plan))
    }

    /// Put a failed unit back to `Pending`. Once its phase has no failed
    /// units left, the phase's blockers are resolved and a `Blocked` gate
    /// resumes.
    pub fn requeue_unit(
        &self,
        plan: &PlanFile,
        unit: &str,
        actor: &str,
    ) -> Result<GateStatus, OrchestratorError> {
        let def = plan
            .get_unit(unit)
            .ok_or_else(|| OrchestratorError::UnknownUnit(unit.to_string()))?;
        let view = self.ledger.view()?;
        let current = view.unit_status(unit).unwrap_or_default();
        if !current.can_transition_to(UnitStatus::Pending) {
            return Err(OrchestratorError::InvalidTransition {
                unit: unit.to_string(),
                from: current.to_string(),
                to: UnitStatus::Pending.to_string(),
            });
        }
        self.ledger.append(
            Transition::unit(unit, Some(current), UnitStatus::Pending)
                .by(actor)
                .with_detail(EntryDetail::Note {
                    text: "requeued".to_string(),
                }),
        )?;
        info!(unit, phase = %def.phase, "unit requeued");

        let gates = PhaseGateController::new(self.ledger.clone(), plan.phases.clone());
        let view = self.ledger.view()?;
        let still_failed = plan
            .get_phase(&def.phase)
            .map(|p| {
                p.units
                    .iter()
                    .any(|u| view.unit_status(&u.id) == Some(UnitStatus::Failed))
            })
            .unwrap_or(false);
        if still_failed {
            return gates.status(&def.phase);
        }
        match gates.status(&def.phase)? {
            GateStatus::Blocked => gates.resume(&def.phase, actor)?,
            _ => {
                gates.resolve_blockers(&def.phase, actor)?;
            }
        }
        gates.status(&def.phase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escalation::{AdoptDescription, EscalationRequest, GuidanceStore, record_submission};
    use crate::ledger::{EntityKind, status};
    use crate::unit::{PhaseDef, WorkUnit};
    use std::sync::Arc;

    fn plan() -> PlanFile {
        PlanFile::new(vec![PhaseDef::new("build", "Build").with_units(vec![
            WorkUnit::new("A", "core", vec![]),
            WorkUnit::new("B", "core", vec![]),
            WorkUnit::new("C", "core", vec!["A".into(), "B".into()]),
        ])])
    }

    fn drive(ledger: &Ledger, id: &str, path: &[UnitStatus]) {
        let mut prev = None;
        for &s in path {
            ledger.append(Transition::unit(id, prev, s)).unwrap();
            prev = Some(s);
        }
    }

    #[test]
    fn test_crash_mid_wave_interrupts_in_flight_only() {
        use UnitStatus::*;
        let ledger = Ledger::in_memory();
        drive(&ledger, "A", &[Pending, Ready, Dispatched, InProgress, Verifying, Verified]);
        drive(&ledger, "B", &[Pending, Ready, Dispatched, InProgress, Verifying, Verified]);
        drive(&ledger, "C", &[Pending, Ready, Dispatched, InProgress]);
        ledger
            .append(Transition::lease("modules/c", "C", true).by("C"))
            .unwrap();

        let recovery = RecoveryManager::new(ledger.clone());
        let report = recovery.reconcile(&plan()).unwrap();
        assert_eq!(report.interrupted, vec!["C"]);
        assert_eq!(report.leases_released, vec!["modules/c"]);

        let view = ledger.view().unwrap();
        assert_eq!(view.unit_status("A"), Some(Verified));
        assert_eq!(view.unit_status("B"), Some(Verified));
        assert_eq!(view.unit_status("C"), Some(Interrupted));
        assert!(view.leases.is_empty());
        let last = ledger.last_for(EntityKind::Lease, "modules/c").unwrap().unwrap();
        assert_eq!(last.actor, ACTOR_RECOVERY);
    }

    #[test]
    fn test_reconcile_is_idempotent() {
        use UnitStatus::*;
        let ledger = Ledger::in_memory();
        drive(&ledger, "A", &[Pending, Ready, Dispatched]);

        let recovery = RecoveryManager::new(ledger.clone());
        let first = recovery.reconcile(&plan()).unwrap();
        assert_eq!(first.created, vec!["B", "C"]);
        let len = ledger.len();

        let second = recovery.reconcile(&plan()).unwrap();
        assert!(second.is_clean());
        assert_eq!(ledger.len(), len);
    }

    #[test]
    fn test_orphans_and_plan_change_reported() {
        let ledger = Ledger::in_memory();
        drive(&ledger, "Z", &[UnitStatus::Pending]);
        ledger
            .append(
                Transition::new(EntityKind::Session, "s1", None, status::STARTED).with_detail(
                    EntryDetail::Session {
                        plan_hash: "old".into(),
                    },
                ),
            )
            .unwrap();

        let report = RecoveryManager::new(ledger).reconcile(&plan()).unwrap();
        assert_eq!(report.orphans, vec!["Z"]);
        assert!(report.plan_changed);
    }

    #[test]
    fn test_status_report_positions() {
        use UnitStatus::*;
        let ledger = Ledger::in_memory();
        drive(&ledger, "A", &[Pending, Ready]);
        let recovery = RecoveryManager::new(ledger.clone());
        recovery.reconcile(&plan()).unwrap();

        let status = recovery.status(Some(&plan())).unwrap();
        assert_eq!(status.current_phase.as_deref(), Some("build"));
        assert_eq!(status.units.len(), 3);
        assert_eq!(status.count(Ready), 1);
        assert_eq!(status.count(Pending), 2);
        assert!(status.units.iter().all(|u| !u.orphan));
    }

    #[tokio::test]
    async fn test_requeue_applies_offline_escalations_once() {
        let ledger = Ledger::in_memory();
        record_submission(&ledger, &EscalationRequest::new("human", "errors", "E1"), 1).unwrap();
        record_submission(&ledger, &EscalationRequest::new("human", "errors", "E2"), 2).unwrap();

        let store = Arc::new(GuidanceStore::new());
        let queue =
            EscalationQueue::spawn(store.clone(), ledger.clone(), Arc::new(AdoptDescription))
                .unwrap();
        let recovery = RecoveryManager::new(ledger.clone());
        assert_eq!(recovery.requeue_escalations(&queue).unwrap().len(), 2);
        // a second pass before the consumer catches up must not double-apply
        recovery.requeue_escalations(&queue).unwrap();
        queue.drain().await;

        assert_eq!(store.version("errors"), 3);
        let snapshot = store.snapshot("errors").unwrap();
        assert_eq!(snapshot.rulings, vec!["E1", "E2"]);
        assert!(ledger.view().unwrap().pending_escalations().is_empty());
    }

    #[test]
    fn test_requeue_failed_unit_resolves_blockers() {
        use UnitStatus::*;
        let ledger = Ledger::in_memory();
        let plan = plan();
        let gates = PhaseGateController::new(ledger.clone(), plan.phases.clone());
        gates.start("build").unwrap();
        drive(&ledger, "A", &[Pending, Ready, Dispatched, Failed]);
        drive(&ledger, "B", &[Pending, Ready, Dispatched, Failed]);
        gates
            .raise_blocker("build", ErrorKind::WorkerFailure, vec!["A broke".into()])
            .unwrap();

        let recovery = RecoveryManager::new(ledger.clone());
        recovery.requeue_unit(&plan, "A", "human").unwrap();
        let view = ledger.view().unwrap();
        assert_eq!(view.unit_status("A"), Some(Pending));
        // B is still failed, the blocker stays open
        assert_eq!(view.open_blockers("build").len(), 1);

        let gate = recovery.requeue_unit(&plan, "B", "human").unwrap();
        assert_eq!(gate, GateStatus::InProgress);
        assert!(ledger.view().unwrap().open_blockers("build").is_empty());
    }

    #[test]
    fn test_requeue_rejects_unknown_and_non_failed_units() {
        use UnitStatus::*;
        let ledger = Ledger::in_memory();
        drive(&ledger, "A", &[Pending, Ready]);
        let recovery = RecoveryManager::new(ledger);

        assert!(matches!(
            recovery.requeue_unit(&plan(), "nope", "human"),
            Err(OrchestratorError::UnknownUnit(_))
        ));
        assert!(matches!(
            recovery.requeue_unit(&plan(), "A", "human"),
            Err(OrchestratorError::InvalidTransition { .. })
        ));
    }
}
