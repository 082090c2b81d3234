//! Top-level driver.
//!
//! A run reconciles the ledger, then walks the plan's phases in order. Each
//! phase runs wave after wave until its units are verified, asks for
//! approval and stops at the gate unless an `ApprovalSource` answers in
//! process.

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::dag::{DagConfig, DagScheduler, WaveSummary};
use crate::errors::{GateError, OrchestratorError};
use crate::escalation::{AdoptDescription, EscalationQueue, GuidanceStore, RulingAuthority};
use crate::gates::{ApprovalSource, DetachedApprovals, GateStatus, PhaseGateController};
use crate::ledger::{ACTOR_ENGINE, ACTOR_HUMAN, EntityKind, EntryDetail, Ledger, Transition, status};
use crate::orchestrator::dispatcher::{AbortHandle, Dispatcher, WavePlan};
use crate::orchestrator::events::EngineEvent;
use crate::orchestrator::recovery::{RecoveryManager, RecoveryReport, StatusReport};
use crate::orchestrator::worker::WorkerPool;
use crate::ownership::OwnershipGuard;
use crate::unit::{PhaseDef, PlanFile, UnitStatus};

/// Where a run stopped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    /// Every phase is approved.
    Completed,
    /// The phase waits for `stagehand gate approve|reject`.
    AwaitingApproval { phase: String },
    /// Units are verified but checklist items are still open.
    ChecklistPending { phase: String, items: Vec<String> },
    /// Failed units keep the phase from finishing.
    Halted { phase: String, failed: Vec<String> },
    /// A human rejected the phase.
    Rejected { phase: String, comments: String },
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

pub struct Engine {
    ledger: Ledger,
    plan: PlanFile,
    workers: WorkerPool,
    config: DagConfig,
    approvals: Arc<dyn ApprovalSource>,
    authority: Arc<dyn RulingAuthority>,
    events: Option<mpsc::Sender<EngineEvent>>,
    aborts: AbortHandle,
}

impl Engine {
    pub fn new(ledger: Ledger, plan: PlanFile, workers: WorkerPool, config: DagConfig) -> Self {
        Self {
            ledger,
            plan,
            workers,
            config,
            approvals: Arc::new(DetachedApprovals),
            authority: Arc::new(AdoptDescription),
            events: None,
            aborts: AbortHandle::default(),
        }
    }

    pub fn with_approvals(mut self, approvals: Arc<dyn ApprovalSource>) -> Self {
        self.approvals = approvals;
        self
    }

    pub fn with_ruling_authority(mut self, authority: Arc<dyn RulingAuthority>) -> Self {
        self.authority = authority;
        self
    }

    pub fn with_events(mut self, tx: mpsc::Sender<EngineEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Abort in-flight units of this engine from another task.
    pub fn abort_handle(&self) -> AbortHandle {
        self.aborts.clone()
    }

    pub fn plan(&self) -> &PlanFile {
        &self.plan
    }

    async fn emit(&self, event: EngineEvent) {
        if let Some(tx) = &self.events {
            tx.send(event).await.ok();
        }
    }

    /// Run the pipeline from wherever the ledger says it is.
    pub async fn run(&self) -> Result<RunOutcome, OrchestratorError> {
        self.plan.validate()?;
        let units: Vec<_> = self.plan.units().cloned().collect();
        let mut scheduler = match DagScheduler::from_units(&units, self.config.clone()) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "plan cannot be scheduled");
                return Err(e);
            }
        };

        let recovery = RecoveryManager::new(self.ledger.clone());
        let report = recovery.reconcile(&self.plan)?;
        self.record_session()?;

        let view = self.ledger.view()?;
        let store = Arc::new(GuidanceStore::from_view(&view));
        for domain in self.plan.domains() {
            store.ensure_domain(&domain, &self.ledger)?;
        }
        let escalations = Arc::new(EscalationQueue::spawn(
            store,
            self.ledger.clone(),
            self.authority.clone(),
        )?);
        let requeued = recovery.requeue_escalations(&escalations)?;
        scheduler.apply_view(&self.ledger.view()?);

        info!(
            interrupted = report.interrupted.len(),
            created = report.created.len(),
            escalations = requeued.len(),
            "engine resumed"
        );
        self.emit(EngineEvent::Resumed {
            interrupted: report.interrupted.clone(),
            escalations_requeued: requeued.len(),
        })
        .await;

        let gates = PhaseGateController::new(self.ledger.clone(), self.plan.phases.clone());
        let mut dispatcher = Dispatcher::new(
            self.ledger.clone(),
            Arc::new(OwnershipGuard::new()),
            escalations.clone(),
            self.workers.clone(),
            gates.clone(),
            self.config.clone(),
        )
        .with_abort_handle(self.aborts.clone());
        if let Some(tx) = &self.events {
            dispatcher = dispatcher.with_events(tx.clone());
        }

        let outcome = self
            .walk_phases(&mut scheduler, &dispatcher, &gates, &report)
            .await;

        drop(dispatcher);
        escalations.drain().await;
        match Arc::try_unwrap(escalations) {
            Ok(queue) => queue.shutdown().await,
            Err(_) => warn!("escalation queue still shared at shutdown"),
        }

        if let Ok(outcome) = &outcome {
            info!(outcome = ?outcome, "run finished");
        }
        outcome
    }

    fn record_session(&self) -> Result<(), OrchestratorError> {
        let id = Uuid::new_v4().to_string();
        self.ledger.append(
            Transition::new(EntityKind::Session, &id, None, status::STARTED).with_detail(
                EntryDetail::Session {
                    plan_hash: self.plan.content_hash(),
                },
            ),
        )?;
        Ok(())
    }

    async fn walk_phases(
        &self,
        scheduler: &mut DagScheduler,
        dispatcher: &Dispatcher,
        gates: &PhaseGateController,
        report: &RecoveryReport,
    ) -> Result<RunOutcome, OrchestratorError> {
        for phase in &self.plan.phases {
            match gates.status(&phase.id)? {
                GateStatus::Approved => continue,
                GateStatus::Blocked => {
                    let failed = failed_units(scheduler, &phase.id);
                    if !failed.is_empty() || !has_queued_units(scheduler, &phase.id) {
                        warn!(phase = %phase.id, failed = ?failed, "phase is blocked");
                        return Ok(RunOutcome::Halted {
                            phase: phase.id.clone(),
                            failed,
                        });
                    }
                    info!(phase = %phase.id, "corrective units queued, resuming phase");
                    gates.resume(&phase.id, ACTOR_ENGINE)?;
                    self.emit(EngineEvent::PhaseStarted {
                        phase: phase.id.clone(),
                    })
                    .await;
                    if let Some(outcome) = self
                        .run_phase(scheduler, dispatcher, gates, report, &phase.id)
                        .await?
                    {
                        return Ok(outcome);
                    }
                }
                GateStatus::AwaitingApproval => {}
                GateStatus::NotStarted | GateStatus::InProgress => {
                    if let Some(outcome) = self
                        .run_phase(scheduler, dispatcher, gates, report, &phase.id)
                        .await?
                    {
                        return Ok(outcome);
                    }
                }
            }

            if let Some(outcome) = self.await_approval(scheduler, gates, phase).await? {
                return Ok(outcome);
            }
        }
        Ok(RunOutcome::Completed)
    }

    /// Drive a phase's waves and bring its gate to `AwaitingApproval`.
    /// `Some` means the walk stops here.
    async fn run_phase(
        &self,
        scheduler: &mut DagScheduler,
        dispatcher: &Dispatcher,
        gates: &PhaseGateController,
        report: &RecoveryReport,
        phase: &str,
    ) -> Result<Option<RunOutcome>, OrchestratorError> {
        let resume_index = self.incomplete_wave(phase, report)?;
        self.run_waves(scheduler, dispatcher, gates, phase, resume_index)
            .await?;

        let failed = failed_units(scheduler, phase);
        if !failed.is_empty() {
            warn!(phase, failed = ?failed, "phase halted on failed units");
            self.emit(EngineEvent::PhaseBlocked {
                phase: phase.to_string(),
                failed_units: failed.clone(),
            })
            .await;
            return Ok(Some(RunOutcome::Halted {
                phase: phase.to_string(),
                failed,
            }));
        }

        // a phase with nothing left to dispatch still passes through InProgress
        self.start_gate(gates, phase).await?;

        let unverified: Vec<String> = scheduler
            .units_in_phase(phase)
            .filter(|u| u.status != UnitStatus::Verified)
            .map(|u| u.id.clone())
            .collect();
        match gates.request_approval(phase, &unverified) {
            Ok(()) => {}
            Err(OrchestratorError::Gate(GateError::ChecklistOpen { .. })) => {
                let items = gates.open_checklist_items(phase)?;
                info!(phase, items = ?items, "waiting on checklist");
                return Ok(Some(RunOutcome::ChecklistPending {
                    phase: phase.to_string(),
                    items,
                }));
            }
            Err(e) => return Err(e),
        }
        self.emit(EngineEvent::PhaseAwaitingApproval {
            phase: phase.to_string(),
        })
        .await;
        Ok(None)
    }

    async fn start_gate(
        &self,
        gates: &PhaseGateController,
        phase: &str,
    ) -> Result<(), OrchestratorError> {
        if gates.status(phase)? == GateStatus::NotStarted && gates.start(phase)? {
            self.emit(EngineEvent::PhaseStarted {
                phase: phase.to_string(),
            })
            .await;
        }
        Ok(())
    }

    /// Index of a wave the previous run started but never completed.
    fn incomplete_wave(
        &self,
        phase: &str,
        report: &RecoveryReport,
    ) -> Result<Option<usize>, OrchestratorError> {
        let view = self.ledger.view()?;
        let open = view
            .waves
            .iter()
            .rev()
            .find(|w| w.phase == phase)
            .filter(|w| !w.completed)
            .map(|w| w.index);
        if let Some(index) = open {
            info!(phase, wave = index, interrupted = ?report.interrupted, "resuming wave");
        }
        Ok(open)
    }

    async fn run_waves(
        &self,
        scheduler: &mut DagScheduler,
        dispatcher: &Dispatcher,
        gates: &PhaseGateController,
        phase: &str,
        mut resume: Option<usize>,
    ) -> Result<Vec<WaveSummary>, OrchestratorError> {
        let mut summaries = Vec::new();
        loop {
            let Some(units) = scheduler.pending_waves(Some(phase)).into_iter().next() else {
                break;
            };
            let (index, resumed) = match resume.take() {
                Some(index) => (index, true),
                None => {
                    let next = self
                        .ledger
                        .view()?
                        .last_wave_index(phase)
                        .map_or(0, |i| i + 1);
                    (next, false)
                }
            };

            self.start_gate(gates, phase).await?;

            let summary = dispatcher
                .run_wave(
                    scheduler,
                    WavePlan {
                        phase: phase.to_string(),
                        index,
                        units,
                        resumed,
                    },
                )
                .await?;
            let progressed = !summary.results.is_empty();
            summaries.push(summary);
            if !progressed {
                warn!(phase, wave = index, "wave admitted no units, stopping");
                break;
            }
        }
        Ok(summaries)
    }

    /// Wait at the gate. `None` means the phase was approved and the walk
    /// continues.
    async fn await_approval(
        &self,
        scheduler: &DagScheduler,
        gates: &PhaseGateController,
        phase: &PhaseDef,
    ) -> Result<Option<RunOutcome>, OrchestratorError> {
        let summary = approval_summary(scheduler, phase);
        let Some(signal) = self.approvals.await_signal(phase, &summary).await? else {
            info!(phase = %phase.id, "awaiting approval");
            return Ok(Some(RunOutcome::AwaitingApproval {
                phase: phase.id.clone(),
            }));
        };

        match gates.apply_signal(&phase.id, &signal, ACTOR_HUMAN)? {
            GateStatus::Approved => {
                self.emit(EngineEvent::PhaseApproved {
                    phase: phase.id.clone(),
                })
                .await;
                Ok(None)
            }
            _ => {
                self.emit(EngineEvent::PhaseRejected {
                    phase: phase.id.clone(),
                    comments: signal.comments.clone(),
                })
                .await;
                Ok(Some(RunOutcome::Rejected {
                    phase: phase.id.clone(),
                    comments: signal.comments,
                }))
            }
        }
    }

    /// Read-only position of the pipeline.
    pub fn status(&self) -> Result<StatusReport, OrchestratorError> {
        Ok(StatusReport::build(&self.ledger.view()?, Some(&self.plan)))
    }
}

fn failed_units(scheduler: &DagScheduler, phase: &str) -> Vec<String> {
    scheduler
        .units_in_phase(phase)
        .filter(|u| u.status == UnitStatus::Failed)
        .map(|u| u.id.clone())
        .collect()
}

/// Some unit of the phase can still be dispatched.
fn has_queued_units(scheduler: &DagScheduler, phase: &str) -> bool {
    scheduler
        .units_in_phase(phase)
        .any(|u| u.status.is_admissible() && !scheduler.is_blocked(&u.id))
}

fn approval_summary(scheduler: &DagScheduler, phase: &PhaseDef) -> String {
    let mut lines = vec![format!("Phase {} ({})", phase.name, phase.id)];
    for unit in scheduler.units_in_phase(&phase.id) {
        let artifacts = if unit.artifacts.is_empty() {
            String::from("-")
        } else {
            unit.artifacts.join(", ")
        };
        lines.push(format!("  {} [{}] {}", unit.id, unit.status, artifacts));
    }
    for item in &phase.checklist {
        lines.push(format!("  [x] {}", item.description));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gates::{ApprovalSignal, ChannelApprovals};
    use crate::orchestrator::worker::{TaskRequest, TaskResponse, Worker};
    use crate::unit::{ChecklistItem, UnitSpec, WorkUnit};
    use crate::verification::ArtifactManifest;
    use async_trait::async_trait;

    struct Compliant;

    #[async_trait]
    impl Worker for Compliant {
        async fn run(&self, request: TaskRequest) -> anyhow::Result<TaskResponse> {
            Ok(TaskResponse::success(
                vec![format!("{}.out", request.unit)],
                ArtifactManifest {
                    symbols: vec![request.unit.to_lowercase()],
                    ..Default::default()
                },
            ))
        }
    }

    fn unit(id: &str, deps: Vec<&str>) -> WorkUnit {
        WorkUnit::new(id, "core", deps.into_iter().map(String::from).collect()).with_spec(
            UnitSpec {
                interface: vec![id.to_lowercase()],
                ..Default::default()
            },
        )
    }

    fn plan() -> PlanFile {
        PlanFile::new(vec![
            PhaseDef::new("design", "Design").with_units(vec![unit("A", vec![]), unit("B", vec![])]),
            PhaseDef::new("build", "Build").with_units(vec![unit("C", vec!["A", "B"])]),
        ])
    }

    fn pool() -> WorkerPool {
        WorkerPool::new().with_fallback(Arc::new(Compliant))
    }

    #[tokio::test]
    async fn test_detached_run_stops_at_first_gate() {
        let ledger = Ledger::in_memory();
        let engine = Engine::new(ledger.clone(), plan(), pool(), DagConfig::default());
        let outcome = engine.run().await.unwrap();
        assert_eq!(
            outcome,
            RunOutcome::AwaitingApproval {
                phase: "design".into()
            }
        );
        let view = ledger.view().unwrap();
        assert_eq!(view.phase_status("design"), GateStatus::AwaitingApproval);
        assert_eq!(view.phase_status("build"), GateStatus::NotStarted);
        assert_eq!(view.unit_status("C"), Some(UnitStatus::Pending));
    }

    #[tokio::test]
    async fn test_channel_approvals_complete_the_pipeline() {
        let ledger = Ledger::in_memory();
        let (approvals, tx) = ChannelApprovals::new();
        tx.send(ApprovalSignal::approve("looks good")).await.unwrap();
        tx.send(ApprovalSignal::approve("ship it")).await.unwrap();

        let engine = Engine::new(ledger.clone(), plan(), pool(), DagConfig::default())
            .with_approvals(Arc::new(approvals));
        assert_eq!(engine.run().await.unwrap(), RunOutcome::Completed);

        let status = engine.status().unwrap();
        assert_eq!(status.count(UnitStatus::Verified), 3);
        assert_eq!(status.current_phase, None);
    }

    #[tokio::test]
    async fn test_rejection_blocks_phase() {
        let ledger = Ledger::in_memory();
        let (approvals, tx) = ChannelApprovals::new();
        tx.send(ApprovalSignal::reject("needs work")).await.unwrap();

        let engine = Engine::new(ledger.clone(), plan(), pool(), DagConfig::default())
            .with_approvals(Arc::new(approvals));
        let outcome = engine.run().await.unwrap();
        assert_eq!(
            outcome,
            RunOutcome::Rejected {
                phase: "design".into(),
                comments: "needs work".into()
            }
        );
        let view = ledger.view().unwrap();
        assert_eq!(view.phase_status("design"), GateStatus::Blocked);
        assert_eq!(view.open_blockers("design").len(), 1);
    }

    #[tokio::test]
    async fn test_open_checklist_holds_phase() {
        let ledger = Ledger::in_memory();
        let mut plan = plan();
        plan.phases[0].checklist = vec![ChecklistItem {
            id: "signoff".into(),
            description: "Architecture signed off".into(),
        }];
        let engine = Engine::new(ledger.clone(), plan, pool(), DagConfig::default());
        assert_eq!(
            engine.run().await.unwrap(),
            RunOutcome::ChecklistPending {
                phase: "design".into(),
                items: vec!["signoff".into()]
            }
        );
        assert_eq!(
            ledger.view().unwrap().phase_status("design"),
            GateStatus::InProgress
        );
    }

    #[tokio::test]
    async fn test_cycle_halts_before_anything_is_written() {
        let ledger = Ledger::in_memory();
        let plan = PlanFile::new(vec![PhaseDef::new("p", "P").with_units(vec![
            unit("A", vec!["B"]),
            unit("B", vec!["A"]),
        ])]);
        let engine = Engine::new(ledger.clone(), plan, pool(), DagConfig::default());
        let err = engine.run().await.unwrap_err();
        match err {
            OrchestratorError::DependencyCycle(e) => assert_eq!(e.units, vec!["A", "B"]),
            other => panic!("unexpected error: {other}"),
        }
        assert!(ledger.is_empty());
    }
}
