//! Wave dispatch.
//!
//! The dispatcher runs one wave at a time. Its control loop is the only code
//! that changes unit status: spawned tasks acquire leases and run workers,
//! then report back over a channel (`Leased`, `Started`, `Finished`) and the
//! loop turns each report into ledger entries. At most `max_parallel` units
//! are in flight; the rest wait in submission order. The wave ends once every
//! unit is `Verified` or `Failed`.

use chrono::Utc;
use futures::FutureExt;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::dag::{DagConfig, DagScheduler, UnitResult, WaveSummary};
use crate::errors::{ErrorKind, OrchestratorError, ResourceConflictError};
use crate::escalation::{EscalationQueue, EscalationRequest, GuidanceUpdate};
use crate::gates::PhaseGateController;
use crate::ledger::{EntityKind, EntryDetail, Ledger, Transition, status, wave_key};
use crate::orchestrator::events::EngineEvent;
use crate::orchestrator::worker::{TaskRequest, TaskResponse, Worker, WorkerPool, WorkerStatus};
use crate::ownership::OwnershipGuard;
use crate::unit::{UnitStatus, WorkUnit};
use crate::verification::{Verdict, VerificationGate};

/// Lets a caller abort a dispatched unit by id.
#[derive(Clone, Default)]
pub struct AbortHandle {
    senders: Arc<Mutex<HashMap<String, oneshot::Sender<()>>>>,
}

impl std::fmt::Debug for AbortHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AbortHandle")
            .field("armed", &self.armed())
            .finish()
    }
}

impl AbortHandle {
    /// Abort the unit's current dispatch. Returns `false` if the unit is not
    /// in flight.
    pub fn abort(&self, unit: &str) -> bool {
        let sender = self
            .senders
            .lock()
            .ok()
            .and_then(|mut s| s.remove(unit));
        match sender {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }

    /// Units that can currently be aborted.
    pub fn armed(&self) -> Vec<String> {
        let mut units: Vec<String> = self
            .senders
            .lock()
            .map(|s| s.keys().cloned().collect())
            .unwrap_or_default();
        units.sort();
        units
    }

    fn register(&self, unit: &str) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut senders) = self.senders.lock() {
            senders.insert(unit.to_string(), tx);
        }
        rx
    }

    fn forget(&self, unit: &str) {
        if let Ok(mut senders) = self.senders.lock() {
            senders.remove(unit);
        }
    }
}

/// One wave to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WavePlan {
    pub phase: String,
    pub index: usize,
    /// Units in submission order
    pub units: Vec<String>,
    /// The wave was started by an earlier run and is being resumed
    pub resumed: bool,
}

#[derive(Debug)]
enum TaskOutcome {
    Responded(TaskResponse),
    WorkerError(String),
    Conflict(ResourceConflictError),
    TimedOut,
    Aborted,
}

#[derive(Debug)]
enum TaskMessage {
    Leased { unit: String, scopes: Vec<String> },
    Started { unit: String },
    Finished { unit: String, outcome: TaskOutcome },
    Settled { unit: String },
}

enum Wake {
    Message(TaskMessage),
    Joined(Result<(), tokio::task::JoinError>),
    Guidance(GuidanceUpdate),
}

struct InFlight {
    guidance: BTreeMap<String, u64>,
    /// Scopes recorded as held in the ledger
    scopes: Vec<String>,
}

/// Mutable state of one running wave.
struct WaveRun {
    plan: WavePlan,
    queue: VecDeque<String>,
    in_flight: HashMap<String, InFlight>,
    /// Units waiting for their guidance domains to settle
    parked: usize,
    to_park: Vec<String>,
    attempts: HashMap<String, u32>,
    timeouts: HashMap<String, u32>,
    findings: HashMap<String, Vec<String>>,
    started: HashMap<String, Instant>,
    summary: WaveSummary,
}

impl WaveRun {
    fn is_idle(&self) -> bool {
        self.queue.is_empty()
            && self.in_flight.is_empty()
            && self.parked == 0
            && self.to_park.is_empty()
    }

    fn elapsed(&self, unit: &str) -> Duration {
        self.started
            .get(unit)
            .map(|s| s.elapsed())
            .unwrap_or_default()
    }

    fn attempts(&self, unit: &str) -> u32 {
        self.attempts.get(unit).copied().unwrap_or(0)
    }
}

/// Runs waves against workers, leases, guidance and the verification gate.
pub struct Dispatcher {
    ledger: Ledger,
    guard: Arc<OwnershipGuard>,
    escalations: Arc<EscalationQueue>,
    workers: WorkerPool,
    verification: VerificationGate,
    gates: PhaseGateController,
    config: DagConfig,
    events: Option<mpsc::Sender<EngineEvent>>,
    aborts: AbortHandle,
}

impl Dispatcher {
    pub fn new(
        ledger: Ledger,
        guard: Arc<OwnershipGuard>,
        escalations: Arc<EscalationQueue>,
        workers: WorkerPool,
        gates: PhaseGateController,
        config: DagConfig,
    ) -> Self {
        Self {
            verification: VerificationGate::new(config.max_corrections),
            ledger,
            guard,
            escalations,
            workers,
            gates,
            config,
            events: None,
            aborts: AbortHandle::default(),
        }
    }

    pub fn with_events(mut self, tx: mpsc::Sender<EngineEvent>) -> Self {
        self.events = Some(tx);
        self
    }

    /// Share an abort handle created before the dispatcher.
    pub fn with_abort_handle(mut self, handle: AbortHandle) -> Self {
        self.aborts = handle;
        self
    }

    pub fn abort_handle(&self) -> AbortHandle {
        self.aborts.clone()
    }

    async fn emit(&self, event: EngineEvent) {
        if let Some(tx) = &self.events {
            tx.send(event).await.ok();
        }
    }

    /// Apply a status change to the scheduler and record it.
    fn advance(
        &self,
        scheduler: &mut DagScheduler,
        unit: &str,
        to: UnitStatus,
        detail: Option<EntryDetail>,
    ) -> Result<(), OrchestratorError> {
        let from = scheduler.transition(unit, to)?;
        let mut t = Transition::unit(unit, Some(from), to);
        if let Some(d) = detail {
            t = t.with_detail(d);
        }
        self.ledger.append(t)?;
        debug!(unit, from = %from, to = %to, "unit transition");
        Ok(())
    }

    /// Run one wave until every unit in it is `Verified` or `Failed`.
    pub async fn run_wave(
        &self,
        scheduler: &mut DagScheduler,
        plan: WavePlan,
    ) -> Result<WaveSummary, OrchestratorError> {
        for id in &plan.units {
            let unit = scheduler
                .get_unit(id)
                .ok_or_else(|| OrchestratorError::UnknownUnit(id.clone()))?;
            if !self.workers.has(unit.role) {
                return Err(OrchestratorError::NoWorker(unit.role.to_string()));
            }
        }

        let key = wave_key(&plan.phase, plan.index);
        if !plan.resumed {
            self.ledger.append(
                Transition::new(EntityKind::Wave, &key, None, status::STARTED).with_detail(
                    EntryDetail::Wave {
                        phase: plan.phase.clone(),
                        index: plan.index,
                        units: plan.units.clone(),
                    },
                ),
            )?;
        }
        info!(phase = %plan.phase, wave = plan.index, units = ?plan.units, resumed = plan.resumed, "wave started");
        self.emit(EngineEvent::WaveStarted {
            phase: plan.phase.clone(),
            wave: plan.index,
            units: plan.units.clone(),
        })
        .await;

        let view = self.ledger.view()?;
        let mut wave = WaveRun {
            queue: VecDeque::new(),
            in_flight: HashMap::new(),
            parked: 0,
            to_park: Vec::new(),
            attempts: HashMap::new(),
            timeouts: HashMap::new(),
            findings: HashMap::new(),
            started: HashMap::new(),
            summary: WaveSummary::new(&plan.phase, plan.index),
            plan,
        };

        for id in wave.plan.units.clone() {
            if let Some(record) = view.unit(&id) {
                wave.attempts.insert(id.clone(), record.attempts);
                wave.timeouts.insert(id.clone(), record.timeouts);
                if record.status == UnitStatus::CorrectionsRequested {
                    wave.findings.insert(id.clone(), record.findings.clone());
                }
            }
            match scheduler.status(&id) {
                Some(UnitStatus::Pending) | Some(UnitStatus::Interrupted) => {
                    self.advance(scheduler, &id, UnitStatus::Ready, None)?;
                    wave.queue.push_back(id);
                }
                Some(UnitStatus::Ready) | Some(UnitStatus::CorrectionsRequested) => {
                    wave.queue.push_back(id);
                }
                other => {
                    warn!(unit = %id, status = ?other, "unit is not admissible, skipped");
                }
            }
        }

        let timer = Instant::now();
        let (tx, mut rx) = mpsc::unbounded_channel::<TaskMessage>();
        let mut tasks: JoinSet<()> = JoinSet::new();
        let mut updates = self.escalations.store().subscribe();

        loop {
            self.fill(scheduler, &mut wave, &mut tasks, &tx).await?;
            if wave.is_idle() {
                break;
            }

            let wake = tokio::select! {
                biased;
                Some(msg) = rx.recv() => Wake::Message(msg),
                Some(joined) = tasks.join_next() => Wake::Joined(joined),
                Ok(update) = updates.recv() => Wake::Guidance(update),
            };

            match wake {
                Wake::Message(msg) => self.handle(scheduler, &mut wave, msg).await?,
                Wake::Joined(Err(e)) => error!(error = %e, "dispatch task ended abnormally"),
                Wake::Joined(Ok(())) => {}
                Wake::Guidance(update) => {
                    let affected: Vec<String> = wave
                        .in_flight
                        .iter()
                        .filter(|(_, f)| {
                            f.guidance
                                .get(&update.domain)
                                .is_some_and(|&v| v < update.version)
                        })
                        .map(|(u, _)| u.clone())
                        .collect();
                    if !affected.is_empty() {
                        info!(domain = %update.domain, version = update.version, units = ?affected, "in-flight units hold superseded guidance");
                    }
                    self.emit(EngineEvent::GuidanceUpdated {
                        domain: update.domain,
                        version: update.version,
                        affected,
                    })
                    .await;
                }
            }
        }

        wave.summary.duration = timer.elapsed();
        self.ledger.append(
            Transition::new(EntityKind::Wave, &key, Some(status::STARTED), status::COMPLETED)
                .with_detail(EntryDetail::Wave {
                    phase: wave.plan.phase.clone(),
                    index: wave.plan.index,
                    units: wave.plan.units.clone(),
                }),
        )?;
        info!(
            phase = %wave.plan.phase,
            wave = wave.plan.index,
            verified = wave.summary.verified,
            failed = wave.summary.failed,
            "wave completed"
        );
        self.emit(EngineEvent::WaveCompleted {
            phase: wave.plan.phase.clone(),
            wave: wave.plan.index,
            verified: wave.summary.verified,
            failed: wave.summary.failed,
        })
        .await;

        Ok(wave.summary)
    }

    /// Dispatch queued units up to the concurrency limit and park units
    /// waiting on guidance.
    async fn fill(
        &self,
        scheduler: &mut DagScheduler,
        wave: &mut WaveRun,
        tasks: &mut JoinSet<()>,
        tx: &mpsc::UnboundedSender<TaskMessage>,
    ) -> Result<(), OrchestratorError> {
        for id in std::mem::take(&mut wave.to_park) {
            let domains = scheduler
                .get_unit(&id)
                .map(|u| u.guidance_domains())
                .unwrap_or_default();
            let escalations = self.escalations.clone();
            let tx = tx.clone();
            wave.parked += 1;
            tasks.spawn(async move {
                for domain in &domains {
                    escalations.settled(domain).await;
                }
                tx.send(TaskMessage::Settled { unit: id }).ok();
            });
        }

        let limit = self.config.max_parallel.max(1);
        while wave.in_flight.len() < limit {
            let Some(id) = wave.queue.pop_front() else {
                break;
            };
            self.dispatch(scheduler, wave, tasks, tx, &id).await?;
        }
        Ok(())
    }

    async fn dispatch(
        &self,
        scheduler: &mut DagScheduler,
        wave: &mut WaveRun,
        tasks: &mut JoinSet<()>,
        tx: &mpsc::UnboundedSender<TaskMessage>,
        id: &str,
    ) -> Result<(), OrchestratorError> {
        let unit: WorkUnit = scheduler
            .get_unit(id)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnknownUnit(id.to_string()))?;
        let worker: Arc<dyn Worker> = self
            .workers
            .get(unit.role)
            .ok_or_else(|| OrchestratorError::NoWorker(unit.role.to_string()))?;

        let store = self.escalations.store();
        let domains = unit.guidance_domains();
        for domain in &domains {
            store.ensure_domain(domain, &self.ledger)?;
        }
        let guidance = store.pin(&domains);

        let attempt = wave.attempts(id) + 1;
        wave.attempts.insert(id.to_string(), attempt);

        let timeout = self.config.unit_timeout();
        let deadline = Utc::now()
            + chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::days(365));
        let expires = tokio::time::Instant::now()
            .checked_add(timeout)
            .unwrap_or_else(|| tokio::time::Instant::now() + Duration::from_secs(365 * 24 * 3600));

        self.advance(
            scheduler,
            id,
            UnitStatus::Dispatched,
            Some(EntryDetail::Dispatch {
                wave: wave.plan.index,
                attempt,
                guidance: guidance.clone(),
                deadline,
            }),
        )?;

        let request = TaskRequest {
            unit: unit.id.clone(),
            domain: unit.domain.clone(),
            role: unit.role,
            attempt,
            guidance: guidance.clone(),
            dependency_artifacts: scheduler.dependency_artifacts(id),
            deadline,
            prior_findings: wave.findings.get(id).cloned().unwrap_or_default(),
            scopes: unit.scopes.clone(),
        };

        let cancel = self.aborts.register(id);
        wave.in_flight.insert(
            id.to_string(),
            InFlight {
                guidance,
                scopes: Vec::new(),
            },
        );
        wave.started
            .entry(id.to_string())
            .or_insert_with(Instant::now);

        tasks.spawn(run_task(
            worker,
            self.guard.clone(),
            request,
            unit.scopes,
            expires,
            cancel,
            tx.clone(),
        ));

        info!(unit = id, wave = wave.plan.index, attempt, "unit dispatched");
        self.emit(EngineEvent::UnitDispatched {
            unit: id.to_string(),
            wave: wave.plan.index,
            attempt,
        })
        .await;
        Ok(())
    }

    async fn handle(
        &self,
        scheduler: &mut DagScheduler,
        wave: &mut WaveRun,
        msg: TaskMessage,
    ) -> Result<(), OrchestratorError> {
        match msg {
            TaskMessage::Leased { unit, scopes } => {
                for scope in &scopes {
                    self.ledger
                        .append(Transition::lease(scope, &unit, true).by(&unit))?;
                }
                if let Some(flight) = wave.in_flight.get_mut(&unit) {
                    flight.scopes = scopes;
                }
            }
            TaskMessage::Started { unit } => {
                self.advance(scheduler, &unit, UnitStatus::InProgress, None)?;
                self.emit(EngineEvent::UnitStarted { unit }).await;
            }
            TaskMessage::Settled { unit } => {
                wave.parked = wave.parked.saturating_sub(1);
                debug!(unit = %unit, "guidance settled, unit requeued");
                wave.queue.push_back(unit);
            }
            TaskMessage::Finished { unit, outcome } => {
                self.finish(scheduler, wave, &unit, outcome).await?;
            }
        }
        Ok(())
    }

    fn release_leases(&self, unit: &str, recorded: &[String]) -> Result<(), OrchestratorError> {
        let freed = self.guard.release_all(unit);
        for scope in recorded {
            self.ledger
                .append(Transition::lease(scope, unit, false).by(unit))?;
        }
        if !freed.is_empty() {
            debug!(unit, scopes = ?freed, "leases released");
        }
        Ok(())
    }

    async fn finish(
        &self,
        scheduler: &mut DagScheduler,
        wave: &mut WaveRun,
        id: &str,
        outcome: TaskOutcome,
    ) -> Result<(), OrchestratorError> {
        let Some(flight) = wave.in_flight.remove(id) else {
            warn!(unit = id, "completion for a unit that is not in flight");
            return Ok(());
        };
        self.aborts.forget(id);
        self.release_leases(id, &flight.scopes)?;

        match outcome {
            TaskOutcome::Responded(response) => {
                for draft in &response.escalations {
                    let ack = self.escalations.submit(EscalationRequest::new(
                        id,
                        &draft.domain,
                        &draft.description,
                    ))?;
                    info!(unit = id, domain = %draft.domain, position = ack.position, "worker raised an escalation");
                }
                self.emit(EngineEvent::UnitCompleted {
                    unit: id.to_string(),
                    status: response.status,
                })
                .await;
                self.review(scheduler, wave, id, &flight, response).await
            }
            TaskOutcome::WorkerError(message) => {
                warn!(unit = id, error = %message, "worker invocation failed");
                self.fail(scheduler, wave, id, ErrorKind::WorkerFailure, vec![message])
                    .await
            }
            TaskOutcome::Conflict(err) => {
                error!(unit = id, scope = %err.scope, holder = %err.conflicting_holder, "resource conflict");
                self.fail(
                    scheduler,
                    wave,
                    id,
                    ErrorKind::ResourceConflict,
                    vec![err.to_string()],
                )
                .await
            }
            TaskOutcome::Aborted => {
                warn!(unit = id, "unit aborted");
                self.fail(
                    scheduler,
                    wave,
                    id,
                    ErrorKind::Aborted,
                    vec!["aborted on request".to_string()],
                )
                .await
            }
            TaskOutcome::TimedOut => {
                let finding = format!(
                    "exceeded the {}s deadline",
                    self.config.unit_timeout_secs
                );
                let timeouts = wave.timeouts.entry(id.to_string()).or_default();
                if *timeouts == 0 {
                    *timeouts += 1;
                    warn!(unit = id, "unit timed out, requeued once");
                    self.advance(
                        scheduler,
                        id,
                        UnitStatus::Interrupted,
                        Some(EntryDetail::Failure {
                            error: ErrorKind::Timeout,
                            findings: vec![finding],
                        }),
                    )?;
                    self.advance(scheduler, id, UnitStatus::Ready, None)?;
                    wave.queue.push_back(id.to_string());
                    self.emit(EngineEvent::UnitInterrupted {
                        unit: id.to_string(),
                        error: ErrorKind::Timeout,
                    })
                    .await;
                    Ok(())
                } else {
                    warn!(unit = id, "unit timed out again");
                    self.fail(scheduler, wave, id, ErrorKind::Timeout, vec![finding])
                        .await
                }
            }
        }
    }

    /// Turn a worker response into a verification verdict.
    async fn review(
        &self,
        scheduler: &mut DagScheduler,
        wave: &mut WaveRun,
        id: &str,
        flight: &InFlight,
        response: TaskResponse,
    ) -> Result<(), OrchestratorError> {
        let unit = scheduler
            .get_unit(id)
            .cloned()
            .ok_or_else(|| OrchestratorError::UnknownUnit(id.to_string()))?;

        let failure = match response.status {
            WorkerStatus::Failure => ErrorKind::WorkerFailure,
            _ => ErrorKind::VerificationFailure,
        };
        let report = match response.status {
            WorkerStatus::Failure => self.verification.worker_failed(&unit, response.findings),
            WorkerStatus::CorrectionsNeeded => self
                .verification
                .worker_requested_corrections(&unit, response.findings),
            WorkerStatus::Success => {
                self.advance(scheduler, id, UnitStatus::Verifying, None)?;
                match self.verification.review(
                    &unit,
                    &response.manifest,
                    &response.artifacts,
                    &flight.guidance,
                    self.escalations.store(),
                ) {
                    Ok(report) => report,
                    Err(mismatch) => {
                        info!(
                            unit = id,
                            domain = %mismatch.domain,
                            dispatched = mismatch.dispatched,
                            current = mismatch.current,
                            "stale guidance, refetching"
                        );
                        self.advance(
                            scheduler,
                            id,
                            UnitStatus::Ready,
                            Some(EntryDetail::Note {
                                text: mismatch.to_string(),
                            }),
                        )?;
                        wave.to_park.push(id.to_string());
                        self.emit(EngineEvent::GuidanceRefetch {
                            unit: id.to_string(),
                            domain: mismatch.domain,
                            dispatched: mismatch.dispatched,
                            current: mismatch.current,
                        })
                        .await;
                        return Ok(());
                    }
                }
            }
        };

        match report.verdict {
            Verdict::Approve => {
                self.advance(
                    scheduler,
                    id,
                    UnitStatus::Verified,
                    Some(EntryDetail::Completion {
                        artifacts: response.artifacts.clone(),
                        findings: Vec::new(),
                    }),
                )?;
                scheduler.set_artifacts(id, response.artifacts.clone());
                wave.findings.remove(id);
                info!(unit = id, attempt = report.attempt, "unit verified");
                wave.summary.add_result(UnitResult::verified(
                    id,
                    wave.attempts(id),
                    response.artifacts.clone(),
                    wave.elapsed(id),
                ));
                self.emit(EngineEvent::UnitVerified {
                    unit: id.to_string(),
                    artifacts: response.artifacts,
                })
                .await;
            }
            Verdict::CorrectionsNeeded => {
                self.advance(
                    scheduler,
                    id,
                    UnitStatus::CorrectionsRequested,
                    Some(EntryDetail::Failure {
                        error: ErrorKind::VerificationFailure,
                        findings: report.findings.clone(),
                    }),
                )?;
                info!(unit = id, attempt = report.attempt, findings = report.findings.len(), "corrections requested");
                wave.findings
                    .insert(id.to_string(), report.findings.clone());
                wave.to_park.push(id.to_string());
                self.emit(EngineEvent::CorrectionsRequested {
                    unit: id.to_string(),
                    attempt: report.attempt,
                    findings: report.findings,
                })
                .await;
            }
            Verdict::Escalate => {
                self.fail(scheduler, wave, id, failure, report.findings)
                    .await?;
            }
        }
        Ok(())
    }

    /// Mark a unit failed and raise a blocker on its phase.
    async fn fail(
        &self,
        scheduler: &mut DagScheduler,
        wave: &mut WaveRun,
        id: &str,
        error: ErrorKind,
        findings: Vec<String>,
    ) -> Result<(), OrchestratorError> {
        self.advance(
            scheduler,
            id,
            UnitStatus::Failed,
            Some(EntryDetail::Failure {
                error,
                findings: findings.clone(),
            }),
        )?;

        let phase = scheduler
            .get_unit(id)
            .map(|u| u.phase.clone())
            .unwrap_or_else(|| wave.plan.phase.clone());
        let mut blocker = vec![format!("unit {} failed: {}", id, error)];
        blocker.extend(findings.iter().cloned());
        self.gates.raise_blocker(&phase, error, blocker)?;

        error!(unit = id, error = %error, findings = ?findings, "unit failed");
        wave.findings.remove(id);
        wave.summary.add_result(UnitResult::failed(
            id,
            wave.attempts(id),
            error,
            findings.clone(),
            wave.elapsed(id),
        ));
        self.emit(EngineEvent::UnitFailed {
            unit: id.to_string(),
            error,
            findings,
        })
        .await;
        Ok(())
    }
}

/// One dispatch: acquire leases, run the worker, report back.
async fn run_task(
    worker: Arc<dyn Worker>,
    guard: Arc<OwnershipGuard>,
    request: TaskRequest,
    scopes: Vec<String>,
    expires: tokio::time::Instant,
    mut cancel: oneshot::Receiver<()>,
    tx: mpsc::UnboundedSender<TaskMessage>,
) {
    let unit = request.unit.clone();

    let work = async {
        let leases = match guard.acquire_all(&scopes, &unit).await {
            Ok(leases) => leases,
            Err(e) => return TaskOutcome::Conflict(e),
        };
        tx.send(TaskMessage::Leased {
            unit: unit.clone(),
            scopes: leases.into_iter().map(|l| l.scope).collect(),
        })
        .ok();
        tx.send(TaskMessage::Started { unit: unit.clone() }).ok();

        match AssertUnwindSafe(worker.run(request)).catch_unwind().await {
            Ok(Ok(response)) => TaskOutcome::Responded(response),
            Ok(Err(e)) => TaskOutcome::WorkerError(format!("{:#}", e)),
            Err(_) => TaskOutcome::WorkerError("worker panicked".to_string()),
        }
    };

    let outcome = tokio::select! {
        result = tokio::time::timeout_at(expires, work) => result.unwrap_or(TaskOutcome::TimedOut),
        Ok(()) = &mut cancel => TaskOutcome::Aborted,
    };

    tx.send(TaskMessage::Finished { unit, outcome }).ok();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escalation::{AdoptDescription, GuidanceStore};
    use crate::orchestrator::worker::TaskResponse;
    use crate::unit::{PhaseDef, UnitSpec, WorkerRole};
    use crate::verification::ArtifactManifest;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Succeeds with a manifest that satisfies the unit's declared interface.
    struct Compliant {
        running: AtomicUsize,
        peak: AtomicUsize,
        delay: Duration,
    }

    impl Compliant {
        fn new(delay: Duration) -> Self {
            Self {
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                delay,
            }
        }
    }

    #[async_trait]
    impl Worker for Compliant {
        async fn run(&self, request: TaskRequest) -> Result<TaskResponse> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(TaskResponse::success(
                vec![format!("{}.out", request.unit)],
                ArtifactManifest {
                    symbols: vec![request.unit.to_lowercase()],
                    ..Default::default()
                },
            ))
        }
    }

    struct Sleeper;

    #[async_trait]
    impl Worker for Sleeper {
        async fn run(&self, _request: TaskRequest) -> Result<TaskResponse> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(TaskResponse::failure(vec![]))
        }
    }

    struct Broken;

    #[async_trait]
    impl Worker for Broken {
        async fn run(&self, _request: TaskRequest) -> Result<TaskResponse> {
            Ok(TaskResponse::failure(vec!["compiler crashed".into()]))
        }
    }

    fn unit(id: &str, deps: Vec<&str>) -> WorkUnit {
        WorkUnit::new(id, "core", deps.into_iter().map(String::from).collect())
            .in_phase("build")
            .with_spec(UnitSpec {
                interface: vec![id.to_lowercase()],
                ..Default::default()
            })
    }

    struct Fixture {
        ledger: Ledger,
        dispatcher: Dispatcher,
        scheduler: DagScheduler,
    }

    fn fixture(units: Vec<WorkUnit>, worker: Arc<dyn Worker>, config: DagConfig) -> Fixture {
        let ledger = Ledger::in_memory();
        for u in &units {
            ledger
                .append(Transition::unit(&u.id, None, UnitStatus::Pending))
                .unwrap();
        }
        let store = Arc::new(GuidanceStore::new());
        let queue = Arc::new(
            EscalationQueue::spawn(store, ledger.clone(), Arc::new(AdoptDescription)).unwrap(),
        );
        let gates = PhaseGateController::new(
            ledger.clone(),
            vec![PhaseDef::new("build", "Build").with_units(units.clone())],
        );
        let dispatcher = Dispatcher::new(
            ledger.clone(),
            Arc::new(OwnershipGuard::new()),
            queue,
            WorkerPool::new().with_fallback(worker),
            gates,
            config.clone(),
        );
        let scheduler = DagScheduler::from_units(&units, config).unwrap();
        Fixture {
            ledger,
            dispatcher,
            scheduler,
        }
    }

    fn plan(index: usize, units: &[&str]) -> WavePlan {
        WavePlan {
            phase: "build".into(),
            index,
            units: units.iter().map(|s| s.to_string()).collect(),
            resumed: false,
        }
    }

    #[tokio::test]
    async fn test_wave_verifies_units_and_records_ledger() {
        let mut f = fixture(
            vec![unit("A", vec![]), unit("B", vec![])],
            Arc::new(Compliant::new(Duration::from_millis(5))),
            DagConfig::default(),
        );
        let summary = f
            .dispatcher
            .run_wave(&mut f.scheduler, plan(0, &["A", "B"]))
            .await
            .unwrap();

        assert!(summary.all_success());
        assert_eq!(summary.verified, 2);
        let view = f.ledger.view().unwrap();
        assert_eq!(view.unit_status("A"), Some(UnitStatus::Verified));
        assert_eq!(view.unit("B").unwrap().artifacts, vec!["B.out"]);
        assert!(view.waves[0].completed);
        assert_eq!(view.unit("A").unwrap().guidance.get("core"), Some(&1));
    }

    #[tokio::test]
    async fn test_concurrency_limit_is_respected() {
        let worker = Arc::new(Compliant::new(Duration::from_millis(20)));
        let units: Vec<WorkUnit> = ["A", "B", "C", "D", "E"]
            .iter()
            .map(|id| unit(id, vec![]))
            .collect();
        let mut f = fixture(
            units,
            worker.clone(),
            DagConfig::default().with_max_parallel(2),
        );
        let summary = f
            .dispatcher
            .run_wave(&mut f.scheduler, plan(0, &["A", "B", "C", "D", "E"]))
            .await
            .unwrap();
        assert_eq!(summary.verified, 5);
        assert!(worker.peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_repeat_timeout_fails_unit() {
        let mut f = fixture(
            vec![unit("A", vec![])],
            Arc::new(Sleeper),
            DagConfig::default().with_unit_timeout_secs(0),
        );
        let summary = f
            .dispatcher
            .run_wave(&mut f.scheduler, plan(0, &["A"]))
            .await
            .unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.results[0].error, Some(ErrorKind::Timeout));
        let view = f.ledger.view().unwrap();
        let record = view.unit("A").unwrap();
        assert_eq!(record.status, UnitStatus::Failed);
        assert_eq!(record.attempts, 2);
        assert_eq!(view.open_blockers("build").len(), 1);
    }

    #[tokio::test]
    async fn test_worker_failure_escalates_without_corrections() {
        let mut f = fixture(
            vec![unit("A", vec![])],
            Arc::new(Broken),
            DagConfig::default(),
        );
        let summary = f
            .dispatcher
            .run_wave(&mut f.scheduler, plan(0, &["A"]))
            .await
            .unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.results[0].error, Some(ErrorKind::WorkerFailure));
        assert_eq!(summary.results[0].findings, vec!["compiler crashed"]);
        let view = f.ledger.view().unwrap();
        let record = view.unit("A").unwrap();
        assert_eq!(record.status, UnitStatus::Failed);
        assert_eq!(record.attempts, 1);
        assert_eq!(view.open_blockers("build")[0].error, ErrorKind::WorkerFailure);
    }

    #[tokio::test]
    async fn test_abort_fails_unit_and_releases_leases() {
        let u = unit("A", vec![]).with_scopes(vec!["modules/auth".into()]);
        let mut f = fixture(vec![u], Arc::new(Sleeper), DagConfig::default());
        let handle = f.dispatcher.abort_handle();
        let guard = f.dispatcher.guard.clone();

        let aborter = tokio::spawn(async move {
            while guard.holder_of("modules/auth").is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            handle.abort("A")
        });

        let summary = f
            .dispatcher
            .run_wave(&mut f.scheduler, plan(0, &["A"]))
            .await
            .unwrap();
        assert!(aborter.await.unwrap());
        assert_eq!(summary.results[0].error, Some(ErrorKind::Aborted));
        assert!(f.dispatcher.guard.leases().is_empty());
        assert!(f.ledger.view().unwrap().leases.is_empty());
    }

    #[tokio::test]
    async fn test_missing_worker_is_reported_before_dispatch() {
        let ledger = Ledger::in_memory();
        let units = vec![unit("A", vec![]).with_role(WorkerRole::Scout)];
        let store = Arc::new(GuidanceStore::new());
        let queue = Arc::new(
            EscalationQueue::spawn(store, ledger.clone(), Arc::new(AdoptDescription)).unwrap(),
        );
        let dispatcher = Dispatcher::new(
            ledger.clone(),
            Arc::new(OwnershipGuard::new()),
            queue,
            WorkerPool::new(),
            PhaseGateController::new(ledger.clone(), vec![PhaseDef::new("build", "Build")]),
            DagConfig::default(),
        );
        let mut scheduler = DagScheduler::from_units(&units, DagConfig::default()).unwrap();
        let err = dispatcher
            .run_wave(&mut scheduler, plan(0, &["A"]))
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::NoWorker(_)));
        assert!(ledger.is_empty());
    }
}
