//! Phase gates: the human-approved boundaries between pipeline phases.
//!
//! Gate status is always read back from the ledger, so an approval given by
//! `stagehand gate approve` while no engine was running is seen by the next run.

use anyhow::Result;
use async_trait::async_trait;
use dialoguer::{Input, Select, theme::ColorfulTheme};
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::{Mutex, mpsc};
use tracing::{info, warn};
use uuid::Uuid;

use crate::errors::{ErrorKind, GateError, OrchestratorError};
use crate::ledger::{
    ACTOR_ENGINE, EntityKind, EntryDetail, Ledger, Transition, checklist_key, status,
};
use crate::unit::PhaseDef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateStatus {
    #[default]
    NotStarted,
    InProgress,
    AwaitingApproval,
    Approved,
    Blocked,
}

impl GateStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::InProgress => "in_progress",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Approved => "approved",
            Self::Blocked => "blocked",
        }
    }

    /// Forward-only gate transitions. `Approved -> InProgress` is not in
    /// the table; only `PhaseGateController::reopen` can take it.
    pub fn can_transition_to(&self, next: GateStatus) -> bool {
        use GateStatus::*;
        matches!(
            (self, next),
            (NotStarted, InProgress)
                | (InProgress, AwaitingApproval)
                | (AwaitingApproval, Approved)
                | (AwaitingApproval, Blocked)
                | (Blocked, InProgress)
        )
    }
}

impl fmt::Display for GateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for GateStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "not_started" => Self::NotStarted,
            "in_progress" => Self::InProgress,
            "awaiting_approval" => Self::AwaitingApproval,
            "approved" => Self::Approved,
            "blocked" => Self::Blocked,
            other => anyhow::bail!("Invalid gate status '{}'", other),
        })
    }
}

/// An external approve/reject decision with free-text comments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalSignal {
    pub approve: bool,
    #[serde(default)]
    pub comments: String,
}

impl ApprovalSignal {
    pub fn approve(comments: &str) -> Self {
        Self {
            approve: true,
            comments: comments.to_string(),
        }
    }

    pub fn reject(comments: &str) -> Self {
        Self {
            approve: false,
            comments: comments.to_string(),
        }
    }
}

/// Where approval signals come from.
#[async_trait]
pub trait ApprovalSource: Send + Sync {
    /// Wait for a decision on `phase`. `None` means no decision is available
    /// in this process and the gate should stay `AwaitingApproval`.
    async fn await_signal(&self, phase: &PhaseDef, summary: &str) -> Result<Option<ApprovalSignal>>;
}

/// Signals delivered over an in-process channel.
pub struct ChannelApprovals {
    rx: Mutex<mpsc::Receiver<ApprovalSignal>>,
}

impl ChannelApprovals {
    pub fn new() -> (Self, mpsc::Sender<ApprovalSignal>) {
        let (tx, rx) = mpsc::channel(16);
        (Self { rx: Mutex::new(rx) }, tx)
    }
}

#[async_trait]
impl ApprovalSource for ChannelApprovals {
    async fn await_signal(&self, _phase: &PhaseDef, _summary: &str) -> Result<Option<ApprovalSignal>> {
        // a closed channel means nobody can answer in-process
        Ok(self.rx.lock().await.recv().await)
    }
}

/// Asks on the terminal.
#[derive(Debug, Default, Clone, Copy)]
pub struct PromptApprovals;

#[async_trait]
impl ApprovalSource for PromptApprovals {
    async fn await_signal(&self, phase: &PhaseDef, summary: &str) -> Result<Option<ApprovalSignal>> {
        let title = format!("Approve phase '{}' ({})?", phase.name, phase.id);
        let summary = summary.to_string();
        let signal = tokio::task::spawn_blocking(move || -> Result<Option<ApprovalSignal>> {
            println!("{}", summary);
            let options = &["Approve", "Reject", "Decide later"];
            let selection = Select::with_theme(&ColorfulTheme::default())
                .with_prompt(title)
                .items(options)
                .default(0)
                .interact()?;
            if selection == 2 {
                return Ok(None);
            }
            let comments: String = Input::with_theme(&ColorfulTheme::default())
                .with_prompt("Comments")
                .allow_empty(true)
                .interact_text()?;
            Ok(Some(ApprovalSignal {
                approve: selection == 0,
                comments,
            }))
        })
        .await??;
        Ok(signal)
    }
}

/// Never answers; the gate is left for `stagehand gate approve|reject`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DetachedApprovals;

#[async_trait]
impl ApprovalSource for DetachedApprovals {
    async fn await_signal(&self, _phase: &PhaseDef, _summary: &str) -> Result<Option<ApprovalSignal>> {
        Ok(None)
    }
}

/// FSM over the ordered phases of a plan.
#[derive(Debug, Clone)]
pub struct PhaseGateController {
    ledger: Ledger,
    phases: Vec<PhaseDef>,
}

impl PhaseGateController {
    pub fn new(ledger: Ledger, phases: Vec<PhaseDef>) -> Self {
        Self { ledger, phases }
    }

    pub fn phases(&self) -> &[PhaseDef] {
        &self.phases
    }

    fn position(&self, phase: &str) -> Result<usize, GateError> {
        self.phases
            .iter()
            .position(|p| p.id == phase)
            .ok_or_else(|| GateError::UnknownPhase(phase.to_string()))
    }

    pub fn status(&self, phase: &str) -> Result<GateStatus, OrchestratorError> {
        self.position(phase)?;
        let last = self.ledger.last_for(EntityKind::Phase, phase)?;
        match last {
            Some(entry) => Ok(entry
                .new_status
                .parse()
                .map_err(OrchestratorError::Other)?),
            None => Ok(GateStatus::NotStarted),
        }
    }

    fn move_to(
        &self,
        phase: &str,
        to: GateStatus,
        actor: &str,
        detail: Option<EntryDetail>,
    ) -> Result<GateStatus, OrchestratorError> {
        let from = self.status(phase)?;
        if !from.can_transition_to(to) {
            return Err(GateError::InvalidTransition {
                phase: phase.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            }
            .into());
        }
        self.record(phase, from, to, actor, detail)?;
        Ok(from)
    }

    fn record(
        &self,
        phase: &str,
        from: GateStatus,
        to: GateStatus,
        actor: &str,
        detail: Option<EntryDetail>,
    ) -> Result<(), OrchestratorError> {
        let mut t = Transition::new(EntityKind::Phase, phase, Some(from.as_str()), to.as_str()).by(actor);
        if let Some(d) = detail {
            t = t.with_detail(d);
        }
        self.ledger.append(t)?;
        info!(phase, from = %from, to = %to, actor, "phase gate transition");
        Ok(())
    }

    /// Begin a phase. Every earlier phase must be approved. Returns `false`
    /// when the phase was already in progress.
    pub fn start(&self, phase: &str) -> Result<bool, OrchestratorError> {
        let pos = self.position(phase)?;
        if let Some(previous) = self.phases[..pos].iter().rev().find(|p| {
            !matches!(self.status(&p.id), Ok(GateStatus::Approved))
        }) {
            return Err(GateError::OutOfOrder {
                phase: phase.to_string(),
                previous: previous.id.clone(),
            }
            .into());
        }
        if self.status(phase)? == GateStatus::InProgress {
            return Ok(false);
        }
        self.move_to(phase, GateStatus::InProgress, ACTOR_ENGINE, None)?;
        Ok(true)
    }

    /// Close a checklist item. Returns `false` when it was already closed.
    pub fn complete_checklist_item(
        &self,
        phase: &str,
        item: &str,
        actor: &str,
    ) -> Result<bool, OrchestratorError> {
        let pos = self.position(phase)?;
        if !self.phases[pos].checklist.iter().any(|c| c.id == item) {
            return Err(GateError::UnknownChecklistItem {
                phase: phase.to_string(),
                item: item.to_string(),
            }
            .into());
        }
        let key = checklist_key(phase, item);
        if self.is_item_done(&key)? {
            return Ok(false);
        }
        self.ledger.append(
            Transition::new(EntityKind::Checklist, &key, Some(status::OPEN), status::DONE).by(actor),
        )?;
        info!(phase, item, actor, "checklist item closed");
        Ok(true)
    }

    fn is_item_done(&self, key: &str) -> Result<bool, OrchestratorError> {
        Ok(self
            .ledger
            .last_for(EntityKind::Checklist, key)?
            .is_some_and(|e| e.new_status == status::DONE))
    }

    /// Checklist items not yet closed, in declaration order.
    pub fn open_checklist_items(&self, phase: &str) -> Result<Vec<String>, OrchestratorError> {
        let pos = self.position(phase)?;
        let mut open = Vec::new();
        for item in &self.phases[pos].checklist {
            if !self.is_item_done(&checklist_key(phase, &item.id))? {
                open.push(item.id.clone());
            }
        }
        Ok(open)
    }

    /// `InProgress -> AwaitingApproval`, once every unit is verified and
    /// every checklist item is closed.
    pub fn request_approval(
        &self,
        phase: &str,
        unverified_units: &[String],
    ) -> Result<(), OrchestratorError> {
        if !unverified_units.is_empty() {
            return Err(GateError::UnitsOutstanding {
                phase: phase.to_string(),
                units: unverified_units.to_vec(),
            }
            .into());
        }
        if let Some(item) = self.open_checklist_items(phase)?.into_iter().next() {
            return Err(GateError::ChecklistOpen {
                phase: phase.to_string(),
                item,
            }
            .into());
        }
        self.move_to(phase, GateStatus::AwaitingApproval, ACTOR_ENGINE, None)?;
        Ok(())
    }

    /// Apply an external decision to a phase that is awaiting approval.
    pub fn apply_signal(
        &self,
        phase: &str,
        signal: &ApprovalSignal,
        actor: &str,
    ) -> Result<GateStatus, OrchestratorError> {
        let detail = EntryDetail::Approval {
            approved: signal.approve,
            comments: signal.comments.clone(),
        };
        if signal.approve {
            self.move_to(phase, GateStatus::Approved, actor, Some(detail))?;
            return Ok(GateStatus::Approved);
        }

        self.move_to(phase, GateStatus::Blocked, actor, Some(detail))?;
        self.raise_blocker(
            phase,
            ErrorKind::HumanRejection,
            vec![signal.comments.clone()],
        )?;
        warn!(phase, comments = %signal.comments, "phase rejected");
        Ok(GateStatus::Blocked)
    }

    /// Record a blocking condition against a phase.
    pub fn raise_blocker(
        &self,
        phase: &str,
        error: ErrorKind,
        findings: Vec<String>,
    ) -> Result<String, OrchestratorError> {
        let id = Uuid::new_v4().to_string();
        self.ledger.append(
            Transition::new(EntityKind::Blocker, &id, None, status::OPEN).with_detail(
                EntryDetail::Blocker {
                    phase: phase.to_string(),
                    error,
                    findings,
                },
            ),
        )?;
        Ok(id)
    }

    /// Resolve every open blocker of a phase.
    pub fn resolve_blockers(&self, phase: &str, actor: &str) -> Result<usize, OrchestratorError> {
        let view = self.ledger.view()?;
        let open: Vec<String> = view
            .open_blockers(phase)
            .into_iter()
            .map(|b| b.id.clone())
            .collect();
        for id in &open {
            self.ledger.append(
                Transition::new(EntityKind::Blocker, id, Some(status::OPEN), status::RESOLVED)
                    .by(actor),
            )?;
        }
        Ok(open.len())
    }

    /// `Blocked -> InProgress` once corrective units have been queued.
    pub fn resume(&self, phase: &str, actor: &str) -> Result<(), OrchestratorError> {
        self.move_to(phase, GateStatus::InProgress, actor, None)?;
        self.resolve_blockers(phase, actor)?;
        Ok(())
    }

    /// Explicitly reopen the most recently approved phase.
    pub fn reopen(&self, phase: &str, reason: &str, actor: &str) -> Result<(), OrchestratorError> {
        let pos = self.position(phase)?;
        let current = self.status(phase)?;
        if current != GateStatus::Approved {
            return Err(GateError::InvalidTransition {
                phase: phase.to_string(),
                from: current.to_string(),
                to: GateStatus::InProgress.to_string(),
            }
            .into());
        }
        for later in &self.phases[pos + 1..] {
            if self.status(&later.id)? != GateStatus::NotStarted {
                return Err(GateError::ReopenNotLatest {
                    phase: phase.to_string(),
                    later: later.id.clone(),
                }
                .into());
            }
        }
        self.record(
            phase,
            GateStatus::Approved,
            GateStatus::InProgress,
            actor,
            Some(EntryDetail::Note {
                text: format!("reopened: {}", reason),
            }),
        )
    }
}
