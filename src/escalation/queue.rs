//! Serial application of escalations to guidance.
//!
//! Submitters get a queue position back immediately. A single consumer task
//! drains the queue in position order, asks the `RulingAuthority` for a
//! ruling, and applies it to the domain's guidance. Because there is exactly
//! one consumer, two escalations on the same domain can never interleave and
//! versions follow submission order.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::guidance::{GuidanceSnapshot, GuidanceStore};
use crate::errors::LedgerError;
use crate::ledger::{
    ACTOR_ESCALATION, EntityKind, EntryDetail, EscalationRecord, Ledger, Transition, status,
};

/// A report of a situation the current guidance does not cover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationRequest {
    pub id: String,
    /// Unit (or `human`) that raised it
    pub raised_by: String,
    pub domain: String,
    pub description: String,
    pub submitted_at: DateTime<Utc>,
}

impl EscalationRequest {
    pub fn new(raised_by: &str, domain: &str, description: &str) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            raised_by: raised_by.to_string(),
            domain: domain.to_string(),
            description: description.to_string(),
            submitted_at: Utc::now(),
        }
    }
}

impl From<&EscalationRecord> for EscalationRequest {
    fn from(record: &EscalationRecord) -> Self {
        Self {
            id: record.id.clone(),
            raised_by: record.raised_by.clone(),
            domain: record.domain.clone(),
            description: record.description.clone(),
            submitted_at: record.submitted_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationAck {
    pub id: String,
    pub position: u64,
}

/// Decides how an escalation changes a domain's guidance.
#[async_trait]
pub trait RulingAuthority: Send + Sync {
    async fn rule(
        &self,
        request: &EscalationRequest,
        current: &GuidanceSnapshot,
    ) -> anyhow::Result<String>;
}

/// Adopts the escalation's description verbatim as the ruling.
#[derive(Debug, Default, Clone, Copy)]
pub struct AdoptDescription;

#[async_trait]
impl RulingAuthority for AdoptDescription {
    async fn rule(
        &self,
        request: &EscalationRequest,
        _current: &GuidanceSnapshot,
    ) -> anyhow::Result<String> {
        Ok(request.description.clone())
    }
}

struct Queued {
    request: EscalationRequest,
    position: u64,
}

/// Append the submission entry for an escalation.
pub fn record_submission(
    ledger: &Ledger,
    request: &EscalationRequest,
    position: u64,
) -> Result<(), LedgerError> {
    ledger.append(
        Transition::new(EntityKind::Escalation, &request.id, None, status::SUBMITTED)
            .by(&request.raised_by)
            .with_detail(EntryDetail::Escalation {
                position,
                domain: request.domain.clone(),
                description: request.description.clone(),
                raised_by: request.raised_by.clone(),
            }),
    )?;
    Ok(())
}

pub struct EscalationQueue {
    tx: mpsc::UnboundedSender<Queued>,
    /// Next position; held while recording and sending so positions and
    /// channel order agree
    next_position: Mutex<u64>,
    ledger: Ledger,
    store: Arc<GuidanceStore>,
    pending: watch::Sender<HashMap<String, usize>>,
    consumer: Mutex<Option<JoinHandle<()>>>,
}

impl EscalationQueue {
    /// Start the consumer task. Must be called inside a tokio runtime.
    pub fn spawn(
        store: Arc<GuidanceStore>,
        ledger: Ledger,
        authority: Arc<dyn RulingAuthority>,
    ) -> Result<Self, LedgerError> {
        let next_position = ledger.view()?.next_escalation_position();
        let (tx, rx) = mpsc::unbounded_channel();
        let (pending, _) = watch::channel(HashMap::new());

        let consumer = tokio::spawn(consume(
            rx,
            store.clone(),
            ledger.clone(),
            authority,
            pending.clone(),
        ));

        Ok(Self {
            tx,
            next_position: Mutex::new(next_position),
            ledger,
            store,
            pending,
            consumer: Mutex::new(Some(consumer)),
        })
    }

    pub fn store(&self) -> &Arc<GuidanceStore> {
        &self.store
    }

    /// Enqueue a new escalation.
    pub fn submit(&self, request: EscalationRequest) -> Result<EscalationAck, LedgerError> {
        let mut next = self
            .next_position
            .lock()
            .map_err(|_| LedgerError::LockPoisoned)?;
        let position = *next;
        record_submission(&self.ledger, &request, position)?;
        *next += 1;

        info!(
            escalation = %request.id,
            domain = %request.domain,
            raised_by = %request.raised_by,
            position,
            "escalation submitted"
        );
        let ack = EscalationAck {
            id: request.id.clone(),
            position,
        };
        self.enqueue(request, position);
        Ok(ack)
    }

    /// Re-enqueue a submission found unapplied in the ledger.
    pub fn resubmit(&self, record: &EscalationRecord) {
        debug!(escalation = %record.id, position = record.position, "escalation re-enqueued");
        self.enqueue(EscalationRequest::from(record), record.position);
    }

    fn enqueue(&self, request: EscalationRequest, position: u64) {
        let domain = request.domain.clone();
        self.pending.send_modify(|m| *m.entry(domain.clone()).or_default() += 1);
        if self.tx.send(Queued { request, position }).is_err() {
            error!(domain = %domain, "escalation consumer stopped, submission stays pending in the ledger");
            self.pending.send_modify(|m| decrement(m, &domain));
        }
    }

    /// Number of escalations not yet applied for a domain.
    pub fn pending(&self, domain: &str) -> usize {
        self.pending.borrow().get(domain).copied().unwrap_or(0)
    }

    /// Wait until no escalation for `domain` is queued or being applied.
    pub async fn settled(&self, domain: &str) {
        let mut rx = self.pending.subscribe();
        // the sender lives as long as self, so this cannot fail
        let _ = rx
            .wait_for(|m| m.get(domain).copied().unwrap_or(0) == 0)
            .await;
    }

    /// Wait until every domain is settled.
    pub async fn drain(&self) {
        let mut rx = self.pending.subscribe();
        let _ = rx.wait_for(|m| m.values().all(|&n| n == 0)).await;
    }

    /// Stop the consumer after it finishes what is already queued.
    pub async fn shutdown(self) {
        let handle = self
            .consumer
            .lock()
            .ok()
            .and_then(|mut h| h.take());
        drop(self.tx);
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            warn!(error = %e, "escalation consumer ended abnormally");
        }
    }
}

fn decrement(map: &mut HashMap<String, usize>, domain: &str) {
    if let Some(n) = map.get_mut(domain) {
        *n = n.saturating_sub(1);
    }
}

async fn consume(
    mut rx: mpsc::UnboundedReceiver<Queued>,
    store: Arc<GuidanceStore>,
    ledger: Ledger,
    authority: Arc<dyn RulingAuthority>,
    pending: watch::Sender<HashMap<String, usize>>,
) {
    while let Some(Queued { request, position }) = rx.recv().await {
        if let Err(e) = apply_one(&store, &ledger, authority.as_ref(), &request).await {
            // leave it unapplied in the ledger; the next run picks it up again
            error!(
                escalation = %request.id,
                domain = %request.domain,
                position,
                error = %e,
                "failed to apply escalation"
            );
            let _ = ledger.append(
                Transition::new(
                    EntityKind::Escalation,
                    &request.id,
                    Some(status::SUBMITTED),
                    status::SUBMITTED,
                )
                .by(ACTOR_ESCALATION)
                .with_detail(EntryDetail::Note {
                    text: e.to_string(),
                }),
            );
        }
        pending.send_modify(|m| decrement(m, &request.domain));
    }
    debug!("escalation consumer finished");
}

async fn apply_one(
    store: &GuidanceStore,
    ledger: &Ledger,
    authority: &dyn RulingAuthority,
    request: &EscalationRequest,
) -> anyhow::Result<()> {
    if ledger
        .last_for(EntityKind::Escalation, &request.id)?
        .is_some_and(|e| e.new_status == status::APPLIED)
    {
        debug!(escalation = %request.id, "escalation already applied, skipped");
        return Ok(());
    }
    // the ruling landed but the engine stopped before marking it applied
    if has_ruling(ledger, &request.domain, &request.id)? {
        mark_applied(ledger, &request.id)?;
        info!(escalation = %request.id, domain = %request.domain, "ruling already recorded, marked applied");
        return Ok(());
    }
    store.ensure_domain(&request.domain, ledger)?;
    let current = store
        .snapshot(&request.domain)
        .ok_or_else(|| anyhow::anyhow!("guidance domain '{}' vanished", request.domain))?;

    let ruling = authority.rule(request, &current).await?;

    store.apply_ruling(
        ledger,
        &request.domain,
        &request.id,
        &request.raised_by,
        &ruling,
    )?;
    mark_applied(ledger, &request.id)?;
    Ok(())
}

fn has_ruling(ledger: &Ledger, domain: &str, escalation: &str) -> Result<bool, LedgerError> {
    Ok(ledger
        .entries_for(EntityKind::Guidance, domain)?
        .iter()
        .any(|e| matches!(&e.detail, Some(EntryDetail::Ruling { escalation: id, .. }) if id == escalation)))
}

fn mark_applied(ledger: &Ledger, escalation: &str) -> Result<(), LedgerError> {
    ledger.append(
        Transition::new(
            EntityKind::Escalation,
            escalation,
            Some(status::SUBMITTED),
            status::APPLIED,
        )
        .by(ACTOR_ESCALATION),
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn queue(ledger: &Ledger) -> EscalationQueue {
        EscalationQueue::spawn(
            Arc::new(GuidanceStore::new()),
            ledger.clone(),
            Arc::new(AdoptDescription),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_submit_returns_increasing_positions() {
        let ledger = Ledger::in_memory();
        let q = queue(&ledger);
        let a = q
            .submit(EscalationRequest::new("A", "errors", "E1"))
            .unwrap();
        let b = q
            .submit(EscalationRequest::new("B", "errors", "E2"))
            .unwrap();
        assert_eq!(a.position, 1);
        assert_eq!(b.position, 2);
        q.drain().await;
    }

    #[tokio::test]
    async fn test_versions_follow_submission_order() {
        let ledger = Ledger::in_memory();
        let q = queue(&ledger);
        q.store().ensure_domain("errors", &ledger).unwrap();
        let before = q.store().version("errors");

        q.submit(EscalationRequest::new("A", "errors", "E1")).unwrap();
        q.submit(EscalationRequest::new("B", "errors", "E2")).unwrap();
        timeout(Duration::from_secs(2), q.settled("errors"))
            .await
            .unwrap();

        let snap = q.store().snapshot("errors").unwrap();
        assert_eq!(snap.version, before + 2);
        assert_eq!(snap.rulings, vec!["E1", "E2"]);

        let view = ledger.view().unwrap();
        assert!(view.pending_escalations().is_empty());
        assert_eq!(view.guidance["errors"].rulings, vec!["E1", "E2"]);
    }

    #[tokio::test]
    async fn test_concurrent_submitters_keep_gap_free_versions() {
        let ledger = Ledger::in_memory();
        let q = Arc::new(queue(&ledger));
        let mut handles = Vec::new();
        for i in 0..10 {
            let q = q.clone();
            handles.push(tokio::spawn(async move {
                q.submit(EscalationRequest::new(&format!("U{}", i), "errors", &format!("E{}", i)))
                    .unwrap()
            }));
        }
        let mut acks = Vec::new();
        for h in handles {
            acks.push(h.await.unwrap());
        }
        timeout(Duration::from_secs(2), q.drain()).await.unwrap();

        acks.sort_by_key(|a| a.position);
        let view = ledger.view().unwrap();
        let applied: Vec<String> = view.guidance["errors"].rulings.clone();
        assert_eq!(applied.len(), 10);
        assert_eq!(view.guidance_version("errors"), Some(11));

        // rulings appear in position order
        let by_position: Vec<String> = acks
            .iter()
            .map(|a| {
                view.escalations
                    .iter()
                    .find(|e| e.id == a.id)
                    .unwrap()
                    .description
                    .clone()
            })
            .collect();
        assert_eq!(applied, by_position);
    }

    struct Refuse;

    #[async_trait]
    impl RulingAuthority for Refuse {
        async fn rule(
            &self,
            _request: &EscalationRequest,
            _current: &GuidanceSnapshot,
        ) -> anyhow::Result<String> {
            anyhow::bail!("authority unavailable")
        }
    }

    #[tokio::test]
    async fn test_failed_ruling_stays_pending_in_ledger() {
        let ledger = Ledger::in_memory();
        let q = EscalationQueue::spawn(Arc::new(GuidanceStore::new()), ledger.clone(), Arc::new(Refuse))
            .unwrap();
        q.submit(EscalationRequest::new("A", "errors", "E1")).unwrap();
        timeout(Duration::from_secs(2), q.settled("errors"))
            .await
            .unwrap();

        let view = ledger.view().unwrap();
        assert_eq!(view.pending_escalations().len(), 1);
        assert_eq!(q.store().version("errors"), 1);
    }

    #[tokio::test]
    async fn test_resubmit_applies_ledger_backlog() {
        let ledger = Ledger::in_memory();
        let offline = EscalationRequest::new("human", "errors", "from cli");
        record_submission(&ledger, &offline, 1).unwrap();

        let q = queue(&ledger);
        let view = ledger.view().unwrap();
        for record in view.pending_escalations() {
            q.resubmit(record);
        }
        timeout(Duration::from_secs(2), q.settled("errors"))
            .await
            .unwrap();
        assert_eq!(q.store().snapshot("errors").unwrap().rulings, vec!["from cli"]);

        let next = q
            .submit(EscalationRequest::new("A", "errors", "later"))
            .unwrap();
        assert_eq!(next.position, 2);
        q.shutdown().await;
    }

    #[tokio::test]
    async fn test_recorded_ruling_is_not_applied_twice() {
        let ledger = Ledger::in_memory();
        let request = EscalationRequest::new("A", "errors", "E1");
        record_submission(&ledger, &request, 1).unwrap();
        let store = GuidanceStore::new();
        store.ensure_domain("errors", &ledger).unwrap();
        // stopped between the ruling and the applied marker
        store
            .apply_ruling(&ledger, "errors", &request.id, "A", "E1")
            .unwrap();

        let view = ledger.view().unwrap();
        assert!(view.pending_escalations().is_empty());

        let q = EscalationQueue::spawn(
            Arc::new(GuidanceStore::from_view(&view)),
            ledger.clone(),
            Arc::new(AdoptDescription),
        )
        .unwrap();
        let record = view.escalations[0].clone();
        q.resubmit(&record);
        timeout(Duration::from_secs(2), q.drain()).await.unwrap();
        q.shutdown().await;

        let view = ledger.view().unwrap();
        assert_eq!(view.guidance["errors"].version, 2);
        assert_eq!(view.guidance["errors"].rulings, vec!["E1"]);
        assert_eq!(
            ledger
                .last_for(EntityKind::Escalation, &request.id)
                .unwrap()
                .unwrap()
                .new_status,
            status::APPLIED
        );
    }
}
