//! Exclusive write leases over hierarchical resource scopes.
//!
//! Scopes are path-like strings (`modules/auth`, `modules/auth/session`).
//! Two scopes overlap when they are equal or one is a segment-wise prefix of
//! the other, and overlapping scopes can only be leased by one holder at a
//! time. Requests that cannot be granted wait in a FIFO queue; a later
//! request never overtakes an earlier one it overlaps with.
//!
//! A unit's whole scope set is acquired with `acquire_all`, which grants
//! everything at once or waits as a single request, so two units with
//! intersecting scope sets cannot deadlock by each holding half.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::errors::ResourceConflictError;

/// A live exclusive lease on one scope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLease {
    pub scope: String,
    pub holder: String,
    pub acquired_at: DateTime<Utc>,
}

/// Collapse repeated and trailing separators: `/modules//auth/` -> `modules/auth`.
pub fn normalize_scope(scope: &str) -> String {
    scope
        .split('/')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Whether two normalized scopes overlap (equal, ancestor, or descendant).
pub fn scopes_overlap(a: &str, b: &str) -> bool {
    fn is_prefix(parent: &str, child: &str) -> bool {
        child.len() > parent.len()
            && child.starts_with(parent)
            && child.as_bytes()[parent.len()] == b'/'
    }
    a == b || is_prefix(a, b) || is_prefix(b, a)
}

/// Normalize, dedupe and drop scopes already covered by an ancestor in the set.
fn canonical_scopes(scopes: &[String]) -> Vec<String> {
    let mut normalized: Vec<String> = scopes
        .iter()
        .map(|s| normalize_scope(s))
        .filter(|s| !s.is_empty())
        .collect();
    normalized.sort();
    normalized.dedup();
    let all = normalized.clone();
    normalized.retain(|s| {
        !all
            .iter()
            .any(|other| other != s && scopes_overlap(other, s) && other.len() < s.len())
    });
    normalized
}

struct Waiter {
    id: u64,
    holder: String,
    scopes: Vec<String>,
    tx: oneshot::Sender<Vec<ResourceLease>>,
}

#[derive(Default)]
struct GuardState {
    leases: BTreeMap<String, ResourceLease>,
    waiters: VecDeque<Waiter>,
    next_waiter: u64,
}

impl GuardState {
    /// First live lease held by someone else that overlaps any of `scopes`.
    fn blocking_lease(&self, scopes: &[String], holder: &str) -> Option<&ResourceLease> {
        self.leases.values().find(|lease| {
            lease.holder != holder && scopes.iter().any(|s| scopes_overlap(&lease.scope, s))
        })
    }

    fn own_overlap(&self, scopes: &[String], holder: &str) -> Option<String> {
        scopes
            .iter()
            .find(|s| {
                self.leases
                    .values()
                    .any(|l| l.holder == holder && scopes_overlap(&l.scope, s))
            })
            .cloned()
    }

    fn grant(&mut self, scopes: &[String], holder: &str) -> Vec<ResourceLease> {
        let now = Utc::now();
        scopes
            .iter()
            .map(|scope| {
                let lease = ResourceLease {
                    scope: scope.clone(),
                    holder: holder.to_string(),
                    acquired_at: now,
                };
                self.leases.insert(scope.clone(), lease.clone());
                lease
            })
            .collect()
    }

    /// Hand leases to waiters in FIFO order.
    fn wake_waiters(&mut self) {
        let mut still_waiting: VecDeque<Waiter> = VecDeque::new();
        while let Some(waiter) = self.waiters.pop_front() {
            let behind_earlier = still_waiting.iter().any(|earlier| {
                earlier
                    .scopes
                    .iter()
                    .any(|a| waiter.scopes.iter().any(|b| scopes_overlap(a, b)))
            });
            if behind_earlier || self.blocking_lease(&waiter.scopes, &waiter.holder).is_some() {
                still_waiting.push_back(waiter);
                continue;
            }

            let leases = self.grant(&waiter.scopes, &waiter.holder);
            debug!(holder = %waiter.holder, scopes = ?waiter.scopes, "lease granted to waiter");
            if let Err(leases) = waiter.tx.send(leases) {
                // receiver is gone, undo the grant
                for lease in leases {
                    self.leases.remove(&lease.scope);
                }
            }
        }
        self.waiters = still_waiting;
    }
}

/// Grants exclusive leases over resource scopes.
#[derive(Default)]
pub struct OwnershipGuard {
    state: Mutex<GuardState>,
}

impl std::fmt::Debug for OwnershipGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnershipGuard")
            .field("leases", &self.leases().len())
            .field("waiting", &self.waiting())
            .finish()
    }
}

impl OwnershipGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, GuardState> {
        // the state is never left half-updated across a panic point
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Acquire one scope, waiting until it is free.
    pub async fn acquire(
        &self,
        scope: &str,
        holder: &str,
    ) -> Result<ResourceLease, ResourceConflictError> {
        let mut leases = self.acquire_all(&[scope.to_string()], holder).await?;
        leases.pop().ok_or_else(|| ResourceConflictError {
            scope: scope.to_string(),
            holder: holder.to_string(),
            conflicting_holder: String::new(),
        })
    }

    /// Acquire every scope in the set atomically, waiting (FIFO) until all
    /// are free.
    ///
    /// Requesting a scope that overlaps one the same holder already holds is
    /// a `ResourceConflictError`. Dropping the returned future while it waits
    /// removes the request from the queue without leaking a grant.
    pub async fn acquire_all(
        &self,
        scopes: &[String],
        holder: &str,
    ) -> Result<Vec<ResourceLease>, ResourceConflictError> {
        let scopes = canonical_scopes(scopes);
        if scopes.is_empty() {
            return Ok(Vec::new());
        }

        let (id, rx) = {
            let mut state = self.lock();

            if let Some(scope) = state.own_overlap(&scopes, holder) {
                warn!(holder, scope = %scope, "holder requested a scope it already holds");
                return Err(ResourceConflictError {
                    scope,
                    holder: holder.to_string(),
                    conflicting_holder: holder.to_string(),
                });
            }

            let queued_ahead = state.waiters.iter().any(|w| {
                w.scopes
                    .iter()
                    .any(|a| scopes.iter().any(|b| scopes_overlap(a, b)))
            });
            if !queued_ahead && state.blocking_lease(&scopes, holder).is_none() {
                debug!(holder, scopes = ?scopes, "lease granted");
                return Ok(state.grant(&scopes, holder));
            }

            let id = state.next_waiter;
            state.next_waiter += 1;
            let (tx, rx) = oneshot::channel();
            debug!(
                holder,
                scopes = ?scopes,
                position = state.waiters.len() + 1,
                "lease request queued"
            );
            state.waiters.push_back(Waiter {
                id,
                holder: holder.to_string(),
                scopes: scopes.clone(),
                tx,
            });
            (id, rx)
        };

        let mut pending = PendingAcquire {
            guard: self,
            id,
            rx,
            done: false,
        };
        let result = (&mut pending.rx).await;
        pending.done = true;

        result.map_err(|_| ResourceConflictError {
            scope: scopes.join(","),
            holder: holder.to_string(),
            conflicting_holder: String::new(),
        })
    }

    /// Release one scope held by `holder` and wake the next waiters.
    pub fn release(&self, scope: &str, holder: &str) -> Result<(), ResourceConflictError> {
        let scope = normalize_scope(scope);
        let mut state = self.lock();
        match state.leases.get(&scope) {
            Some(lease) if lease.holder == holder => {
                state.leases.remove(&scope);
            }
            other => {
                let conflicting_holder = other.map(|l| l.holder.clone()).unwrap_or_default();
                warn!(holder, scope = %scope, "release of a scope not held by the caller");
                return Err(ResourceConflictError {
                    scope,
                    holder: holder.to_string(),
                    conflicting_holder,
                });
            }
        }
        debug!(holder, scope = %scope, "lease released");
        state.wake_waiters();
        Ok(())
    }

    /// Release every lease held by `holder`, returning the freed scopes.
    pub fn release_all(&self, holder: &str) -> Vec<String> {
        let mut state = self.lock();
        let scopes: Vec<String> = state
            .leases
            .values()
            .filter(|l| l.holder == holder)
            .map(|l| l.scope.clone())
            .collect();
        for scope in &scopes {
            state.leases.remove(scope);
        }
        if !scopes.is_empty() {
            debug!(holder, scopes = ?scopes, "leases released");
            state.wake_waiters();
        }
        scopes
    }

    pub fn holder_of(&self, scope: &str) -> Option<String> {
        let scope = normalize_scope(scope);
        self.lock()
            .leases
            .values()
            .find(|l| scopes_overlap(&l.scope, &scope))
            .map(|l| l.holder.clone())
    }

    /// Snapshot of all live leases.
    pub fn leases(&self) -> Vec<ResourceLease> {
        self.lock().leases.values().cloned().collect()
    }

    /// Number of queued requests.
    pub fn waiting(&self) -> usize {
        self.lock().waiters.len()
    }

    fn cancel(&self, id: u64, rx: &mut oneshot::Receiver<Vec<ResourceLease>>) {
        let mut state = self.lock();
        if let Some(pos) = state.waiters.iter().position(|w| w.id == id) {
            state.waiters.remove(pos);
            state.wake_waiters();
            return;
        }
        // the grant was sent but never received
        if let Ok(leases) = rx.try_recv() {
            for lease in leases {
                state.leases.remove(&lease.scope);
            }
            state.wake_waiters();
        }
    }
}

struct PendingAcquire<'a> {
    guard: &'a OwnershipGuard,
    id: u64,
    rx: oneshot::Receiver<Vec<ResourceLease>>,
    done: bool,
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        if !self.done {
            self.guard.cancel(self.id, &mut self.rx);
        }
    }
}
