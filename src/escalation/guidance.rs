//! Versioned guidance snapshots, one per domain.
//!
//! Reads are lock-free clones of an `Arc`; the only writer is the escalation
//! queue's consumer task, which bumps a domain by exactly one version per
//! applied ruling.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::errors::{GuidanceVersionMismatch, LedgerError};
use crate::ledger::{ACTOR_ESCALATION, EntryDetail, Ledger, LedgerView, Transition};

/// The binding guidance for one domain at one version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuidanceSnapshot {
    pub domain: String,
    pub version: u64,
    /// Applied rulings, oldest first
    pub rulings: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

/// Broadcast whenever a domain moves to a new version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuidanceUpdate {
    pub domain: String,
    pub version: u64,
    pub escalation: String,
    pub raised_by: String,
}

pub struct GuidanceStore {
    snapshots: RwLock<HashMap<String, Arc<GuidanceSnapshot>>>,
    updates: broadcast::Sender<GuidanceUpdate>,
}

impl Default for GuidanceStore {
    fn default() -> Self {
        let (updates, _) = broadcast::channel(64);
        Self {
            snapshots: RwLock::new(HashMap::new()),
            updates,
        }
    }
}

impl std::fmt::Debug for GuidanceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuidanceStore")
            .field("domains", &self.versions())
            .finish()
    }
}

impl GuidanceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild snapshots from what the ledger recorded.
    pub fn from_view(view: &LedgerView) -> Self {
        let store = Self::new();
        {
            let mut snapshots = store.write();
            for (domain, record) in &view.guidance {
                snapshots.insert(
                    domain.clone(),
                    Arc::new(GuidanceSnapshot {
                        domain: domain.clone(),
                        version: record.version,
                        rulings: record.rulings.clone(),
                        updated_at: Utc::now(),
                    }),
                );
            }
        }
        store
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, Arc<GuidanceSnapshot>>> {
        self.snapshots.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, Arc<GuidanceSnapshot>>> {
        self.snapshots.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a domain at version 1 if it does not exist yet, recording the
    /// creation in the ledger. Returns the current version.
    pub fn ensure_domain(&self, domain: &str, ledger: &Ledger) -> Result<u64, LedgerError> {
        let mut snapshots = self.write();
        if let Some(existing) = snapshots.get(domain) {
            return Ok(existing.version);
        }
        ledger.append(Transition::guidance(domain, None, 1).by(ACTOR_ESCALATION))?;
        snapshots.insert(
            domain.to_string(),
            Arc::new(GuidanceSnapshot {
                domain: domain.to_string(),
                version: 1,
                rulings: Vec::new(),
                updated_at: Utc::now(),
            }),
        );
        debug!(domain, "guidance domain created");
        Ok(1)
    }

    pub fn snapshot(&self, domain: &str) -> Option<Arc<GuidanceSnapshot>> {
        self.read().get(domain).cloned()
    }

    /// Current version of a domain, 0 when unknown.
    pub fn version(&self, domain: &str) -> u64 {
        self.read().get(domain).map_or(0, |s| s.version)
    }

    pub fn versions(&self) -> BTreeMap<String, u64> {
        self.read()
            .iter()
            .map(|(d, s)| (d.clone(), s.version))
            .collect()
    }

    /// Versions of the given domains right now, as pinned into a dispatch.
    pub fn pin(&self, domains: &[String]) -> BTreeMap<String, u64> {
        let snapshots = self.read();
        domains
            .iter()
            .map(|d| (d.clone(), snapshots.get(d).map_or(0, |s| s.version)))
            .collect()
    }

    /// Fail with the first domain whose version moved since `pinned`.
    pub fn check_current(
        &self,
        pinned: &BTreeMap<String, u64>,
    ) -> Result<(), GuidanceVersionMismatch> {
        let snapshots = self.read();
        for (domain, &dispatched) in pinned {
            let current = snapshots.get(domain).map_or(0, |s| s.version);
            if current != dispatched {
                return Err(GuidanceVersionMismatch {
                    domain: domain.clone(),
                    dispatched,
                    current,
                });
            }
        }
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GuidanceUpdate> {
        self.updates.subscribe()
    }

    /// Apply a ruling as the next version of a domain. Only the escalation
    /// consumer calls this.
    pub(crate) fn apply_ruling(
        &self,
        ledger: &Ledger,
        domain: &str,
        escalation: &str,
        raised_by: &str,
        ruling: &str,
    ) -> Result<Arc<GuidanceSnapshot>, LedgerError> {
        let snapshot = {
            let mut snapshots = self.write();
            let (from, mut rulings) = match snapshots.get(domain) {
                Some(s) => (Some(s.version), s.rulings.clone()),
                None => (None, Vec::new()),
            };
            let next = from.map_or(1, |v| v + 1);

            ledger.append(
                Transition::guidance(domain, from, next)
                    .by(ACTOR_ESCALATION)
                    .with_detail(EntryDetail::Ruling {
                        escalation: escalation.to_string(),
                        ruling: ruling.to_string(),
                    }),
            )?;

            rulings.push(ruling.to_string());
            let snapshot = Arc::new(GuidanceSnapshot {
                domain: domain.to_string(),
                version: next,
                rulings,
                updated_at: Utc::now(),
            });
            snapshots.insert(domain.to_string(), snapshot.clone());
            snapshot
        };

        info!(domain, version = snapshot.version, escalation, "guidance updated");
        // no subscribers is fine
        let _ = self.updates.send(GuidanceUpdate {
            domain: domain.to_string(),
            version: snapshot.version,
            escalation: escalation.to_string(),
            raised_by: raised_by.to_string(),
        });
        Ok(snapshot)
    }
}
