//! Verification gate and bounded correction loop.
//!
//! A unit's result is reviewed while the unit is `Verifying` (under review);
//! `Dispatched`/`InProgress` are its draft states. Review yields one of
//! three verdicts:
//! - `Approve` -> the unit becomes `Verified`
//! - `CorrectionsNeeded` -> back to draft with the retry count bumped
//! - `Escalate` -> the unit fails and a blocker is raised for a human
//!
//! A unit gets at most `max_corrections` correction cycles; a failing review
//! once that budget is spent escalates, so the loop ends within K+1 attempts.

pub mod checks;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

pub use checks::{ArtifactManifest, CheckKind, CheckResult};

use crate::errors::GuidanceVersionMismatch;
use crate::escalation::GuidanceStore;
use crate::unit::{ArtifactRef, WorkUnit};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approve,
    CorrectionsNeeded,
    Escalate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub unit: String,
    /// 1-based attempt that produced the reviewed result
    pub attempt: u32,
    pub checks: Vec<CheckResult>,
    pub verdict: Verdict,
    /// Every finding from every failed check, in checklist order
    pub findings: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct VerificationGate {
    max_corrections: u32,
}

impl VerificationGate {
    pub fn new(max_corrections: u32) -> Self {
        Self { max_corrections }
    }

    pub fn max_corrections(&self) -> u32 {
        self.max_corrections
    }

    fn failing_verdict(&self, unit: &WorkUnit) -> Verdict {
        if unit.retry_count >= self.max_corrections {
            Verdict::Escalate
        } else {
            Verdict::CorrectionsNeeded
        }
    }

    /// Review a worker's successful result.
    ///
    /// Guidance freshness is checked first; a stale pin returns the mismatch
    /// instead of a verdict so the caller can refetch and redispatch.
    pub fn review(
        &self,
        unit: &WorkUnit,
        manifest: &ArtifactManifest,
        artifacts: &[ArtifactRef],
        pinned: &BTreeMap<String, u64>,
        guidance: &GuidanceStore,
    ) -> Result<VerificationReport, GuidanceVersionMismatch> {
        guidance.check_current(pinned)?;

        let checks = checks::run_all(unit, manifest, artifacts);
        let findings: Vec<String> = checks
            .iter()
            .flat_map(|c| c.findings.iter().cloned())
            .collect();
        let verdict = if checks.iter().all(|c| c.passed) {
            Verdict::Approve
        } else {
            self.failing_verdict(unit)
        };

        debug!(
            unit = %unit.id,
            attempt = unit.retry_count + 1,
            verdict = ?verdict,
            findings = findings.len(),
            "verification review"
        );

        Ok(VerificationReport {
            unit: unit.id.clone(),
            attempt: unit.retry_count + 1,
            checks,
            verdict,
            findings,
        })
    }

    /// The worker itself reported that its output needs corrections. This
    /// consumes a correction cycle like a failed review.
    pub fn worker_requested_corrections(
        &self,
        unit: &WorkUnit,
        findings: Vec<String>,
    ) -> VerificationReport {
        VerificationReport {
            unit: unit.id.clone(),
            attempt: unit.retry_count + 1,
            checks: Vec::new(),
            verdict: self.failing_verdict(unit),
            findings,
        }
    }

    /// The worker reported failure; that escalates immediately.
    pub fn worker_failed(&self, unit: &WorkUnit, findings: Vec<String>) -> VerificationReport {
        VerificationReport {
            unit: unit.id.clone(),
            attempt: unit.retry_count + 1,
            checks: Vec::new(),
            verdict: Verdict::Escalate,
            findings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::Ledger;
    use crate::unit::UnitSpec;

    fn unit() -> WorkUnit {
        WorkUnit::new("A", "auth", vec![])
            .with_scopes(vec!["modules/auth".into()])
            .with_spec(UnitSpec {
                interface: vec!["login".into()],
                ..Default::default()
            })
    }

    fn good_manifest() -> ArtifactManifest {
        ArtifactManifest {
            symbols: vec!["login".into()],
            paths: vec!["modules/auth/login.rs".into()],
            ..Default::default()
        }
    }

    fn store() -> (GuidanceStore, BTreeMap<String, u64>) {
        let ledger = Ledger::in_memory();
        let store = GuidanceStore::new();
        store.ensure_domain("auth", &ledger).unwrap();
        let pinned = store.pin(&["auth".into()]);
        (store, pinned)
    }

    #[test]
    fn test_approve_when_all_checks_pass() {
        let (store, pinned) = store();
        let gate = VerificationGate::new(2);
        let report = gate
            .review(&unit(), &good_manifest(), &["a.rs".into()], &pinned, &store)
            .unwrap();
        assert_eq!(report.verdict, Verdict::Approve);
        assert!(report.findings.is_empty());
        assert_eq!(report.checks.len(), 5);
    }

    #[test]
    fn test_corrections_then_escalate_after_k() {
        let (store, pinned) = store();
        let gate = VerificationGate::new(2);
        let mut u = unit();
        let bad = ArtifactManifest::default();

        let mut verdicts = Vec::new();
        for _ in 0..3 {
            let report = gate
                .review(&u, &bad, &["a.rs".into()], &pinned, &store)
                .unwrap();
            verdicts.push(report.verdict);
            if report.verdict == Verdict::CorrectionsNeeded {
                u.retry_count += 1;
            }
        }
        assert_eq!(
            verdicts,
            vec![
                Verdict::CorrectionsNeeded,
                Verdict::CorrectionsNeeded,
                Verdict::Escalate
            ]
        );
    }

    #[test]
    fn test_zero_budget_escalates_on_first_failure() {
        let (store, pinned) = store();
        let gate = VerificationGate::new(0);
        let report = gate
            .review(&unit(), &ArtifactManifest::default(), &[], &pinned, &store)
            .unwrap();
        assert_eq!(report.verdict, Verdict::Escalate);
    }

    #[test]
    fn test_stale_guidance_is_reported_before_checks() {
        let ledger = Ledger::in_memory();
        let store = GuidanceStore::new();
        store.ensure_domain("auth", &ledger).unwrap();
        let pinned = store.pin(&["auth".into()]);
        store
            .apply_ruling(&ledger, "auth", "e1", "B", "hash tokens")
            .unwrap();

        let err = VerificationGate::new(2)
            .review(&unit(), &good_manifest(), &["a.rs".into()], &pinned, &store)
            .unwrap_err();
        assert_eq!(err.domain, "auth");
        assert_eq!(err.current, 2);
    }

    #[test]
    fn test_worker_verdicts() {
        let gate = VerificationGate::new(1);
        let mut u = unit();
        assert_eq!(
            gate.worker_requested_corrections(&u, vec![]).verdict,
            Verdict::CorrectionsNeeded
        );
        u.retry_count = 1;
        assert_eq!(
            gate.worker_requested_corrections(&u, vec![]).verdict,
            Verdict::Escalate
        );
        assert_eq!(
            gate.worker_failed(&unit(), vec!["boom".into()]).verdict,
            Verdict::Escalate
        );
    }
}
