//! DAG scheduler for computing waves and managing unit states.
//!
//! The scheduler computes execution waves - groups of units that can run in
//! parallel because every dependency is verified - and owns the in-memory
//! status of each unit. Status changes go through `transition`, which
//! enforces the unit lifecycle table.

use crate::dag::builder::{DagBuilder, UnitGraph, UnitIndex};
use crate::errors::{OrchestratorError, PlanError};
use crate::ledger::LedgerView;
use crate::unit::{UnitStatus, WorkUnit};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Configuration for scheduling and dispatch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagConfig {
    /// Maximum units in flight at once within a wave
    pub max_parallel: usize,
    /// Deadline for a single dispatch
    pub unit_timeout_secs: u64,
    /// Correction cycles allowed before a unit is escalated (K)
    pub max_corrections: u32,
}

impl Default for DagConfig {
    fn default() -> Self {
        Self {
            max_parallel: 4,
            unit_timeout_secs: 1800,
            max_corrections: 2,
        }
    }
}

impl DagConfig {
    pub fn with_max_parallel(mut self, max: usize) -> Self {
        self.max_parallel = max;
        self
    }

    pub fn with_unit_timeout_secs(mut self, secs: u64) -> Self {
        self.unit_timeout_secs = secs;
        self
    }

    pub fn with_max_corrections(mut self, k: u32) -> Self {
        self.max_corrections = k;
        self
    }

    pub fn unit_timeout(&self) -> Duration {
        Duration::from_secs(self.unit_timeout_secs)
    }
}

/// The main DAG scheduler.
#[derive(Debug, Clone)]
pub struct DagScheduler {
    graph: UnitGraph,
    config: DagConfig,
}

impl DagScheduler {
    /// Create a scheduler from a list of units. Fails on duplicates, unknown
    /// dependencies, or cycles.
    pub fn from_units(units: &[WorkUnit], config: DagConfig) -> Result<Self, OrchestratorError> {
        let graph = DagBuilder::new(units.to_vec()).build()?;
        Ok(Self { graph, config })
    }

    pub fn unit_count(&self) -> usize {
        self.graph.len()
    }

    pub fn config(&self) -> &DagConfig {
        &self.config
    }

    pub fn get_unit(&self, id: &str) -> Option<&WorkUnit> {
        self.graph
            .get_index(id)
            .and_then(|i| self.graph.get_unit(i))
    }

    fn unit_mut(&mut self, id: &str) -> Option<&mut WorkUnit> {
        let index = self.graph.get_index(id)?;
        self.graph.get_unit_mut(index)
    }

    pub fn units(&self) -> &[WorkUnit] {
        self.graph.units()
    }

    pub fn status(&self, id: &str) -> Option<UnitStatus> {
        self.get_unit(id).map(|u| u.status)
    }

    fn verified(&self) -> HashSet<UnitIndex> {
        self.graph
            .units()
            .iter()
            .enumerate()
            .filter(|(_, u)| u.status == UnitStatus::Verified)
            .map(|(i, _)| i)
            .collect()
    }

    /// Indices of units that can never become eligible this pass because
    /// they are `Failed` or depend (transitively) on a `Failed` unit.
    fn blocked(&self) -> HashSet<UnitIndex> {
        let mut blocked = HashSet::new();
        for (i, unit) in self.graph.units().iter().enumerate() {
            if unit.status == UnitStatus::Failed {
                blocked.insert(i);
                blocked.extend(self.graph.transitive_dependents(i));
            }
        }
        blocked
    }

    /// Whether a failed dependency keeps this unit from ever running this pass.
    pub fn is_blocked(&self, id: &str) -> bool {
        self.graph
            .get_index(id)
            .is_some_and(|i| self.blocked().contains(&i))
    }

    fn layer(&self, members: &[UnitIndex], mut satisfied: HashSet<UnitIndex>) -> Vec<Vec<String>> {
        let mut waves = Vec::new();
        let mut remaining: Vec<UnitIndex> = members.to_vec();

        loop {
            let ready: Vec<UnitIndex> = remaining
                .iter()
                .copied()
                .filter(|&i| self.graph.dependencies_satisfied(i, &satisfied))
                .collect();

            if ready.is_empty() {
                break;
            }

            remaining.retain(|i| !ready.contains(i));
            satisfied.extend(ready.iter().copied());
            waves.push(
                ready
                    .into_iter()
                    .filter_map(|i| self.graph.get_unit(i).map(|u| u.id.clone()))
                    .collect(),
            );
        }

        waves
    }

    /// Compute the full wave plan, ignoring current status.
    ///
    /// Every dependency of a unit in wave k lies in a wave before k; within a
    /// wave units keep declaration order.
    pub fn compute_waves(&self) -> Vec<Vec<String>> {
        let all: Vec<UnitIndex> = (0..self.graph.len()).collect();
        self.layer(&all, HashSet::new())
    }

    /// Waves still to run, over units that are neither `Verified` nor blocked
    /// by a failure, optionally restricted to one phase. Verified units count
    /// as satisfied dependencies.
    pub fn pending_waves(&self, phase: Option<&str>) -> Vec<Vec<String>> {
        let blocked = self.blocked();
        let members: Vec<UnitIndex> = self
            .graph
            .units()
            .iter()
            .enumerate()
            .filter(|(i, u)| {
                u.status != UnitStatus::Verified
                    && !blocked.contains(i)
                    && phase.is_none_or(|p| u.phase == p)
            })
            .map(|(i, _)| i)
            .collect();
        self.layer(&members, self.verified())
    }

    /// Units whose dependencies are all verified and that may be admitted now.
    pub fn get_ready(&self, phase: Option<&str>) -> Vec<&WorkUnit> {
        let verified = self.verified();
        self.graph
            .units()
            .iter()
            .enumerate()
            .filter(|(i, u)| {
                u.status.is_admissible()
                    && phase.is_none_or(|p| u.phase == p)
                    && self.graph.dependencies_satisfied(*i, &verified)
            })
            .map(|(_, u)| u)
            .collect()
    }

    /// Move a unit to a new status, returning the old one.
    ///
    /// Enforces the lifecycle table and refuses `Ready` while any dependency
    /// is unverified.
    pub fn transition(&mut self, id: &str, to: UnitStatus) -> Result<UnitStatus, OrchestratorError> {
        let index = self
            .graph
            .get_index(id)
            .ok_or_else(|| OrchestratorError::UnknownUnit(id.to_string()))?;
        let from = self.graph.units()[index].status;

        let deps_ok = to != UnitStatus::Ready
            || self.graph.dependencies_satisfied(index, &self.verified());
        if !from.can_transition_to(to) || !deps_ok {
            return Err(OrchestratorError::InvalidTransition {
                unit: id.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        if let Some(unit) = self.unit_mut(id) {
            unit.status = to;
            match to {
                UnitStatus::CorrectionsRequested => unit.retry_count += 1,
                UnitStatus::Pending => unit.retry_count = 0,
                _ => {}
            }
        }
        Ok(from)
    }

    pub fn set_artifacts(&mut self, id: &str, artifacts: Vec<String>) {
        if let Some(unit) = self.unit_mut(id) {
            unit.artifacts = artifacts;
        }
    }

    /// Append units after scheduling has begun.
    ///
    /// New units may depend on verified or not-yet-scheduled units only. The
    /// graph is rebuilt and re-checked for cycles; on any error the scheduler
    /// is left unchanged.
    pub fn add_units(&mut self, units: Vec<WorkUnit>) -> Result<(), OrchestratorError> {
        for unit in &units {
            for dep in &unit.depends_on {
                if let Some(status) = self.status(dep)
                    && !matches!(
                        status,
                        UnitStatus::Verified
                            | UnitStatus::Pending
                            | UnitStatus::Ready
                            | UnitStatus::Interrupted
                    )
                {
                    return Err(PlanError::DependsOnDispatched {
                        unit: unit.id.clone(),
                        dependency: dep.clone(),
                        status: status.to_string(),
                    }
                    .into());
                }
            }
        }

        let mut all = self.graph.units().to_vec();
        all.extend(units);
        self.graph = DagBuilder::new(all).build()?;
        Ok(())
    }

    /// Load unit statuses and retry counts from a folded ledger.
    pub fn apply_view(&mut self, view: &LedgerView) {
        for index in 0..self.graph.len() {
            if let Some(unit) = self.graph.get_unit_mut(index)
                && let Some(record) = view.unit(&unit.id)
            {
                unit.status = record.status;
                unit.retry_count = record.retry_count;
                unit.artifacts = record.artifacts.clone();
            }
        }
    }

    /// Artifacts of every direct dependency of a unit.
    pub fn dependency_artifacts(&self, id: &str) -> Vec<String> {
        let Some(index) = self.graph.get_index(id) else {
            return Vec::new();
        };
        self.graph
            .dependencies(index)
            .iter()
            .filter_map(|&d| self.graph.get_unit(d))
            .flat_map(|u| u.artifacts.iter().cloned())
            .collect()
    }

    pub fn units_in_phase<'a>(&'a self, phase: &'a str) -> impl Iterator<Item = &'a WorkUnit> + 'a {
        self.graph.units().iter().filter(move |u| u.phase == phase)
    }

    /// Every unit of the phase is verified.
    pub fn phase_verified(&self, phase: &str) -> bool {
        self.units_in_phase(phase)
            .all(|u| u.status == UnitStatus::Verified)
    }

    pub fn count(&self, status: UnitStatus) -> usize {
        self.graph
            .units()
            .iter()
            .filter(|u| u.status == status)
            .count()
    }

    pub fn completion_percentage(&self) -> f64 {
        if self.graph.is_empty() {
            return 100.0;
        }
        let verified = self.count(UnitStatus::Verified);
        (verified as f64 / self.graph.len() as f64) * 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(id: &str, deps: Vec<&str>) -> WorkUnit {
        WorkUnit::new(id, "core", deps.into_iter().map(String::from).collect()).in_phase("p1")
    }

    fn scheduler(units: Vec<WorkUnit>) -> DagScheduler {
        DagScheduler::from_units(&units, DagConfig::default()).unwrap()
    }

    fn verify(s: &mut DagScheduler, id: &str) {
        for to in [
            UnitStatus::Ready,
            UnitStatus::Dispatched,
            UnitStatus::InProgress,
            UnitStatus::Verifying,
            UnitStatus::Verified,
        ] {
            s.transition(id, to).unwrap();
        }
    }

    #[test]
    fn test_waves_for_reference_graph() {
        let s = scheduler(vec![
            unit("A", vec![]),
            unit("B", vec![]),
            unit("C", vec!["A", "B"]),
            unit("D", vec!["C"]),
        ]);
        assert_eq!(
            s.compute_waves(),
            vec![vec!["A", "B"], vec!["C"], vec!["D"]]
        );
    }

    #[test]
    fn test_every_dependency_in_earlier_wave() {
        let s = scheduler(vec![
            unit("A", vec![]),
            unit("B", vec!["A"]),
            unit("C", vec!["A"]),
            unit("D", vec!["B", "C"]),
            unit("E", vec![]),
            unit("F", vec!["E", "D"]),
        ]);
        let waves = s.compute_waves();
        let wave_of = |id: &str| waves.iter().position(|w| w.iter().any(|u| u == id)).unwrap();
        for u in s.units() {
            for dep in &u.depends_on {
                assert!(wave_of(dep) < wave_of(&u.id), "{} before {}", dep, u.id);
            }
        }
        assert_eq!(waves[0], vec!["A", "E"]);
    }

    #[test]
    fn test_pending_waves_treat_verified_as_satisfied() {
        let mut s = scheduler(vec![
            unit("A", vec![]),
            unit("B", vec![]),
            unit("C", vec!["A", "B"]),
        ]);
        verify(&mut s, "A");
        verify(&mut s, "B");
        assert_eq!(s.pending_waves(None), vec![vec!["C"]]);
        assert_eq!(s.get_ready(None).len(), 1);
    }

    #[test]
    fn test_failed_dependency_blocks_dependents() {
        let mut s = scheduler(vec![
            unit("A", vec![]),
            unit("B", vec!["A"]),
            unit("C", vec!["B"]),
            unit("D", vec![]),
        ]);
        s.transition("A", UnitStatus::Failed).unwrap();
        assert!(s.is_blocked("C"));
        assert!(!s.is_blocked("D"));
        assert_eq!(s.pending_waves(None), vec![vec!["D"]]);
    }

    #[test]
    fn test_ready_requires_verified_dependencies() {
        let mut s = scheduler(vec![unit("A", vec![]), unit("B", vec!["A"])]);
        let err = s.transition("B", UnitStatus::Ready).unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidTransition { .. }));
        verify(&mut s, "A");
        assert_eq!(s.transition("B", UnitStatus::Ready).unwrap(), UnitStatus::Pending);
    }

    #[test]
    fn test_verified_is_terminal() {
        let mut s = scheduler(vec![unit("A", vec![])]);
        verify(&mut s, "A");
        assert!(s.transition("A", UnitStatus::Dispatched).is_err());
        assert!(s.get_ready(None).is_empty());
    }

    #[test]
    fn test_corrections_increment_retry_count() {
        let mut s = scheduler(vec![unit("A", vec![])]);
        for to in [
            UnitStatus::Ready,
            UnitStatus::Dispatched,
            UnitStatus::InProgress,
            UnitStatus::Verifying,
            UnitStatus::CorrectionsRequested,
        ] {
            s.transition("A", to).unwrap();
        }
        assert_eq!(s.get_unit("A").unwrap().retry_count, 1);
    }

    #[test]
    fn test_add_units_after_first_wave() {
        let mut s = scheduler(vec![unit("A", vec![]), unit("B", vec![])]);
        verify(&mut s, "A");
        s.add_units(vec![unit("C", vec!["A", "B"])]).unwrap();
        assert_eq!(s.unit_count(), 3);
        assert_eq!(s.pending_waves(None), vec![vec!["B"], vec!["C"]]);
    }

    #[test]
    fn test_add_units_rejects_dependency_on_dispatched() {
        let mut s = scheduler(vec![unit("A", vec![])]);
        s.transition("A", UnitStatus::Ready).unwrap();
        s.transition("A", UnitStatus::Dispatched).unwrap();
        let err = s.add_units(vec![unit("B", vec!["A"])]).unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::Plan(PlanError::DependsOnDispatched { .. })
        ));
        assert_eq!(s.unit_count(), 1);
    }

    #[test]
    fn test_add_units_rejects_cycle_and_keeps_graph() {
        let mut s = scheduler(vec![unit("A", vec![])]);
        let err = s
            .add_units(vec![unit("B", vec!["C"]), unit("C", vec!["B"])])
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::DependencyCycle(_)));
        assert_eq!(s.unit_count(), 1);
    }

    #[test]
    fn test_pending_waves_by_phase() {
        let mut s = scheduler(vec![
            unit("A", vec![]),
            WorkUnit::new("B", "core", vec!["A".into()]).in_phase("p2"),
        ]);
        assert_eq!(s.pending_waves(Some("p2")), Vec::<Vec<String>>::new());
        verify(&mut s, "A");
        assert_eq!(s.pending_waves(Some("p2")), vec![vec!["B"]]);
        assert!(s.phase_verified("p1"));
        assert!(!s.phase_verified("p2"));
    }
}
