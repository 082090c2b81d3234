//! DAG builder for constructing dependency graphs from work units.
//!
//! The builder takes a list of work units with their dependencies and constructs
//! a directed acyclic graph (DAG) that can be used for scheduling.

use crate::errors::{DependencyCycleError, OrchestratorError, PlanError};
use crate::unit::WorkUnit;
use std::collections::{HashMap, HashSet};

/// Index into the unit list.
pub type UnitIndex = usize;

/// A directed acyclic graph of work units.
#[derive(Debug, Clone)]
pub struct UnitGraph {
    /// Units indexed by their position (declaration order)
    units: Vec<WorkUnit>,
    /// Map from unit id to index
    index_map: HashMap<String, UnitIndex>,
    /// Forward edges: index -> units that depend on it
    forward_edges: Vec<Vec<UnitIndex>>,
    /// Reverse edges: index -> units it depends on
    reverse_edges: Vec<Vec<UnitIndex>>,
}

impl UnitGraph {
    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn get_unit(&self, index: UnitIndex) -> Option<&WorkUnit> {
        self.units.get(index)
    }

    pub fn get_unit_mut(&mut self, index: UnitIndex) -> Option<&mut WorkUnit> {
        self.units.get_mut(index)
    }

    pub fn get_index(&self, id: &str) -> Option<UnitIndex> {
        self.index_map.get(id).copied()
    }

    pub fn units(&self) -> &[WorkUnit] {
        &self.units
    }

    pub fn into_units(self) -> Vec<WorkUnit> {
        self.units
    }

    /// Units that depend on the given unit.
    pub fn dependents(&self, index: UnitIndex) -> &[UnitIndex] {
        self.forward_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Units the given unit depends on.
    pub fn dependencies(&self, index: UnitIndex) -> &[UnitIndex] {
        self.reverse_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Units with no dependencies (entry points).
    pub fn root_units(&self) -> Vec<UnitIndex> {
        self.reverse_edges
            .iter()
            .enumerate()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(i, _)| i)
            .collect()
    }

    /// Check if all dependencies of a unit are in `satisfied`.
    pub fn dependencies_satisfied(
        &self,
        index: UnitIndex,
        satisfied: &HashSet<UnitIndex>,
    ) -> bool {
        self.dependencies(index)
            .iter()
            .all(|dep| satisfied.contains(dep))
    }

    /// Every unit reachable through forward edges from `index`.
    pub fn transitive_dependents(&self, index: UnitIndex) -> HashSet<UnitIndex> {
        let mut seen = HashSet::new();
        let mut stack = vec![index];
        while let Some(node) = stack.pop() {
            for &next in self.dependents(node) {
                if seen.insert(next) {
                    stack.push(next);
                }
            }
        }
        seen
    }
}

/// Builder for constructing unit graphs.
pub struct DagBuilder {
    units: Vec<WorkUnit>,
}

impl DagBuilder {
    pub fn new(units: Vec<WorkUnit>) -> Self {
        Self { units }
    }

    /// Build the unit graph.
    ///
    /// This validates the graph structure:
    /// - Unit ids must be unique
    /// - All dependencies must reference existing units
    /// - No cycles are allowed
    pub fn build(self) -> Result<UnitGraph, OrchestratorError> {
        let mut index_map = HashMap::new();
        for (i, unit) in self.units.iter().enumerate() {
            if index_map.insert(unit.id.clone(), i).is_some() {
                return Err(PlanError::DuplicateUnit(unit.id.clone()).into());
            }
        }

        let mut forward_edges: Vec<Vec<UnitIndex>> = vec![Vec::new(); self.units.len()];
        let mut reverse_edges: Vec<Vec<UnitIndex>> = vec![Vec::new(); self.units.len()];

        for (to_idx, unit) in self.units.iter().enumerate() {
            for dep in &unit.depends_on {
                let from_idx =
                    *index_map
                        .get(dep)
                        .ok_or_else(|| PlanError::UnknownDependency {
                            unit: unit.id.clone(),
                            dependency: dep.clone(),
                        })?;

                // from_idx must be verified before to_idx
                forward_edges[from_idx].push(to_idx);
                reverse_edges[to_idx].push(from_idx);
            }
        }

        let graph = UnitGraph {
            units: self.units,
            index_map,
            forward_edges,
            reverse_edges,
        };

        Self::validate_no_cycles(&graph)?;

        Ok(graph)
    }

    /// Kahn's algorithm; on failure, Tarjan's SCC names the minimal cycle set.
    fn validate_no_cycles(graph: &UnitGraph) -> Result<(), DependencyCycleError> {
        let mut in_degree: Vec<usize> = graph.reverse_edges.iter().map(|deps| deps.len()).collect();

        let mut queue: Vec<UnitIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();

        let mut processed = 0;

        while let Some(node) = queue.pop() {
            processed += 1;

            for &dependent in graph.dependents(node) {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push(dependent);
                }
            }
        }

        if processed == graph.len() {
            return Ok(());
        }

        let mut cycles: Vec<Vec<String>> = Tarjan::new(graph)
            .run()
            .into_iter()
            .filter(|scc| {
                scc.len() > 1 || graph.dependencies(scc[0]).contains(&scc[0])
            })
            .map(|scc| {
                let mut ids: Vec<String> =
                    scc.iter().map(|&i| graph.units[i].id.clone()).collect();
                ids.sort();
                ids
            })
            .collect();
        cycles.sort();

        let mut units: Vec<String> = cycles.iter().flatten().cloned().collect();
        units.sort();

        Err(DependencyCycleError { units, cycles })
    }
}

/// Tarjan's strongly connected components over the dependency edges.
struct Tarjan<'a> {
    graph: &'a UnitGraph,
    index: usize,
    indices: Vec<Option<usize>>,
    lowlink: Vec<usize>,
    on_stack: Vec<bool>,
    stack: Vec<UnitIndex>,
    components: Vec<Vec<UnitIndex>>,
}

impl<'a> Tarjan<'a> {
    fn new(graph: &'a UnitGraph) -> Self {
        let n = graph.len();
        Self {
            graph,
            index: 0,
            indices: vec![None; n],
            lowlink: vec![0; n],
            on_stack: vec![false; n],
            stack: Vec::new(),
            components: Vec::new(),
        }
    }

    fn run(mut self) -> Vec<Vec<UnitIndex>> {
        for v in 0..self.graph.len() {
            if self.indices[v].is_none() {
                self.connect(v);
            }
        }
        self.components
    }

    fn connect(&mut self, v: UnitIndex) {
        self.indices[v] = Some(self.index);
        self.lowlink[v] = self.index;
        self.index += 1;
        self.stack.push(v);
        self.on_stack[v] = true;

        for &w in self.graph.dependencies(v) {
            match self.indices[w] {
                None => {
                    self.connect(w);
                    self.lowlink[v] = self.lowlink[v].min(self.lowlink[w]);
                }
                Some(w_index) if self.on_stack[w] => {
                    self.lowlink[v] = self.lowlink[v].min(w_index);
                }
                Some(_) => {}
            }
        }

        if Some(self.lowlink[v]) == self.indices[v] {
            let mut component = Vec::new();
            while let Some(w) = self.stack.pop() {
                self.on_stack[w] = false;
                component.push(w);
                if w == v {
                    break;
                }
            }
            self.components.push(component);
        }
    }
}
