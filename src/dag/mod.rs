//! Dependency graph resolution for work units.
//!
//! This module builds a DAG from the plan's work units and layers it into
//! execution waves while respecting dependencies.
//!
//! ## Architecture
//!
//! 1. **Builder** - Constructs the graph, rejecting unknown ids and cycles
//!    (the cycle report names only the units inside strongly connected
//!    components, not the units downstream of them)
//! 2. **Scheduler** - Computes waves, owns per-unit status and enforces the
//!    lifecycle table
//! 3. **State** - Per-unit and per-wave results
//!
//! ## Example
//!
//! ```no_run
//! use stagehand::dag::{DagConfig, DagScheduler};
//! use stagehand::unit::WorkUnit;
//!
//! # fn example() -> Result<(), stagehand::errors::OrchestratorError> {
//! let units = vec![
//!     WorkUnit::new("A", "core", vec![]),
//!     WorkUnit::new("B", "core", vec![]),
//!     WorkUnit::new("C", "core", vec!["A".into(), "B".into()]),
//!     WorkUnit::new("D", "core", vec!["C".into()]),
//! ];
//!
//! let scheduler = DagScheduler::from_units(&units, DagConfig::default())?;
//! let waves = scheduler.compute_waves();
//! // Wave 0: [A, B]
//! // Wave 1: [C]
//! // Wave 2: [D]
//! # Ok(())
//! # }
//! ```

mod builder;
mod scheduler;
mod state;

pub use builder::{DagBuilder, UnitGraph, UnitIndex};
pub use scheduler::{DagConfig, DagScheduler};
pub use state::{ExecutionTimer, UnitResult, WaveSummary};
