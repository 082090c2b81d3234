pub mod dispatcher;
pub mod engine;
pub mod events;
pub mod recovery;
pub mod worker;

pub use dispatcher::{AbortHandle, Dispatcher, WavePlan};
pub use engine::{Engine, RunOutcome};
pub use events::EngineEvent;
pub use recovery::{PhaseReport, RecoveryManager, RecoveryReport, StatusReport, UnitReport};
pub use worker::{
    EscalationDraft, ProcessWorker, TaskRequest, TaskResponse, Worker, WorkerPool, WorkerStatus,
};
