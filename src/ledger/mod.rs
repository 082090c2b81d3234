//! The durable ledger: an append-only, totally ordered record of every
//! orchestration transition, and the fold that turns it back into state.

pub mod entry;
pub mod store;
pub mod view;

pub use entry::{
    ACTOR_ENGINE, ACTOR_ESCALATION, ACTOR_HUMAN, ACTOR_RECOVERY, EntityKind, EntryDetail,
    LedgerEntry, Transition, checklist_key, status, wave_key,
};
pub use store::Ledger;
pub use view::{
    BlockerRecord, EscalationRecord, GuidanceRecord, LedgerView, SessionRecord, UnitRecord,
    WaveRecord,
};
