//! Escalations and the versioned guidance they produce.

pub mod guidance;
pub mod queue;

pub use guidance::{GuidanceSnapshot, GuidanceStore, GuidanceUpdate};
pub use queue::{
    AdoptDescription, EscalationAck, EscalationQueue, EscalationRequest, RulingAuthority,
    record_submission,
};
