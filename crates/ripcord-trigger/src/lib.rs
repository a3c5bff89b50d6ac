//! Webhook trigger intake and multi-user fan-out.
//!
//! An external signal source posts a trigger ("TP1 hit", "SL hit") for
//! a symbol. This crate validates it, deduplicates it, runs the exit
//! pipeline for every active user in parallel, and reports the batch
//! outcome plus per-position notifications.

pub mod dedup;
pub mod error;
pub mod notifier;
pub mod payload;
pub mod processor;

pub use dedup::{DedupRejection, TriggerDeduper};
pub use error::{NotifyError, TriggerError};
pub use notifier::{HttpPositionSink, NoopSink, PositionClosed, PositionReduced, PositionSink};
pub use payload::TriggerPayload;
pub use processor::{
    ProcessorConfig, SkipReason, TriggerProcessor, TriggerSummary, UserOutcome, UserResult,
};
