//! Core module - queue data model, store contract and trace ids.

pub mod queue;
pub mod trace;

pub use queue::{
    enqueue_json, ClaimedMessage, Envelope, Lease, QueueDocument, QueueStats, QueueStore,
    ReleaseOutcome,
};
pub use trace::{ensure_trace_id, new_trace_id};
