//! lanequeue library root.
//!
//! A per-key FIFO message queue over a shared store, claimed under
//! token-guarded leases, drained by a poll-dispatch consumer.

pub mod cli;
pub mod config;
pub mod consumer;
pub mod core;
pub mod error;
pub mod logging;
pub mod store;

pub use cli::Commands;
pub use config::{load_settings, QueueSettings, Settings};
pub use consumer::{
    Consumer, ConsumerConfig, ConsumerHandle, Fetch, MessageHandler, Process, QueueConsumer,
    ShutdownReport,
};
pub use self::core::{ClaimedMessage, Envelope, QueueDocument, QueueStore, ReleaseOutcome};
pub use error::{Error, Result};
pub use store::{MemoryQueueStore, SqliteQueueStore};
