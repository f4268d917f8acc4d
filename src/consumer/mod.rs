//! Consumer module - generic poll-dispatch loop and its queue binding.

pub mod poller;
pub mod queue;

pub use poller::{Consumer, ConsumerConfig, ConsumerHandle, Fetch, Process, ShutdownReport};
pub use queue::{ClaimFetcher, MessageHandler, QueueConsumer, QueueProcessor};
