//! Queue store backends.

pub mod memory;
pub mod sqlite;

pub use memory::MemoryQueueStore;
pub use sqlite::SqliteQueueStore;
