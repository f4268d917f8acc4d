//! Error types for lanequeue.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A backing store operation failed. `context` names the operation and key.
    #[error("Store error ({context}): {source}")]
    Store {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Task error: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Wrap a SQLite error with the operation that produced it.
    pub fn store(context: impl Into<String>, source: rusqlite::Error) -> Self {
        Error::Store {
            context: context.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_carries_context() {
        let err = Error::store("enqueue key=42", rusqlite::Error::QueryReturnedNoRows);
        let text = err.to_string();
        assert!(text.contains("enqueue key=42"));
        assert!(text.contains("Store error"));
    }
}
