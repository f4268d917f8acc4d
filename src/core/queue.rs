//! Per-key FIFO queue data model and the store contract.
//!
//! Each key (typically a chat id) owns one document holding an ordered list of
//! envelopes and an optional lease:
//! - enqueue appends to the tail of the key's list
//! - claim pops the head and takes the lease in one atomic store update
//! - release clears the lease, or deletes the document once it is drained

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Current time in milliseconds since the epoch.
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Leases started before this instant have expired.
pub fn lease_cutoff(now: i64, timeout: Duration) -> i64 {
    let timeout_ms = i64::try_from(timeout.as_millis()).unwrap_or(i64::MAX);
    now.saturating_sub(timeout_ms)
}

/// Generate a fresh lease token. Unique per claim attempt.
pub fn new_lease_token() -> String {
    ulid::Ulid::new().to_string()
}

/// One queued unit stored inside a key's message list.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Envelope {
    /// Enqueue time in milliseconds since the epoch
    pub created_at: i64,

    /// Caller-defined payload
    pub payload: serde_json::Value,

    /// Correlation id propagated from the producer
    #[serde(default)]
    pub trace_id: String,
}

impl Envelope {
    /// Create an envelope stamped with the current time.
    pub fn new(payload: serde_json::Value, trace_id: &str) -> Self {
        Self {
            created_at: now_millis(),
            payload,
            trace_id: trace_id.to_string(),
        }
    }
}

/// Exclusive, time-boxed claim on a key's document.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct Lease {
    pub started_at: i64,
    pub token: String,
}

impl Lease {
    pub fn new(started_at: i64) -> Self {
        Self {
            started_at,
            token: new_lease_token(),
        }
    }

    /// A lease older than `timeout` no longer protects the document.
    pub fn is_expired(&self, now: i64, timeout: Duration) -> bool {
        self.started_at < lease_cutoff(now, timeout)
    }
}

/// Queue document, one per distinct key.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct QueueDocument {
    pub key: String,
    pub messages: VecDeque<Envelope>,
    pub lease: Option<Lease>,
}

impl QueueDocument {
    pub fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            messages: VecDeque::new(),
            lease: None,
        }
    }

    /// Whether `claim_next` may take this document.
    pub fn is_claimable(&self, now: i64, lease_timeout: Duration) -> bool {
        match &self.lease {
            None => true,
            Some(lease) => lease.is_expired(now, lease_timeout),
        }
    }

    pub fn head_created_at(&self) -> Option<i64> {
        self.messages.front().map(|m| m.created_at)
    }

    /// Whether the current lease carries `token`.
    pub fn is_leased_by(&self, token: &str) -> bool {
        self.lease.as_ref().map_or(false, |l| l.token == token)
    }
}

/// A message removed from the head of a key's list, together with the lease
/// that now guards the key.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ClaimedMessage {
    pub key: String,
    pub token: String,
    pub created_at: i64,
    pub payload: serde_json::Value,
    pub trace_id: String,
}

impl ClaimedMessage {
    pub fn from_envelope(key: &str, token: &str, envelope: Envelope) -> Self {
        Self {
            key: key.to_string(),
            token: token.to_string(),
            created_at: envelope.created_at,
            payload: envelope.payload,
            trace_id: envelope.trace_id,
        }
    }

    /// Decode the payload into a concrete type.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

impl std::fmt::Display for ClaimedMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match serde_json::to_string(self) {
            Ok(json) => write!(f, "{}", json),
            Err(e) => write!(f, "cannot represent as json: {}", e),
        }
    }
}

/// What `release_or_complete` did to the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The list was empty and the document was deleted.
    Completed,
    /// The lease was cleared; remaining messages are claimable again.
    Released,
    /// The token no longer matches (or the document is gone). Nothing changed.
    Stale,
}

/// Queue statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub documents: usize,
    pub pending_messages: usize,
    pub leased: usize,
}

impl std::fmt::Display for QueueStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Queue Stats:")?;
        writeln!(f, "  Keys:     {}", self.documents)?;
        writeln!(f, "  Pending:  {}", self.pending_messages)?;
        write!(f, "  Leased:   {}", self.leased)
    }
}

/// Storage of per-key message lists with a lease field.
///
/// Implementations must make `claim_next` and `release_or_complete` single
/// atomic updates: two concurrent claimers never both win the same document.
#[async_trait]
pub trait QueueStore: Send + Sync {
    /// Append a message to the tail of `key`'s list, creating the document if absent.
    async fn enqueue(&self, key: &str, payload: serde_json::Value, trace_id: &str) -> Result<()>;

    /// Take the lease on the claimable document with the oldest head message and
    /// pop that message. `None` when nothing is claimable.
    async fn claim_next(&self, lease_timeout: Duration) -> Result<Option<ClaimedMessage>>;

    /// Finish a claim: delete the document if drained, otherwise clear the lease.
    /// A token that no longer matches is a no-op.
    async fn release_or_complete(&self, key: &str, token: &str) -> Result<ReleaseOutcome>;

    /// Read a document without modifying it.
    async fn document(&self, key: &str) -> Result<Option<QueueDocument>>;

    async fn stats(&self) -> Result<QueueStats>;
}

/// Serialize `payload` and enqueue it.
pub async fn enqueue_json<T: Serialize + ?Sized>(
    store: &dyn QueueStore,
    key: &str,
    payload: &T,
    trace_id: &str,
) -> Result<()> {
    let value = serde_json::to_value(payload)?;
    store.enqueue(key, value, trace_id).await
}

/// Reject keys the stores cannot index.
pub(crate) fn validate_key(key: &str) -> Result<()> {
    if key.is_empty() {
        return Err(Error::Queue("queue key must not be empty".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_lease_expiry() {
        let lease = Lease::new(10_000);
        let timeout = Duration::from_millis(1_000);

        assert!(!lease.is_expired(10_500, timeout));
        assert!(!lease.is_expired(11_000, timeout));
        assert!(lease.is_expired(11_001, timeout));
    }

    #[test]
    fn test_huge_lease_timeout_never_expires() {
        let lease = Lease::new(0);
        let forever = Duration::from_millis(1 << 63);

        assert_eq!(lease_cutoff(1_000, forever), 1_000 - i64::MAX);
        assert_eq!(lease_cutoff(i64::MIN + 5, Duration::MAX), i64::MIN);
        assert!(!lease.is_expired(now_millis(), forever));
    }

    #[test]
    fn test_lease_tokens_unique() {
        let a = Lease::new(1);
        let b = Lease::new(1);
        assert_ne!(a.token, b.token);
    }

    #[test]
    fn test_document_claimable() {
        let timeout = Duration::from_millis(100);
        let mut doc = QueueDocument::new("42");
        assert!(doc.is_claimable(1_000, timeout));

        doc.lease = Some(Lease::new(1_000));
        assert!(!doc.is_claimable(1_050, timeout));
        assert!(doc.is_claimable(1_200, timeout));
    }

    #[test]
    fn test_claimed_message_payload_as() {
        #[derive(Deserialize)]
        struct Update {
            text: String,
        }

        let envelope = Envelope::new(json!({"text": "hi"}), "trace-1");
        let claimed = ClaimedMessage::from_envelope("42", "tok", envelope);
        let update: Update = claimed.payload_as().unwrap();

        assert_eq!(update.text, "hi");
        assert_eq!(claimed.trace_id, "trace-1");
        assert!(claimed.payload_as::<Vec<i32>>().is_err());
    }

    #[test]
    fn test_validate_key() {
        assert!(validate_key("42").is_ok());
        assert!(validate_key("").is_err());
    }
}
