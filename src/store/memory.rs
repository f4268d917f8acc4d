//! In-process queue store.
//!
//! Holds every document behind one mutex, which is the atomicity boundary for
//! claim and release. Only coordinates consumers inside a single process.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;

use crate::core::queue::{now_millis, validate_key};
use crate::core::{
    ensure_trace_id, ClaimedMessage, Envelope, Lease, QueueDocument, QueueStats, QueueStore,
    ReleaseOutcome,
};
use crate::error::{Error, Result};

#[derive(Default)]
pub struct MemoryQueueStore {
    documents: Mutex<HashMap<String, QueueDocument>>,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, HashMap<String, QueueDocument>>> {
        self.documents
            .lock()
            .map_err(|_| Error::Queue("memory store mutex poisoned".to_string()))
    }

    fn claim_at(&self, now: i64, lease_timeout: Duration) -> Result<Option<ClaimedMessage>> {
        let mut documents = self.lock()?;

        // Drained documents sort first so a stale empty one gets cleaned up.
        let key = documents
            .values()
            .filter(|doc| doc.is_claimable(now, lease_timeout))
            .min_by_key(|doc| (doc.head_created_at().is_some(), doc.head_created_at(), doc.key.clone()))
            .map(|doc| doc.key.clone());

        let Some(key) = key else {
            return Ok(None);
        };
        let Some(doc) = documents.get_mut(&key) else {
            return Ok(None);
        };

        let lease = Lease::new(now);
        let previous = doc.lease.replace(lease.clone());

        let Some(envelope) = doc.messages.pop_front() else {
            tracing::warn!(key = %key, token = %lease.token, "Got document without messages, finish processing");
            documents.remove(&key);
            return Ok(None);
        };

        if previous.is_some() {
            tracing::warn!(key = %key, token = %lease.token, "Previous processing for key took too long");
        }

        tracing::debug!(key = %key, token = %lease.token, "Claimed message");
        Ok(Some(ClaimedMessage::from_envelope(&key, &lease.token, envelope)))
    }
}

#[async_trait]
impl QueueStore for MemoryQueueStore {
    async fn enqueue(&self, key: &str, payload: serde_json::Value, trace_id: &str) -> Result<()> {
        validate_key(key)?;
        let envelope = Envelope::new(payload, &ensure_trace_id(trace_id));

        let mut documents = self.lock()?;
        documents
            .entry(key.to_string())
            .or_insert_with(|| QueueDocument::new(key))
            .messages
            .push_back(envelope);

        tracing::debug!(key = %key, "Enqueued message");
        Ok(())
    }

    async fn claim_next(&self, lease_timeout: Duration) -> Result<Option<ClaimedMessage>> {
        self.claim_at(now_millis(), lease_timeout)
    }

    async fn release_or_complete(&self, key: &str, token: &str) -> Result<ReleaseOutcome> {
        let mut documents = self.lock()?;

        let outcome = match documents.get_mut(key) {
            Some(doc) if doc.is_leased_by(token) => {
                if doc.messages.is_empty() {
                    documents.remove(key);
                    ReleaseOutcome::Completed
                } else {
                    doc.lease = None;
                    ReleaseOutcome::Released
                }
            }
            _ => ReleaseOutcome::Stale,
        };

        if outcome == ReleaseOutcome::Stale {
            tracing::warn!(key = %key, token = %token, "Message document with such lease token no longer exists");
        }
        Ok(outcome)
    }

    async fn document(&self, key: &str) -> Result<Option<QueueDocument>> {
        Ok(self.lock()?.get(key).cloned())
    }

    async fn stats(&self) -> Result<QueueStats> {
        let documents = self.lock()?;
        Ok(QueueStats {
            documents: documents.len(),
            pending_messages: documents.values().map(|d| d.messages.len()).sum(),
            leased: documents.values().filter(|d| d.lease.is_some()).count(),
        })
    }
}
