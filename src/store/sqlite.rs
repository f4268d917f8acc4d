//! SQLite-backed queue store shared by every consumer process on the host.
//!
//! One row per (queue, key). The envelope list is a JSON array in `messages`;
//! `head_created_at` mirrors the head envelope so the oldest pending key can be
//! found by index. Every mutation runs in a `BEGIN IMMEDIATE` transaction, which
//! takes the database write lock up front and turns each read-modify-write into
//! one atomic find-and-modify across connections and processes.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};

use crate::config::QueueSettings;
use crate::core::queue::{lease_cutoff, now_millis, validate_key};
use crate::core::{
    ensure_trace_id, ClaimedMessage, Envelope, Lease, QueueDocument, QueueStats, QueueStore,
    ReleaseOutcome,
};
use crate::error::{Error, Result};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS queue_documents (
    queue TEXT NOT NULL,
    key TEXT NOT NULL,
    messages TEXT NOT NULL DEFAULT '[]',
    head_created_at INTEGER,
    lease_started_at INTEGER,
    lease_token TEXT,
    PRIMARY KEY (queue, key)
);
CREATE INDEX IF NOT EXISTS idx_queue_documents_head ON queue_documents(queue, head_created_at);
CREATE INDEX IF NOT EXISTS idx_queue_documents_lease ON queue_documents(queue, lease_token);
"#;

/// Durable queue store over a SQLite database file.
#[derive(Clone)]
pub struct SqliteQueueStore {
    conn: Arc<Mutex<Connection>>,
    queue: String,
    path: PathBuf,
}

impl SqliteQueueStore {
    /// Open (or create) the database at `path` and bind to the queue `queue`.
    pub fn open(path: &Path, queue: &str, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path).map_err(|e| Error::store("sqlite open", e))?;
        conn.busy_timeout(busy_timeout)
            .map_err(|e| Error::store("sqlite busy_timeout", e))?;
        let _mode: String = conn
            .query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
            .map_err(|e| Error::store("sqlite journal_mode", e))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| Error::store("sqlite init", e))?;

        tracing::info!(path = %path.display(), queue = %queue, "Opened queue store");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            queue: queue.to_string(),
            path: path.to_path_buf(),
        })
    }

    /// Open the store described by the queue settings.
    pub fn from_settings(settings: &QueueSettings) -> Result<Self> {
        let path = settings.database_path()?;
        Self::open(&path, &settings.queue_name, settings.busy_timeout())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn queue_name(&self) -> &str {
        &self.queue
    }

    /// Run blocking SQLite work off the async runtime.
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection, &str) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        let queue = self.queue.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| Error::Queue("sqlite connection mutex poisoned".to_string()))?;
            f(&mut guard, &queue)
        })
        .await?
    }
}

fn begin<'a>(conn: &'a mut Connection, context: &str) -> Result<Transaction<'a>> {
    conn.transaction_with_behavior(TransactionBehavior::Immediate)
        .map_err(|e| Error::store(format!("{} begin", context), e))
}

fn decode_messages(raw: &str, context: &str) -> Result<VecDeque<Envelope>> {
    serde_json::from_str(raw)
        .map_err(|e| Error::Queue(format!("{}: corrupt message list: {}", context, e)))
}

fn enqueue_blocking(conn: &mut Connection, queue: &str, key: &str, envelope: Envelope) -> Result<()> {
    let context = format!("enqueue key={}", key);
    let tx = begin(conn, &context)?;

    let existing: Option<String> = tx
        .query_row(
            "SELECT messages FROM queue_documents WHERE queue = ?1 AND key = ?2",
            params![queue, key],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| Error::store(&context, e))?;

    match existing {
        Some(raw) => {
            let mut messages = decode_messages(&raw, &context)?;
            messages.push_back(envelope);
            let head = messages.front().map(|m| m.created_at);
            tx.execute(
                "UPDATE queue_documents SET messages = ?3, head_created_at = ?4 WHERE queue = ?1 AND key = ?2",
                params![queue, key, serde_json::to_string(&messages)?, head],
            )
            .map_err(|e| Error::store(&context, e))?;
        }
        None => {
            let head = envelope.created_at;
            let messages = vec![envelope];
            tx.execute(
                "INSERT INTO queue_documents (queue, key, messages, head_created_at) VALUES (?1, ?2, ?3, ?4)",
                params![queue, key, serde_json::to_string(&messages)?, head],
            )
            .map_err(|e| Error::store(&context, e))?;
        }
    }

    tx.commit().map_err(|e| Error::store(&context, e))?;
    Ok(())
}

fn claim_blocking(
    conn: &mut Connection,
    queue: &str,
    now: i64,
    lease_timeout: Duration,
) -> Result<Option<ClaimedMessage>> {
    let context = "claim_next";
    let tx = begin(conn, context)?;
    let expired_before = lease_cutoff(now, lease_timeout);

    // Drained documents sort first so a stale empty one gets cleaned up.
    let row: Option<(String, String, Option<i64>)> = tx
        .query_row(
            "SELECT key, messages, lease_started_at FROM queue_documents
             WHERE queue = ?1 AND (lease_token IS NULL OR lease_started_at < ?2)
             ORDER BY head_created_at IS NOT NULL, head_created_at ASC, key ASC
             LIMIT 1",
            params![queue, expired_before],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()
        .map_err(|e| Error::store(context, e))?;

    let Some((key, raw, previous_started_at)) = row else {
        return Ok(None);
    };

    let key_context = format!("claim_next key={}", key);
    let mut messages = decode_messages(&raw, &key_context)?;
    let lease = Lease::new(now);

    let Some(envelope) = messages.pop_front() else {
        tracing::warn!(key = %key, token = %lease.token, "Got document without messages, finish processing");
        tx.execute(
            "DELETE FROM queue_documents WHERE queue = ?1 AND key = ?2",
            params![queue, key],
        )
        .map_err(|e| Error::store(&key_context, e))?;
        tx.commit().map_err(|e| Error::store(&key_context, e))?;
        return Ok(None);
    };

    let head = messages.front().map(|m| m.created_at);
    tx.execute(
        "UPDATE queue_documents
         SET messages = ?3, head_created_at = ?4, lease_started_at = ?5, lease_token = ?6
         WHERE queue = ?1 AND key = ?2",
        params![
            queue,
            key,
            serde_json::to_string(&messages)?,
            head,
            lease.started_at,
            lease.token
        ],
    )
    .map_err(|e| Error::store(&key_context, e))?;
    tx.commit().map_err(|e| Error::store(&key_context, e))?;

    if previous_started_at.is_some() {
        tracing::warn!(key = %key, token = %lease.token, "Previous processing for key took too long");
    }
    tracing::debug!(key = %key, token = %lease.token, "Claimed message");

    Ok(Some(ClaimedMessage::from_envelope(&key, &lease.token, envelope)))
}

fn release_blocking(conn: &mut Connection, queue: &str, key: &str, token: &str) -> Result<ReleaseOutcome> {
    let context = format!("release_or_complete key={}", key);
    let tx = begin(conn, &context)?;

    let deleted = tx
        .execute(
            "DELETE FROM queue_documents
             WHERE queue = ?1 AND key = ?2 AND lease_token = ?3 AND head_created_at IS NULL",
            params![queue, key, token],
        )
        .map_err(|e| Error::store(&context, e))?;

    let outcome = if deleted > 0 {
        ReleaseOutcome::Completed
    } else {
        let updated = tx
            .execute(
                "UPDATE queue_documents SET lease_started_at = NULL, lease_token = NULL
                 WHERE queue = ?1 AND key = ?2 AND lease_token = ?3",
                params![queue, key, token],
            )
            .map_err(|e| Error::store(&context, e))?;
        if updated > 0 {
            ReleaseOutcome::Released
        } else {
            ReleaseOutcome::Stale
        }
    };

    tx.commit().map_err(|e| Error::store(&context, e))?;

    if outcome == ReleaseOutcome::Stale {
        tracing::warn!(key = %key, token = %token, "Message document with such lease token no longer exists");
    }
    Ok(outcome)
}

fn document_blocking(conn: &Connection, queue: &str, key: &str) -> Result<Option<QueueDocument>> {
    let context = format!("document key={}", key);
    let row: Option<(String, Option<i64>, Option<String>)> = conn
        .query_row(
            "SELECT messages, lease_started_at, lease_token FROM queue_documents WHERE queue = ?1 AND key = ?2",
            params![queue, key],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()
        .map_err(|e| Error::store(&context, e))?;

    let Some((raw, started_at, token)) = row else {
        return Ok(None);
    };

    let lease = match (started_at, token) {
        (Some(started_at), Some(token)) => Some(Lease { started_at, token }),
        _ => None,
    };

    Ok(Some(QueueDocument {
        key: key.to_string(),
        messages: decode_messages(&raw, &context)?,
        lease,
    }))
}

fn stats_blocking(conn: &Connection, queue: &str) -> Result<QueueStats> {
    let mut stmt = conn
        .prepare("SELECT messages, lease_token IS NOT NULL FROM queue_documents WHERE queue = ?1")
        .map_err(|e| Error::store("stats prepare", e))?;
    let rows = stmt
        .query_map(params![queue], |row| Ok((row.get::<_, String>(0)?, row.get::<_, bool>(1)?)))
        .map_err(|e| Error::store("stats query", e))?;

    let mut stats = QueueStats::default();
    for row in rows {
        let (raw, leased) = row.map_err(|e| Error::store("stats read", e))?;
        stats.documents += 1;
        stats.pending_messages += decode_messages(&raw, "stats")?.len();
        if leased {
            stats.leased += 1;
        }
    }
    Ok(stats)
}

#[async_trait]
impl QueueStore for SqliteQueueStore {
    async fn enqueue(&self, key: &str, payload: serde_json::Value, trace_id: &str) -> Result<()> {
        validate_key(key)?;
        let envelope = Envelope::new(payload, &ensure_trace_id(trace_id));
        let key = key.to_string();
        self.with_conn(move |conn, queue| {
            enqueue_blocking(conn, queue, &key, envelope)?;
            tracing::debug!(key = %key, "Enqueued message");
            Ok(())
        })
        .await
    }

    async fn claim_next(&self, lease_timeout: Duration) -> Result<Option<ClaimedMessage>> {
        self.with_conn(move |conn, queue| claim_blocking(conn, queue, now_millis(), lease_timeout))
            .await
    }

    async fn release_or_complete(&self, key: &str, token: &str) -> Result<ReleaseOutcome> {
        let key = key.to_string();
        let token = token.to_string();
        self.with_conn(move |conn, queue| release_blocking(conn, queue, &key, &token))
            .await
    }

    async fn document(&self, key: &str) -> Result<Option<QueueDocument>> {
        let key = key.to_string();
        self.with_conn(move |conn, queue| document_blocking(conn, queue, &key))
            .await
    }

    async fn stats(&self) -> Result<QueueStats> {
        self.with_conn(|conn, queue| stats_blocking(conn, queue)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    const TIMEOUT: Duration = Duration::from_millis(20_000);

    fn open(dir: &TempDir, queue: &str) -> SqliteQueueStore {
        SqliteQueueStore::open(&dir.path().join("queue.db"), queue, Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_enqueue_claim_release_scenario() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, "messages");

        store.enqueue("42", json!("a"), "").await.unwrap();
        store.enqueue("42", json!("b"), "").await.unwrap();

        let first = store.claim_next(TIMEOUT).await.unwrap().unwrap();
        assert_eq!(first.key, "42");
        assert_eq!(first.payload, json!("a"));

        let outcome = store.release_or_complete("42", &first.token).await.unwrap();
        assert_eq!(outcome, ReleaseOutcome::Released);
        let doc = store.document("42").await.unwrap().unwrap();
        assert_eq!(doc.messages.len(), 1);
        assert!(doc.lease.is_none());

        let second = store.claim_next(TIMEOUT).await.unwrap().unwrap();
        assert_eq!(second.payload, json!("b"));

        let outcome = store.release_or_complete("42", &second.token).await.unwrap();
        assert_eq!(outcome, ReleaseOutcome::Completed);
        assert!(store.document("42").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fifo_per_key_interleaved_with_other_keys() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, "messages");

        for i in 0..3 {
            store.enqueue("k", json!(i), "").await.unwrap();
            store.enqueue("other", json!(100 + i), "").await.unwrap();
        }

        let mut seen = Vec::new();
        while let Some(claimed) = store.claim_next(TIMEOUT).await.unwrap() {
            if claimed.key == "k" {
                seen.push(claimed.payload.as_i64().unwrap());
            }
            store.release_or_complete(&claimed.key, &claimed.token).await.unwrap();
        }

        assert_eq!(seen, vec![0, 1, 2]);
        assert_eq!(store.stats().await.unwrap(), QueueStats::default());
    }

    #[tokio::test]
    async fn test_oldest_head_wins_across_keys() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, "messages");
        store.enqueue("old", json!("first"), "").await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        store.enqueue("new", json!("second"), "").await.unwrap();

        let claimed = store.claim_next(TIMEOUT).await.unwrap().unwrap();
        assert_eq!(claimed.key, "old");
        let claimed = store.claim_next(TIMEOUT).await.unwrap().unwrap();
        assert_eq!(claimed.key, "new");
    }

    #[tokio::test]
    async fn test_concurrent_claimers_never_share_a_key() {
        let dir = TempDir::new().unwrap();
        let seed = open(&dir, "messages");
        for i in 0..5 {
            seed.enqueue("chat", json!(i), "").await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = open(&dir, "messages");
            handles.push(tokio::spawn(async move { store.claim_next(TIMEOUT).await }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_abandoned_lease_self_heals() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, "messages");
        store.enqueue("x", json!(1), "").await.unwrap();
        store.enqueue("x", json!(2), "").await.unwrap();

        let timeout = Duration::from_millis(50);
        let first = store.claim_next(timeout).await.unwrap().unwrap();
        assert!(store.claim_next(timeout).await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(80)).await;

        let second = store.claim_next(timeout).await.unwrap().unwrap();
        assert_eq!(second.key, "x");
        assert_eq!(second.payload, json!(2));
        assert_ne!(first.token, second.token);

        let stale = store.release_or_complete("x", &first.token).await.unwrap();
        assert_eq!(stale, ReleaseOutcome::Stale);
        let doc = store.document("x").await.unwrap().unwrap();
        assert!(doc.is_leased_by(&second.token));
    }

    #[tokio::test]
    async fn test_huge_lease_timeout_keeps_lease() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, "messages");
        store.enqueue("x", json!(1), "").await.unwrap();
        store.enqueue("x", json!(2), "").await.unwrap();

        let forever = Duration::from_millis(1 << 63);
        assert!(store.claim_next(forever).await.unwrap().is_some());
        assert!(store.claim_next(Duration::MAX).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_token_never_deletes() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, "messages");
        store.enqueue("x", json!(1), "").await.unwrap();

        let claimed = store.claim_next(TIMEOUT).await.unwrap().unwrap();
        let outcome = store.release_or_complete("x", "not-the-token").await.unwrap();
        assert_eq!(outcome, ReleaseOutcome::Stale);
        assert!(store.document("x").await.unwrap().is_some());

        assert_eq!(
            store.release_or_complete("x", &claimed.token).await.unwrap(),
            ReleaseOutcome::Completed
        );
        assert_eq!(
            store.release_or_complete("x", &claimed.token).await.unwrap(),
            ReleaseOutcome::Stale
        );
    }

    #[tokio::test]
    async fn test_empty_document_with_stale_lease_is_cleaned() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, "messages");
        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "INSERT INTO queue_documents (queue, key, messages, lease_started_at, lease_token)
                 VALUES ('messages', 'ghost', '[]', 0, 'old')",
                [],
            )
            .unwrap();
        }

        assert!(store.claim_next(TIMEOUT).await.unwrap().is_none());
        assert!(store.document("ghost").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_queues_are_isolated() {
        let dir = TempDir::new().unwrap();
        let updates = open(&dir, "updates");
        let replies = open(&dir, "replies");

        updates.enqueue("42", json!("u"), "").await.unwrap();
        assert!(replies.claim_next(TIMEOUT).await.unwrap().is_none());
        assert_eq!(replies.stats().await.unwrap().documents, 0);

        let claimed = updates.claim_next(TIMEOUT).await.unwrap().unwrap();
        assert_eq!(claimed.payload, json!("u"));
        assert_eq!(updates.stats().await.unwrap().leased, 1);
    }
}
