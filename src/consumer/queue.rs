//! Binding between the queue store and the poll-dispatch consumer.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::Instrument;

use super::poller::{Consumer, ConsumerConfig, Fetch, Process};
use crate::config::QueueSettings;
use crate::core::{ClaimedMessage, QueueStore, ReleaseOutcome};

/// Adapts `claim_next` into a [`Fetch`]. Store errors count as "no work".
pub struct ClaimFetcher {
    store: Arc<dyn QueueStore>,
    lease_timeout: Duration,
}

impl ClaimFetcher {
    pub fn new(store: Arc<dyn QueueStore>, lease_timeout: Duration) -> Self {
        Self {
            store,
            lease_timeout,
        }
    }
}

#[async_trait]
impl Fetch for ClaimFetcher {
    type Item = ClaimedMessage;

    async fn fetch(&self) -> Option<ClaimedMessage> {
        match self.store.claim_next(self.lease_timeout).await {
            Ok(Some(message)) => {
                tracing::info!(
                    key = %message.key,
                    token = %message.token,
                    trace_id = %message.trace_id,
                    "Claimed message"
                );
                Some(message)
            }
            Ok(None) => None,
            Err(e) => {
                tracing::error!("Failed to claim next message: {}", e);
                None
            }
        }
    }
}

/// Application logic run for each claimed message.
///
/// The message has already left the store when this runs; returning an error
/// only logs it. Handlers needing stronger guarantees must be idempotent and
/// persist their own progress.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: ClaimedMessage) -> anyhow::Result<()>;
}

#[async_trait]
impl<F, Fut> MessageHandler for F
where
    F: Fn(ClaimedMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, message: ClaimedMessage) -> anyhow::Result<()> {
        (self)(message).await
    }
}

/// Runs the handler, then releases or completes the claim.
pub struct QueueProcessor<H> {
    store: Arc<dyn QueueStore>,
    handler: H,
}

impl<H: MessageHandler> QueueProcessor<H> {
    pub fn new(store: Arc<dyn QueueStore>, handler: H) -> Self {
        Self { store, handler }
    }

    async fn run(&self, message: ClaimedMessage) {
        let key = message.key.clone();
        let token = message.token.clone();

        if let Err(e) = self.handler.handle(message).await {
            tracing::error!("Message handler failed, message dropped: {:#}", e);
        }

        match self.store.release_or_complete(&key, &token).await {
            Ok(ReleaseOutcome::Stale) => {}
            Ok(outcome) => tracing::debug!(?outcome, "Finished processing"),
            Err(e) => tracing::error!("Failed to finish processing: {}", e),
        }
    }
}

#[async_trait]
impl<H: MessageHandler> Process<ClaimedMessage> for QueueProcessor<H> {
    async fn process(&self, message: ClaimedMessage) {
        let span = tracing::info_span!(
            "message",
            key = %message.key,
            trace_id = %message.trace_id
        );
        self.run(message).instrument(span).await
    }
}

/// Consumer draining a queue store with a message handler.
pub type QueueConsumer<H> = Consumer<ClaimFetcher, QueueProcessor<H>>;

impl<H: MessageHandler> QueueConsumer<H> {
    /// Wire a store and handler into a consumer configured from `settings`.
    pub fn from_store(store: Arc<dyn QueueStore>, handler: H, settings: &QueueSettings) -> Self {
        let fetcher = ClaimFetcher::new(store.clone(), settings.lease_timeout());
        let processor = QueueProcessor::new(store, handler);
        Consumer::new(fetcher, processor, ConsumerConfig::from(settings))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryQueueStore;
    use serde_json::json;
    use std::sync::Mutex;

    fn settings() -> QueueSettings {
        QueueSettings {
            fetch_delay_ms: 10,
            shutdown_timeout_ms: 500,
            ..QueueSettings::default()
        }
    }

    #[tokio::test]
    async fn test_consumer_drains_store_in_key_order() {
        let store: Arc<dyn QueueStore> = Arc::new(MemoryQueueStore::new());
        for i in 0..3 {
            store.enqueue("a", json!(i), "").await.unwrap();
            store.enqueue("b", json!(10 + i), "").await.unwrap();
        }

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = move |message: ClaimedMessage| {
            let sink = sink.clone();
            async move {
                sink.lock()
                    .unwrap()
                    .push((message.key.clone(), message.payload_as::<i64>()?));
                Ok::<(), anyhow::Error>(())
            }
        };

        let handle = QueueConsumer::from_store(store.clone(), handler, &settings()).run();
        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.stop().await;

        let seen = seen.lock().unwrap().clone();
        let a: Vec<i64> = seen.iter().filter(|(k, _)| k == "a").map(|(_, v)| *v).collect();
        let b: Vec<i64> = seen.iter().filter(|(k, _)| k == "b").map(|(_, v)| *v).collect();
        assert_eq!(a, vec![0, 1, 2]);
        assert_eq!(b, vec![10, 11, 12]);
        assert_eq!(store.stats().await.unwrap(), Default::default());
    }

    #[tokio::test]
    async fn test_failed_handler_still_releases() {
        let store: Arc<dyn QueueStore> = Arc::new(MemoryQueueStore::new());
        store.enqueue("k", json!("bad"), "").await.unwrap();
        store.enqueue("k", json!("good"), "").await.unwrap();

        let processor = QueueProcessor::new(store.clone(), |message: ClaimedMessage| async move {
            if message.payload == json!("bad") {
                anyhow::bail!("cannot handle {}", message.payload);
            }
            Ok::<(), anyhow::Error>(())
        });

        let first = store.claim_next(Duration::from_secs(20)).await.unwrap().unwrap();
        processor.process(first).await;
        let doc = store.document("k").await.unwrap().unwrap();
        assert!(doc.lease.is_none());
        assert_eq!(doc.messages.len(), 1);

        let second = store.claim_next(Duration::from_secs(20)).await.unwrap().unwrap();
        processor.process(second).await;
        assert!(store.document("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_null_payload_reaches_handler() {
        let store: Arc<dyn QueueStore> = Arc::new(MemoryQueueStore::new());
        store.enqueue("k", serde_json::Value::Null, "t-null").await.unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let processor = QueueProcessor::new(store.clone(), move |message: ClaimedMessage| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(message.payload.clone());
                Ok::<(), anyhow::Error>(())
            }
        });

        let claimed = store.claim_next(Duration::from_secs(20)).await.unwrap().unwrap();
        processor.process(claimed).await;

        assert_eq!(*seen.lock().unwrap(), vec![serde_json::Value::Null]);
        assert!(store.document("k").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_one_key_is_never_processed_concurrently() {
        let store: Arc<dyn QueueStore> = Arc::new(MemoryQueueStore::new());
        for i in 0..4 {
            store.enqueue("chat", json!(i), "").await.unwrap();
        }

        let active = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let overlap = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let (a, o) = (active.clone(), overlap.clone());
        let handler = move |_message: ClaimedMessage| {
            let (active, overlap) = (a.clone(), o.clone());
            async move {
                use std::sync::atomic::Ordering;
                if active.fetch_add(1, Ordering::SeqCst) > 0 {
                    overlap.store(true, Ordering::SeqCst);
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
                active.fetch_sub(1, Ordering::SeqCst);
                Ok::<(), anyhow::Error>(())
            }
        };

        // Two consumers racing on the same store.
        let first = QueueConsumer::from_store(store.clone(), handler.clone(), &settings()).run();
        let second = QueueConsumer::from_store(store.clone(), handler, &settings()).run();
        tokio::time::sleep(Duration::from_millis(400)).await;
        first.stop().await;
        second.stop().await;

        assert!(!overlap.load(std::sync::atomic::Ordering::SeqCst));
        assert!(store.document("chat").await.unwrap().is_none());
    }
}
