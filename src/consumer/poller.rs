//! Generic poll-dispatch consumer.
//!
//! A single control task calls [`Fetch::fetch`] in a loop. Every item it gets is
//! handed to [`Process::process`] on its own task and the loop keeps polling
//! without waiting for it. When fetch yields nothing the loop sleeps for
//! `fetch_delay` before trying again.
//!
//! Stopping is best effort: in-flight tasks are awaited up to
//! `shutdown_timeout`, anything still running after that is detached and left
//! to finish on its own. Detached tasks are never aborted.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;

use crate::config::QueueSettings;

/// Extra time `stop` allows the control task past the drain deadline.
const STOP_GRACE: Duration = Duration::from_millis(100);

/// Source of work items.
///
/// Implementations handle their own errors; a failed fetch is reported as `None`.
#[async_trait]
pub trait Fetch: Send + Sync + 'static {
    type Item: Send + 'static;

    async fn fetch(&self) -> Option<Self::Item>;
}

/// Runs one work item.
#[async_trait]
pub trait Process<T>: Send + Sync + 'static {
    async fn process(&self, item: T);
}

#[async_trait]
impl<T, F, Fut> Process<T> for F
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    async fn process(&self, item: T) {
        (self)(item).await
    }
}

/// Consumer loop tuning.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Sleep between polls that found nothing
    pub fetch_delay: Duration,
    /// Upper bound on waiting for in-flight tasks during stop
    pub shutdown_timeout: Duration,
    /// Cap on concurrently running tasks; `None` spawns without limit
    pub max_in_flight: Option<usize>,
    /// Fetches slower than this are logged as warnings
    pub slow_fetch_threshold: Duration,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            fetch_delay: Duration::from_millis(100),
            shutdown_timeout: Duration::from_secs(5),
            max_in_flight: None,
            slow_fetch_threshold: Duration::from_secs(1),
        }
    }
}

impl From<&QueueSettings> for ConsumerConfig {
    fn from(settings: &QueueSettings) -> Self {
        Self {
            fetch_delay: settings.fetch_delay(),
            shutdown_timeout: settings.shutdown_timeout(),
            max_in_flight: settings.max_in_flight,
            slow_fetch_threshold: settings.slow_fetch_threshold(),
        }
    }
}

/// What happened to in-flight work during stop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Tasks that finished while stop was waiting
    pub drained: usize,
    /// Tasks left running when the timeout hit
    pub abandoned: usize,
    /// Whether the shutdown timeout was exceeded
    pub timed_out: bool,
}

/// Poll-dispatch consumer over a fetcher and a processor.
pub struct Consumer<F, P> {
    fetcher: Arc<F>,
    processor: Arc<P>,
    config: ConsumerConfig,
}

impl<F, P> Consumer<F, P>
where
    F: Fetch,
    P: Process<F::Item>,
{
    pub fn new(fetcher: F, processor: P, config: ConsumerConfig) -> Self {
        Self {
            fetcher: Arc::new(fetcher),
            processor: Arc::new(processor),
            config,
        }
    }

    pub fn config(&self) -> &ConsumerConfig {
        &self.config
    }

    /// Start the control loop on the runtime.
    pub fn run(self) -> ConsumerHandle {
        let (stop_tx, stop_rx) = watch::channel(None);
        let shutdown_timeout = self.config.shutdown_timeout;
        let task = tokio::spawn(control_loop(self.fetcher, self.processor, self.config, stop_rx));

        ConsumerHandle {
            stop_tx,
            task,
            shutdown_timeout,
        }
    }
}

/// Handle to a running consumer. Dropping it stops the consumer in the background.
pub struct ConsumerHandle {
    stop_tx: watch::Sender<Option<Instant>>,
    task: JoinHandle<ShutdownReport>,
    shutdown_timeout: Duration,
}

impl ConsumerHandle {
    /// Stop polling and wait, bounded by the shutdown timeout, for in-flight tasks.
    pub async fn stop(self) -> ShutdownReport {
        tracing::info!("Stop consuming");
        let deadline = Instant::now() + self.shutdown_timeout;
        let _ = self.stop_tx.send(Some(deadline));

        match tokio::time::timeout_at(deadline + STOP_GRACE, self.task).await {
            Ok(Ok(report)) => report,
            Ok(Err(e)) => {
                tracing::error!("Consumer control task failed: {}", e);
                ShutdownReport::default()
            }
            Err(_) => {
                tracing::warn!("Stop processing took too long: control loop still inside fetch");
                ShutdownReport {
                    timed_out: true,
                    ..ShutdownReport::default()
                }
            }
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

async fn control_loop<F, P>(
    fetcher: Arc<F>,
    processor: Arc<P>,
    config: ConsumerConfig,
    mut stop_rx: watch::Receiver<Option<Instant>>,
) -> ShutdownReport
where
    F: Fetch,
    P: Process<F::Item>,
{
    let limiter = config.max_in_flight.map(|n| Arc::new(Semaphore::new(n)));
    let mut in_flight: JoinSet<()> = JoinSet::new();

    tracing::info!(
        fetch_delay_ms = config.fetch_delay.as_millis() as u64,
        max_in_flight = ?config.max_in_flight,
        "Consumer started"
    );

    let deadline = loop {
        let requested = *stop_rx.borrow();
        if let Some(deadline) = requested {
            break deadline;
        }
        if stop_rx.has_changed().is_err() {
            // Handle dropped without an explicit stop.
            break Instant::now() + config.shutdown_timeout;
        }
        reap(&mut in_flight);

        let permit: Option<OwnedSemaphorePermit> = match &limiter {
            Some(semaphore) => tokio::select! {
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => Some(permit),
                    Err(_) => break Instant::now() + config.shutdown_timeout,
                },
                changed = stop_rx.changed() => {
                    if changed.is_err() {
                        break Instant::now() + config.shutdown_timeout;
                    }
                    continue;
                }
            },
            None => None,
        };

        let started = Instant::now();
        let item = fetcher.fetch().await;
        let elapsed = started.elapsed();
        if elapsed > config.slow_fetch_threshold {
            tracing::warn!(elapsed_ms = elapsed.as_millis() as u64, "Slow fetch");
        }

        match item {
            Some(item) => {
                let processor = processor.clone();
                in_flight.spawn(async move {
                    let _permit = permit;
                    processor.process(item).await;
                });
            }
            None => {
                drop(permit);
                tokio::select! {
                    _ = tokio::time::sleep(config.fetch_delay) => {}
                    changed = stop_rx.changed() => {
                        if changed.is_err() {
                            break Instant::now() + config.shutdown_timeout;
                        }
                    }
                }
            }
        }
    };

    drain(in_flight, deadline).await
}

/// Collect finished tasks, logging any that panicked.
fn reap(in_flight: &mut JoinSet<()>) -> usize {
    let mut finished = 0;
    while let Some(result) = in_flight.try_join_next() {
        log_task_result(result);
        finished += 1;
    }
    finished
}

fn log_task_result(result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            tracing::error!("Dispatched task panicked: {}", e);
        }
    }
}

async fn drain(mut in_flight: JoinSet<()>, deadline: Instant) -> ShutdownReport {
    let mut report = ShutdownReport {
        drained: reap(&mut in_flight),
        ..ShutdownReport::default()
    };

    let pending = in_flight.len();
    if pending > 0 {
        tracing::info!(pending, "Waiting for in-flight tasks");
    }

    loop {
        match tokio::time::timeout_at(deadline, in_flight.join_next()).await {
            Ok(Some(result)) => {
                log_task_result(result);
                report.drained += 1;
            }
            Ok(None) => break,
            Err(_) => {
                report.abandoned = in_flight.len();
                report.timed_out = true;
                tracing::warn!(abandoned = report.abandoned, "Stop processing took too long");
                // Leave the stragglers running; dropping the set would abort them.
                in_flight.detach_all();
                break;
            }
        }
    }

    tracing::info!(drained = report.drained, "Consumer stopped");
    report
}
