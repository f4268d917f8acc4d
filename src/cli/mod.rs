//! CLI commands for lanequeue using clap.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use crate::config::{load_settings, validate_settings, Settings};
use crate::consumer::QueueConsumer;
use crate::core::{ClaimedMessage, QueueStore};
use crate::store::SqliteQueueStore;

/// lanequeue - per-key FIFO message queue with lease-based claiming.
#[derive(Parser)]
#[command(name = "lanequeue")]
#[command(version = "0.1.0")]
#[command(about = "Per-key FIFO message queue backed by SQLite", long_about = None)]
pub struct Commands {
    /// Directory holding main.json and per-environment overrides
    #[arg(long, env = "LANEQUEUE_CONFIG_DIR", default_value = "config", global = true)]
    pub config_dir: PathBuf,

    /// Override the database file from settings
    #[arg(long, global = true)]
    pub database: Option<PathBuf>,

    /// Override the queue name from settings
    #[arg(long, global = true)]
    pub queue: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Append a message to a key's queue
    Enqueue {
        /// Queue key (e.g. chat id)
        key: String,

        /// JSON payload; plain text is stored as a JSON string
        payload: String,

        /// Correlation id; generated when omitted
        #[arg(long, default_value = "")]
        trace_id: String,
    },

    /// Consume messages until interrupted
    Consume,

    /// Show the pending messages and lease of a key
    Inspect {
        /// Queue key
        key: String,
    },

    /// Show queue statistics
    Stats,
}

impl Commands {
    /// Load layered settings and apply command-line overrides.
    pub fn settings(&self) -> Result<Settings> {
        let mut settings = load_settings(&self.config_dir)
            .with_context(|| format!("loading config from {}", self.config_dir.display()))?;
        if let Some(database) = &self.database {
            settings.queue.database_path = Some(database.clone());
        }
        if let Some(queue) = &self.queue {
            settings.queue.queue_name = queue.clone();
        }
        validate_settings(&settings).context("invalid command-line override")?;
        Ok(settings)
    }

    /// Run the command.
    pub async fn run(self, settings: Settings) -> Result<()> {
        let store = SqliteQueueStore::from_settings(&settings.queue)?;

        match self.command {
            Command::Enqueue {
                key,
                payload,
                trace_id,
            } => {
                let value = parse_payload(&payload);
                store.enqueue(&key, value, &trace_id).await?;
                println!("Enqueued message for key {}", key);
            }
            Command::Consume => consume(Arc::new(store), &settings).await?,
            Command::Inspect { key } => match store.document(&key).await? {
                Some(doc) => println!("{}", serde_json::to_string_pretty(&doc)?),
                None => println!("No pending messages for key {}", key),
            },
            Command::Stats => println!("{}", store.stats().await?),
        }

        Ok(())
    }
}

/// Accept JSON when it parses, otherwise keep the raw text.
fn parse_payload(raw: &str) -> serde_json::Value {
    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

async fn consume(store: Arc<dyn QueueStore>, settings: &Settings) -> Result<()> {
    let handler = |message: ClaimedMessage| async move {
        tracing::info!(created_at = message.created_at, "Processing message");
        println!("{}", message);
        Ok::<(), anyhow::Error>(())
    };

    let handle = QueueConsumer::from_store(store, handler, &settings.queue).run();
    tracing::info!(queue = %settings.queue.queue_name, "Consuming, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal");

    let report = handle.stop().await;
    if report.timed_out {
        tracing::warn!(abandoned = report.abandoned, "Exiting with tasks still running");
    }
    Ok(())
}
