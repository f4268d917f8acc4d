//! Logging setup for lanequeue using tracing.

use anyhow::Result;
use std::path::PathBuf;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::config::LoggingSettings;

/// Initialize logging with file appender and console output.
///
/// The returned guard flushes the file writer when dropped; keep it alive for
/// the lifetime of the process.
pub fn init(settings: &LoggingSettings) -> Result<(WorkerGuard, PathBuf)> {
    let log_dir = get_log_dir(settings)?;
    std::fs::create_dir_all(&log_dir)?;

    // Create file appender with rotation
    let file_appender = tracing_appender::rolling::daily(&log_dir, "lanequeue.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&settings.filter));

    let console_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(true)
        .with_target(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer(non_blocking, settings.json))
        .with(console_layer)
        .try_init()?;

    tracing::info!("lanequeue logging initialized");
    tracing::info!("Log directory: {}", log_dir.display());

    Ok((guard, log_dir))
}

/// File output layer, plain text or one JSON object per line.
fn file_layer<S, W>(writer: W, json: bool) -> Box<dyn Layer<S> + Send + Sync>
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a> + 'static,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    let layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    if json {
        layer.json().with_current_span(true).boxed()
    } else {
        layer.boxed()
    }
}

/// Get the log directory path.
fn get_log_dir(settings: &LoggingSettings) -> Result<PathBuf> {
    if let Some(dir) = &settings.directory {
        return Ok(dir.clone());
    }
    Ok(crate::config::get_home_dir()?.join("logs"))
}

/// Initialize logging for tests (console only, no file).
#[cfg(test)]
pub fn init_test() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_dir_override() {
        let settings = LoggingSettings {
            directory: Some(PathBuf::from("/tmp/lanequeue-logs")),
            ..LoggingSettings::default()
        };
        assert_eq!(get_log_dir(&settings).unwrap(), PathBuf::from("/tmp/lanequeue-logs"));
    }

    #[test]
    fn test_json_file_layer_writes_json_lines() {
        let dir = tempfile::TempDir::new().unwrap();
        let appender = tracing_appender::rolling::never(dir.path(), "test.log");
        let subscriber = tracing_subscriber::registry().with(file_layer(appender, true));

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("message", key = "42");
            let _enter = span.enter();
            tracing::info!("hello json");
        });

        let contents = std::fs::read_to_string(dir.path().join("test.log")).unwrap();
        let line = contents.lines().next().unwrap();
        let value: serde_json::Value = serde_json::from_str(line).unwrap();
        assert_eq!(value["fields"]["message"], "hello json");
        assert_eq!(value["span"]["key"], "42");
    }

    #[test]
    fn test_plain_file_layer_writes_text() {
        let dir = tempfile::TempDir::new().unwrap();
        let appender = tracing_appender::rolling::never(dir.path(), "test.log");
        let subscriber = tracing_subscriber::registry().with(file_layer(appender, false));

        tracing::subscriber::with_default(subscriber, || tracing::info!("hello text"));

        let contents = std::fs::read_to_string(dir.path().join("test.log")).unwrap();
        assert!(contents.contains("hello text"));
        assert!(serde_json::from_str::<serde_json::Value>(contents.trim()).is_err());
    }

    #[test]
    fn test_init_test_is_repeatable() {
        init_test();
        init_test();
        tracing::debug!("test logging ready");
    }
}
