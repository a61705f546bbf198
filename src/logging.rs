use std::fs;
use std::path::Path;
use std::time::Duration;
use tokio::time;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::LoggingConfig;
use crate::error::ElectionError;

const LOG_PREFIX: &str = "nexa-election";
const LOG_ROTATION_INTERVAL: Duration = Duration::from_secs(86400);

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Install the global subscriber: console output always, daily-rotated JSON
/// files when a directory is configured.
pub fn init(config: &LoggingConfig) -> Result<(), ElectionError> {
    let file_layer = match &config.directory {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            let appender = tracing_appender::rolling::RollingFileAppender::builder()
                .rotation(tracing_appender::rolling::Rotation::DAILY)
                .filename_prefix(LOG_PREFIX)
                .filename_suffix("log")
                .build(dir)
                .map_err(|e| ElectionError::Io(format!("Failed to create log appender: {}", e)))?;
            Some(
                fmt::Layer::new()
                    .json()
                    .with_writer(appender)
                    .with_file(true)
                    .with_line_number(true)
                    .with_thread_ids(true)
                    .with_target(true)
                    .with_ansi(false)
                    .with_filter(filter(&config.level)),
            )
        }
        None => None,
    };

    let subscriber = tracing_subscriber::registry()
        .with(
            fmt::Layer::new()
                .with_target(true)
                .with_thread_ids(true)
                .with_filter(filter(&config.level)),
        )
        .with(file_layer);

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| ElectionError::config(format!("Failed to set tracing subscriber: {}", e)))?;

    if let Some(dir) = config.directory.clone() {
        let max_files = config.max_files;
        cleanup_old_logs(&dir, max_files);
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let mut interval = time::interval(LOG_ROTATION_INTERVAL);
                loop {
                    interval.tick().await;
                    cleanup_old_logs(&dir, max_files);
                }
            });
        }
    }
    Ok(())
}

/// Keep the newest `max_files` log files in `log_dir`.
pub fn cleanup_old_logs(log_dir: &Path, max_files: usize) {
    if let Ok(entries) = fs::read_dir(log_dir) {
        let mut log_files: Vec<_> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .map(|name| name.starts_with(LOG_PREFIX) && name.ends_with(".log"))
                    .unwrap_or(false)
            })
            .collect();

        // newest first
        log_files.sort_by_key(|entry| {
            std::cmp::Reverse(
                entry
                    .metadata()
                    .ok()
                    .and_then(|m| m.modified().ok())
                    .unwrap_or(std::time::SystemTime::UNIX_EPOCH),
            )
        });

        for old_file in log_files.iter().skip(max_files) {
            let _ = fs::remove_file(old_file.path());
        }
    }
}
