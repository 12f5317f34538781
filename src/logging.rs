use crate::config::LoggingConfig;
use crate::error::{CascadeError, Result};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const LOG_FILE_PREFIX: &str = "cascade";
const LOG_FILE_SUFFIX: &str = "log";
const LOG_ROTATION_INTERVAL: Duration = Duration::from_secs(86400);

fn env_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Installs the global subscriber: a console layer, plus a JSON (or plain)
/// daily rolling file when a directory is configured.
///
/// Must be called from within a tokio runtime when a directory is set; the
/// pruning task is spawned on it.
pub fn init(config: &LoggingConfig) -> Result<()> {
    let console = fmt::Layer::new()
        .with_target(true)
        .with_ansi(true)
        .with_filter(env_filter(&config.level));

    let Some(dir) = &config.directory else {
        tracing_subscriber::registry()
            .with(console)
            .try_init()
            .map_err(|e| CascadeError::config(format!("Failed to set tracing subscriber: {}", e)))?;
        return Ok(());
    };

    fs::create_dir_all(dir)?;
    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix(LOG_FILE_PREFIX)
        .filename_suffix(LOG_FILE_SUFFIX)
        .build(dir)
        .map_err(|e| CascadeError::config(format!("Failed to create file appender: {}", e)))?;

    let file_layer = if config.json {
        fmt::Layer::new()
            .json()
            .with_writer(file_appender)
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_ansi(false)
            .with_filter(env_filter(&config.level))
            .boxed()
    } else {
        fmt::Layer::new()
            .with_writer(file_appender)
            .with_target(true)
            .with_ansi(false)
            .with_filter(env_filter(&config.level))
            .boxed()
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file_layer)
        .try_init()
        .map_err(|e| CascadeError::config(format!("Failed to set tracing subscriber: {}", e)))?;

    let dir = dir.clone();
    let keep = config.max_files;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(LOG_ROTATION_INTERVAL);
        loop {
            interval.tick().await;
            cleanup_old_logs(&dir, keep);
        }
    });
    Ok(())
}

/// Removes all but the `keep` most recent log files in `log_dir`. Returns
/// how many were removed.
pub fn cleanup_old_logs(log_dir: &Path, keep: usize) -> usize {
    let Ok(entries) = fs::read_dir(log_dir) else {
        return 0;
    };
    let mut log_files: Vec<_> = entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .map(|name| name.starts_with(LOG_FILE_PREFIX) && name.ends_with(LOG_FILE_SUFFIX))
                .unwrap_or(false)
        })
        .collect();

    log_files.sort_by_key(|entry| {
        std::cmp::Reverse(
            entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH),
        )
    });

    log_files
        .iter()
        .skip(keep)
        .filter(|old| fs::remove_file(old.path()).is_ok())
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::SystemTime;

    #[test]
    fn keeps_newest_log_files_only() {
        let dir = tempfile::tempdir().unwrap();
        let base = SystemTime::now() - Duration::from_secs(86400 * 10);
        for day in 0..5u64 {
            let path = dir.path().join(format!("cascade.2026-01-0{}.log", day + 1));
            let file = File::create(&path).unwrap();
            file.set_modified(base + Duration::from_secs(86400 * day)).unwrap();
        }
        File::create(dir.path().join("unrelated.txt")).unwrap();

        assert_eq!(cleanup_old_logs(dir.path(), 2), 3);

        let mut left: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().into_string().unwrap())
            .collect();
        left.sort();
        assert_eq!(
            left,
            vec!["cascade.2026-01-04.log", "cascade.2026-01-05.log", "unrelated.txt"]
        );
    }

    #[test]
    fn missing_directory_removes_nothing() {
        assert_eq!(cleanup_old_logs(Path::new("/nonexistent/cascade-logs"), 1), 0);
    }
}
