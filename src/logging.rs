//! Logging setup for the agent binary

use anyhow::{Context, Result};
use directories::{BaseDirs, ProjectDirs};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{
    fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer, Registry,
};

const LOG_FILE_BASENAME: &str = "capture-agent.log";
const LOG_DIR_ENV: &str = "CAPTURE_AGENT_LOG_PATH";
const LOG_RETENTION_DAYS: u64 = 7;

/// Subsystem for macOS unified logging (os_log)
#[cfg(target_os = "macos")]
const OSLOG_SUBSYSTEM: &str = "dev.capture-agent.agent";

type BoxedLayer = Box<dyn Layer<Registry> + Send + Sync>;

/// Get the log directory path
pub fn get_log_dir() -> Result<PathBuf> {
    resolve_log_dir()
}

/// Install the global subscriber: stderr plus a daily-rolling file.
///
/// The returned guard flushes the file writer on drop and must be held for
/// the lifetime of the process.
pub fn init_logging() -> Result<WorkerGuard> {
    let log_dir = resolve_log_dir()?;
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory: {:?}", log_dir))?;

    prune_old_logs(
        &log_dir,
        Duration::from_secs(60 * 60 * 24 * LOG_RETENTION_DAYS),
    );

    let file_appender = tracing_appender::rolling::daily(&log_dir, LOG_FILE_BASENAME);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(output_layers(file_writer))
        .with(env_filter)
        .try_init()
        .context("A global tracing subscriber is already installed")?;

    Ok(guard)
}

/// Every sink log lines are written to
fn output_layers(file_writer: NonBlocking) -> Vec<BoxedLayer> {
    let mut layers = vec![
        // stdout carries the event feed, so human logs go to stderr
        fmt::layer().with_writer(std::io::stderr).boxed(),
        fmt::layer()
            .with_writer(file_writer)
            .with_ansi(false)
            .boxed(),
    ];

    // Also visible in Console.app under the agent's subsystem
    #[cfg(target_os = "macos")]
    layers.push(tracing_oslog::OsLogger::new(OSLOG_SUBSYSTEM, "default").boxed());

    layers
}

fn resolve_log_dir() -> Result<PathBuf> {
    if let Some(dir) = std::env::var_os(LOG_DIR_ENV) {
        return Ok(PathBuf::from(dir));
    }

    if cfg!(target_os = "macos") {
        let base = BaseDirs::new().context("Failed to determine home directory for log path")?;
        return Ok(base.home_dir().join("Library/Logs/capture-agent"));
    }

    let dirs = ProjectDirs::from("dev", "capture-agent", "agent")
        .context("Failed to determine project directories for log path")?;
    // state_dir is only defined on Linux
    let base = dirs.state_dir().unwrap_or_else(|| dirs.data_local_dir());
    Ok(base.join("logs"))
}

/// Delete rotated log files last modified before `max_age` ago
fn prune_old_logs(log_dir: &Path, max_age: Duration) {
    let Ok(entries) = std::fs::read_dir(log_dir) else {
        return;
    };

    let Some(cutoff) = SystemTime::now().checked_sub(max_age) else {
        return;
    };

    let stale = entries.flatten().filter(|entry| {
        let is_log = entry
            .file_name()
            .to_str()
            .map(|name| name.starts_with(LOG_FILE_BASENAME))
            .unwrap_or(false);
        let modified = entry.metadata().and_then(|m| m.modified()).ok();
        is_log
            && entry.path().is_file()
            && modified.map(|time| time < cutoff).unwrap_or(false)
    });

    for entry in stale {
        let _ = std::fs::remove_file(entry.path());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prune_only_touches_stale_logs() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join(format!("{}.2024-01-01", LOG_FILE_BASENAME));
        let other = dir.path().join("recording.h264");
        std::fs::write(&log, b"old").unwrap();
        std::fs::write(&other, b"keep").unwrap();

        // Nothing is older than an hour yet
        prune_old_logs(dir.path(), Duration::from_secs(3600));
        assert!(log.exists());

        std::thread::sleep(Duration::from_millis(20));
        prune_old_logs(dir.path(), Duration::ZERO);
        assert!(!log.exists());
        assert!(other.exists());
    }
}
