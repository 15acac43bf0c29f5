//! Structured logging with file rotation.
//!
//! Initialises a `tracing` subscriber that writes JSON-formatted entries to
//! a daily-rotated file **and** a human-readable stream to stderr. The
//! returned guard must stay alive for the process lifetime so buffered
//! lines are flushed on shutdown.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

/// Rotated log files kept around before pruning.
const MAX_LOG_FILES: usize = 5;

/// Holds the flush guard — drop it only on shutdown.
pub struct LogGuard {
    _guard: WorkerGuard,
}

/// Initialise the global tracing subscriber.
///
/// Logs land in `MLX_FLEET_LOG_DIR` (default `./logs`). `RUST_LOG` controls
/// the filter and defaults to info with debug for the fleet crates.
pub fn init() -> anyhow::Result<LogGuard> {
    let dir = log_dir();
    std::fs::create_dir_all(&dir)?;

    let file_appender = tracing_appender::rolling::daily(&dir, "mlx-fleetd.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .json()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true)
        .with_writer(non_blocking);

    let stderr_layer = fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true)
        .with_ansi(true)
        .with_writer(std::io::stderr);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,mlx_fleetd=debug,mlx_fleet=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .init();

    prune_old_logs(&dir, MAX_LOG_FILES);

    tracing::info!(log_dir = %dir.display(), "logging initialised");
    Ok(LogGuard { _guard: guard })
}

fn log_dir() -> PathBuf {
    std::env::var("MLX_FLEET_LOG_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("logs"))
}

/// Best-effort cleanup of rotated log files beyond `max_files`.
///
/// Rotated files share the `mlx-fleetd.log` prefix; everything else in the
/// directory is left alone. Files that disappear mid-scan are ignored.
pub fn prune_old_logs(dir: &Path, max_files: usize) {
    let mut rotated: Vec<(SystemTime, PathBuf)> = match std::fs::read_dir(dir) {
        Ok(entries) => entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with("mlx-fleetd.log"))
            })
            .filter_map(|path| {
                let modified = std::fs::metadata(&path).and_then(|m| m.modified()).ok()?;
                Some((modified, path))
            })
            .collect(),
        Err(_) => return,
    };

    if rotated.len() <= max_files {
        return;
    }
    let excess = rotated.len() - max_files;

    // Oldest first; everything before the keep boundary goes.
    rotated.sort_by_key(|(modified, _)| *modified);
    let mut pruned = 0usize;
    for (_, path) in rotated.into_iter().take(excess) {
        match std::fs::remove_file(&path) {
            Ok(()) => pruned += 1,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "failed to prune old log")
            }
        }
    }
    if pruned > 0 {
        tracing::debug!(pruned, max_files, "removed rotated log files");
    }
}
