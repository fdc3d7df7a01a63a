//! Log setup: stdout by default, or a plain file when configured.

use std::env;
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

const DEBUG_ENV: &str = "PLAYTIME_DEBUG_LOG";

/// Installs the global subscriber. The returned guard must be held until
/// exit so buffered file output is flushed.
pub fn init(stdout: bool, log_file: Option<&Path>) -> Option<WorkerGuard> {
    let filter = env_filter();

    if stdout {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        return None;
    }

    let Some((dir, file_name)) = log_file.and_then(split_log_path) else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        tracing::warn!("Log file path is unusable; logging to stdout");
        return None;
    };

    if let Err(err) = fs_err::create_dir_all(dir) {
        tracing_subscriber::fmt().with_env_filter(filter).init();
        tracing::warn!(error = %err, "Failed to create log directory; logging to stdout");
        return None;
    }

    let appender = tracing_appender::rolling::never(dir, file_name);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(false)
        .with_writer(writer)
        .init();
    Some(guard)
}

fn env_filter() -> EnvFilter {
    let debug_enabled = env::var(DEBUG_ENV)
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    }
}

fn split_log_path(path: &Path) -> Option<(&Path, &std::ffi::OsStr)> {
    let file_name = path.file_name()?;
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    Some((dir, file_name))
}
