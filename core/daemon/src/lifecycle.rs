//! Background threads that outlive any single request: the periodic
//! snapshot and the SIGINT/SIGTERM handler.

use signal_hook::consts::{SIGINT, SIGTERM};
use signal_hook::iterator::Signals;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::state::DaemonState;

pub fn spawn_snapshot_scheduler(state: Arc<DaemonState>) {
    let interval_secs = state.snapshot_interval_secs();
    if interval_secs == 0 {
        info!("Periodic snapshots disabled");
        return;
    }

    let spawned = thread::Builder::new()
        .name("playtimed-snapshots".to_string())
        .spawn(move || loop {
            thread::sleep(Duration::from_secs(interval_secs));
            if state.is_exiting() {
                break;
            }
            match state.run_snapshot() {
                Ok(report) if report.failed > 0 => warn!(
                    flushed = report.flushed,
                    failed = report.failed,
                    "Periodic snapshot left sessions unmerged"
                ),
                Ok(report) => tracing::debug!(flushed = report.flushed, "Periodic snapshot"),
                Err(err) => warn!(error = %err, "Periodic snapshot failed"),
            }
        });
    if let Err(err) = spawned {
        warn!(error = %err, "Failed to spawn snapshot scheduler");
    }
}

/// Installs the SIGINT/SIGTERM handler. On the first signal the tracker is
/// shut down, then the accept loop is woken so `main` can return.
pub fn spawn_signal_handler(state: Arc<DaemonState>, socket_path: PathBuf) -> Result<(), String> {
    let mut signals = Signals::new([SIGINT, SIGTERM])
        .map_err(|err| format!("Failed to register signal handlers: {}", err))?;

    thread::Builder::new()
        .name("playtimed-signals".to_string())
        .spawn(move || {
            if let Some(signal) = signals.forever().next() {
                info!(signal, "Shutdown signal received");
                shutdown(&state);
                wake_listener(&socket_path);
            }
        })
        .map_err(|err| format!("Failed to spawn signal handler: {}", err))?;
    Ok(())
}

/// Drains queued ends, flushes live sessions, and closes the ledger. Safe to
/// call more than once.
pub fn shutdown(state: &DaemonState) {
    match state.shutdown_once() {
        Some(Ok(report)) => info!(
            flushed = report.flushed,
            failed = report.failed,
            "Tracker shut down"
        ),
        Some(Err(err)) => error!(error = %err, "Tracker shutdown failed"),
        None => {}
    }
}

fn wake_listener(socket_path: &Path) {
    // The accept loop checks the exit flag after every connection.
    if let Err(err) = UnixStream::connect(socket_path) {
        warn!(error = %err, "Failed to wake listener; exiting directly");
        std::process::exit(0);
    }
}
