//! State shared by the listener, the connection threads, the snapshot
//! scheduler, and the signal handler.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;

use playtime_core::{SessionTracker, SnapshotReport, TrackerStats};

pub struct DaemonState {
    tracker: SessionTracker,
    started_at: Instant,
    started_at_wall: DateTime<Utc>,
    snapshot_interval_secs: u64,
    requests_served: AtomicU64,
    snapshots_run: AtomicU64,
    shutdown_lock: Mutex<()>,
    exiting: AtomicBool,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub pid: u32,
    pub version: &'static str,
    pub protocol_version: u32,
    pub started_at: String,
    pub uptime_secs: u64,
    pub requests_served: u64,
    pub snapshot_interval_secs: u64,
    pub snapshots_run: u64,
    pub tracker: TrackerStats,
}

impl DaemonState {
    pub fn new(tracker: SessionTracker, snapshot_interval_secs: u64) -> Self {
        Self {
            tracker,
            started_at: Instant::now(),
            started_at_wall: Utc::now(),
            snapshot_interval_secs,
            requests_served: AtomicU64::new(0),
            snapshots_run: AtomicU64::new(0),
            shutdown_lock: Mutex::new(()),
            exiting: AtomicBool::new(false),
        }
    }

    pub fn tracker(&self) -> &SessionTracker {
        &self.tracker
    }

    pub fn snapshot_interval_secs(&self) -> u64 {
        self.snapshot_interval_secs
    }

    pub fn record_request(&self) {
        self.requests_served.fetch_add(1, Ordering::Relaxed);
    }

    /// Runs a snapshot and counts it, whatever the outcome.
    pub fn run_snapshot(&self) -> playtime_core::Result<SnapshotReport> {
        let result = self.tracker.snapshot();
        self.snapshots_run.fetch_add(1, Ordering::Relaxed);
        result
    }

    /// Shuts the tracker down once. Concurrent callers wait for the first
    /// to finish; later calls return `None`. `is_exiting` turns true only
    /// after the flush is complete.
    pub fn shutdown_once(&self) -> Option<playtime_core::Result<SnapshotReport>> {
        let _guard = self
            .shutdown_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.is_exiting() {
            return None;
        }
        let result = self.tracker.shutdown();
        self.exiting.store(true, Ordering::SeqCst);
        Some(result)
    }

    pub fn is_exiting(&self) -> bool {
        self.exiting.load(Ordering::SeqCst)
    }

    pub fn health_snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            status: if self.is_exiting() { "stopped" } else { "ok" },
            pid: std::process::id(),
            version: env!("CARGO_PKG_VERSION"),
            protocol_version: playtime_daemon_protocol::PROTOCOL_VERSION,
            started_at: self.started_at_wall.to_rfc3339(),
            uptime_secs: self.started_at.elapsed().as_secs(),
            requests_served: self.requests_served.load(Ordering::Relaxed),
            snapshot_interval_secs: self.snapshot_interval_secs,
            snapshots_run: self.snapshots_run.load(Ordering::Relaxed),
            tracker: self.tracker.stats(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use playtime_core::Ledger;
    use std::sync::Arc;

    fn state_in(dir: &std::path::Path) -> DaemonState {
        let ledger = Arc::new(Ledger::open(dir.join("ledger.db")).expect("ledger"));
        let tracker = SessionTracker::new(ledger).expect("tracker");
        DaemonState::new(tracker, 300)
    }

    #[test]
    fn health_counts_requests_and_snapshots() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let state = state_in(temp_dir.path());

        state.record_request();
        state.record_request();
        state.tracker().start_session("user-1", "chess").expect("start");
        let report = state.run_snapshot().expect("snapshot");
        assert_eq!(report.flushed, 1);

        let health = state.health_snapshot();
        assert_eq!(health.status, "ok");
        assert_eq!(health.requests_served, 2);
        assert_eq!(health.snapshots_run, 1);
        assert_eq!(health.tracker.live_sessions, 1);
        assert_eq!(health.snapshot_interval_secs, 300);

        state.tracker().shutdown().expect("shutdown");
    }

    #[test]
    fn shutdown_runs_once() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let state = state_in(temp_dir.path());
        state.tracker().start_session("user-1", "chess").expect("start");

        assert!(!state.is_exiting());
        let report = state
            .shutdown_once()
            .expect("first shutdown")
            .expect("flush");
        assert_eq!(report.flushed, 1);
        assert!(state.is_exiting());
        assert!(state.shutdown_once().is_none());
        assert_eq!(state.health_snapshot().status, "stopped");
    }
}
