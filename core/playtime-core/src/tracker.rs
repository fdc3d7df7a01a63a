//! Live-session tracking.
//!
//! The tracker owns the identity → session map behind a single mutex and
//! hands closed sessions to the ledger. Ending is asynchronous: callers only
//! enqueue, and a dispatcher thread fans the requests out to merge workers.
//!
//! Totals returned by [`SessionTracker::get_total`] come straight from the
//! ledger and never include time still sitting in a live session. Use
//! [`SessionTracker::live_sessions`] to add the unmerged part.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{PlaytimeError, Result};
use crate::ledger::{Ledger, PlayHistory};
use crate::session::{duration_to_nanos, ClosedSession, LiveSession, Session};

pub const DEFAULT_MAX_IN_FLIGHT_MERGES: usize = 8;

#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Upper bound on merge workers running at once.
    pub max_in_flight_merges: usize,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            max_in_flight_merges: DEFAULT_MAX_IN_FLIGHT_MERGES,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SnapshotReport {
    pub flushed: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackerStats {
    pub live_sessions: usize,
    pub pending_end_requests: usize,
    pub running_merges: usize,
    pub merges_committed: u64,
    pub merges_failed: u64,
}

enum EndRequest {
    /// End whatever session `identity` has, unless it was opened after the
    /// request was made.
    Identity {
        identity: String,
        requested_at: Instant,
    },
    /// A session already detached from the live set.
    Closed(ClosedSession),
}

#[derive(Debug, Default)]
struct WorkState {
    /// Queued plus running end requests.
    pending: usize,
    running: usize,
}

#[derive(Debug, Default)]
struct WorkCounter {
    state: Mutex<WorkState>,
    changed: Condvar,
}

impl WorkCounter {
    fn lock(&self) -> MutexGuard<'_, WorkState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn enqueued(&self) {
        self.lock().pending += 1;
    }

    fn dropped(&self) {
        let mut state = self.lock();
        state.pending = state.pending.saturating_sub(1);
        self.changed.notify_all();
    }

    fn acquire_slot(&self, max_running: usize) {
        let mut state = self.lock();
        while state.running >= max_running.max(1) {
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        state.running += 1;
    }

    fn finished(&self) {
        let mut state = self.lock();
        state.running = state.running.saturating_sub(1);
        state.pending = state.pending.saturating_sub(1);
        self.changed.notify_all();
    }

    fn wait_idle(&self) {
        let mut state = self.lock();
        while state.pending > 0 {
            state = self
                .changed
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    fn counts(&self) -> (usize, usize) {
        let state = self.lock();
        (state.pending, state.running)
    }
}

struct Shared {
    sessions: Mutex<HashMap<String, Session>>,
    ledger: Arc<Ledger>,
    clock: Arc<dyn Clock>,
    work: WorkCounter,
    max_in_flight: usize,
    merges_committed: AtomicU64,
    merges_failed: AtomicU64,
}

impl Shared {
    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn finish_end_request(&self, request: EndRequest) {
        let closed = match request {
            EndRequest::Closed(closed) => closed,
            EndRequest::Identity {
                identity,
                requested_at,
            } => {
                let mut sessions = self.lock_sessions();
                match sessions.get(&identity) {
                    None => {
                        debug!(identity = %identity, "No live session to end");
                        return;
                    }
                    Some(session) if session.opened_at > requested_at => {
                        debug!(
                            identity = %identity,
                            activity = %session.activity,
                            "Ignoring end request older than the live session"
                        );
                        return;
                    }
                    Some(_) => {}
                }
                let Some(session) = sessions.remove(&identity) else {
                    return;
                };
                session.close(self.clock.now())
            }
        };

        self.save(&closed);
    }

    fn save(&self, closed: &ClosedSession) {
        match self
            .ledger
            .merge(&closed.identity, &closed.activity, closed.elapsed)
        {
            Ok(total_nanos) => {
                self.merges_committed.fetch_add(1, Ordering::Relaxed);
                info!(
                    identity = %closed.identity,
                    activity = %closed.activity,
                    elapsed_ms = closed.elapsed.as_millis() as u64,
                    total_nanos,
                    "Session saved"
                );
            }
            Err(err) => {
                self.merges_failed.fetch_add(1, Ordering::Relaxed);
                warn!(
                    error = %err,
                    identity = %closed.identity,
                    activity = %closed.activity,
                    elapsed_ms = closed.elapsed.as_millis() as u64,
                    "Failed to save session; elapsed time dropped"
                );
            }
        }
    }
}

pub struct SessionTracker {
    shared: Arc<Shared>,
    end_tx: Mutex<Option<Sender<EndRequest>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl SessionTracker {
    pub fn new(ledger: Arc<Ledger>) -> Result<Self> {
        Self::with_clock(ledger, Arc::new(SystemClock), TrackerConfig::default())
    }

    pub fn with_clock(
        ledger: Arc<Ledger>,
        clock: Arc<dyn Clock>,
        config: TrackerConfig,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            sessions: Mutex::new(HashMap::new()),
            ledger,
            clock,
            work: WorkCounter::default(),
            max_in_flight: config.max_in_flight_merges.max(1),
            merges_committed: AtomicU64::new(0),
            merges_failed: AtomicU64::new(0),
        });

        let (end_tx, end_rx) = mpsc::channel();
        let dispatcher_shared = Arc::clone(&shared);
        let dispatcher = thread::Builder::new()
            .name("playtime-end-requests".to_string())
            .spawn(move || process_end_requests(dispatcher_shared, end_rx))
            .map_err(|source| PlaytimeError::Io {
                context: "Failed to spawn end-request dispatcher".to_string(),
                source,
            })?;

        Ok(Self {
            shared,
            end_tx: Mutex::new(Some(end_tx)),
            dispatcher: Mutex::new(Some(dispatcher)),
            shutting_down: AtomicBool::new(false),
        })
    }

    pub fn ledger(&self) -> &Arc<Ledger> {
        &self.shared.ledger
    }

    /// Opens a session for `identity`. A session the identity already has is
    /// closed through the end path first, so its time is credited to the old
    /// activity.
    pub fn start_session(&self, identity: &str, activity: &str) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            warn!(identity = %identity, activity = %activity, "Ignoring start during shutdown");
            return Err(PlaytimeError::ShuttingDown);
        }

        let now = self.shared.clock.now();
        let wall = self.shared.clock.wall();
        let previous = self.shared.lock_sessions().insert(
            identity.to_string(),
            Session::open(identity, activity, now, wall),
        );
        info!(identity = %identity, activity = %activity, "Starting to count");

        if let Some(previous) = previous {
            info!(
                identity = %identity,
                previous_activity = %previous.activity,
                "Closing replaced session"
            );
            if let Err(EndRequest::Closed(closed)) =
                self.enqueue(EndRequest::Closed(previous.close(now)))
            {
                // Queue already closed by shutdown; save it here instead.
                self.shared.save(&closed);
            }
        }

        Ok(())
    }

    /// Queues the end of `identity`'s session. Never touches the ledger or
    /// the session map.
    pub fn request_end(&self, identity: &str) -> Result<()> {
        let request = EndRequest::Identity {
            identity: identity.to_string(),
            requested_at: self.shared.clock.now(),
        };
        match self.enqueue(request) {
            Ok(()) => Ok(()),
            Err(_) => {
                debug!(identity = %identity, "End request after shutdown ignored");
                Err(PlaytimeError::ShuttingDown)
            }
        }
    }

    /// Merges every live session's unmerged time and restarts its stretch.
    ///
    /// Sessions stay live. A session whose merge fails keeps its old start,
    /// so the time is picked up by the next flush.
    pub fn snapshot(&self) -> Result<SnapshotReport> {
        let mut sessions = self.shared.lock_sessions();
        if sessions.is_empty() {
            debug!("Snapshot skipped; no live sessions");
            return Ok(SnapshotReport::default());
        }

        let now = self.shared.clock.now();
        let entries: Vec<ClosedSession> = sessions
            .values()
            .map(|session| ClosedSession {
                identity: session.identity.clone(),
                activity: session.activity.clone(),
                elapsed: session.elapsed(now),
            })
            .collect();

        let results = self.shared.ledger.merge_all(&entries)?;

        let mut report = SnapshotReport::default();
        for (entry, result) in entries.iter().zip(results) {
            match result {
                Ok(_) => {
                    if let Some(session) = sessions.get_mut(&entry.identity) {
                        session.started_at = now;
                    }
                    report.flushed += 1;
                }
                Err(err) => {
                    warn!(
                        error = %err,
                        identity = %entry.identity,
                        activity = %entry.activity,
                        "Snapshot failed for session"
                    );
                    report.failed += 1;
                }
            }
        }

        info!(flushed = report.flushed, failed = report.failed, "Snapshot done");
        Ok(report)
    }

    /// Ledger totals for `identity`, excluding live unmerged time.
    pub fn get_total(&self, identity: &str) -> Result<PlayHistory> {
        self.shared.ledger.query(identity)
    }

    pub fn live_session(&self, identity: &str) -> Option<LiveSession> {
        let now = self.shared.clock.now();
        self.shared
            .lock_sessions()
            .get(identity)
            .map(|session| LiveSession::from_session(session, now))
    }

    pub fn live_sessions(&self) -> Vec<LiveSession> {
        let now = self.shared.clock.now();
        let mut live: Vec<LiveSession> = self
            .shared
            .lock_sessions()
            .values()
            .map(|session| LiveSession::from_session(session, now))
            .collect();
        live.sort_by(|a, b| a.identity.cmp(&b.identity));
        live
    }

    /// Blocks until every queued and running end request has finished.
    pub fn drain(&self) {
        self.shared.work.wait_idle();
    }

    pub fn stats(&self) -> TrackerStats {
        let (pending, running) = self.shared.work.counts();
        TrackerStats {
            live_sessions: self.shared.lock_sessions().len(),
            pending_end_requests: pending,
            running_merges: running,
            merges_committed: self.shared.merges_committed.load(Ordering::Relaxed),
            merges_failed: self.shared.merges_failed.load(Ordering::Relaxed),
        }
    }

    /// Stops accepting signals, waits for outstanding end requests, flushes
    /// the remaining live sessions and closes the ledger.
    ///
    /// Only the first call does anything.
    pub fn shutdown(&self) -> Result<SnapshotReport> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(SnapshotReport::default());
        }
        info!("Session tracker shutting down");

        drop(
            self.end_tx
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .take(),
        );
        let dispatcher = self
            .dispatcher
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = dispatcher {
            if handle.join().is_err() {
                warn!("End-request dispatcher panicked");
            }
        }

        let report = self.snapshot();
        if report.is_ok() {
            self.shared.lock_sessions().clear();
        }
        let closed = self.shared.ledger.close();

        let report = report?;
        closed?;
        info!(flushed = report.flushed, "Session tracker stopped");
        Ok(report)
    }

    fn enqueue(&self, request: EndRequest) -> std::result::Result<(), EndRequest> {
        let sender = self
            .end_tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(tx) = sender.as_ref() else {
            return Err(request);
        };

        self.shared.work.enqueued();
        tx.send(request).map_err(|mpsc::SendError(request)| {
            self.shared.work.dropped();
            request
        })
    }
}

/// Dispatcher loop: one end request at a time, each merged on its own
/// worker thread, at most `max_in_flight` workers at once. Returns once the
/// queue is closed and every worker has finished.
fn process_end_requests(shared: Arc<Shared>, requests: Receiver<EndRequest>) {
    for request in requests {
        shared.work.acquire_slot(shared.max_in_flight);

        let worker = Arc::clone(&shared);
        let spawned = thread::Builder::new()
            .name("playtime-merge".to_string())
            .spawn(move || {
                worker.finish_end_request(request);
                worker.work.finished();
            });

        if let Err(err) = spawned {
            shared.merges_failed.fetch_add(1, Ordering::Relaxed);
            warn!(error = %err, "Failed to spawn merge worker; end request dropped");
            shared.work.finished();
        }
    }

    shared.work.wait_idle();
    debug!("End-request dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::time::Duration;

    struct Fixture {
        _temp_dir: tempfile::TempDir,
        clock: Arc<ManualClock>,
        tracker: SessionTracker,
    }

    fn fixture_with(config: TrackerConfig) -> Fixture {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let ledger = Arc::new(Ledger::open(temp_dir.path().join("ledger.db")).expect("ledger"));
        let clock = Arc::new(ManualClock::new());
        let tracker =
            SessionTracker::with_clock(ledger, clock.clone(), config).expect("tracker");
        Fixture {
            _temp_dir: temp_dir,
            clock,
            tracker,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(TrackerConfig::default())
    }

    fn nanos(value: Duration) -> i64 {
        value.as_nanos() as i64
    }

    fn played(tracker: &SessionTracker, identity: &str, activity: &str) -> Option<i64> {
        tracker
            .get_total(identity)
            .expect("query totals")
            .nanos_for(activity)
    }

    #[test]
    fn ended_session_is_credited() {
        let f = fixture();
        f.tracker.start_session("user-1", "chess").expect("start");
        f.clock.advance(Duration::from_secs(30));
        f.tracker.request_end("user-1").expect("end");
        f.tracker.drain();

        assert_eq!(
            played(&f.tracker, "user-1", "chess"),
            Some(nanos(Duration::from_secs(30)))
        );
        assert!(f.tracker.live_session("user-1").is_none());
    }

    #[test]
    fn separate_sessions_add_up() {
        let f = fixture();
        f.tracker.start_session("user-1", "chess").expect("start 1");
        f.clock.advance(Duration::from_secs(10));
        f.tracker.request_end("user-1").expect("end 1");
        f.tracker.drain();

        f.clock.advance(Duration::from_secs(100));
        f.tracker.start_session("user-1", "chess").expect("start 2");
        f.clock.advance(Duration::from_secs(25));
        f.tracker.request_end("user-1").expect("end 2");
        f.tracker.drain();

        assert_eq!(
            played(&f.tracker, "user-1", "chess"),
            Some(nanos(Duration::from_secs(35)))
        );
    }

    #[test]
    fn snapshot_neither_loses_nor_duplicates_time() {
        let f = fixture();
        f.tracker.start_session("user-1", "chess").expect("start");
        f.clock.advance(Duration::from_secs(40));

        let report = f.tracker.snapshot().expect("snapshot");
        assert_eq!(report, SnapshotReport { flushed: 1, failed: 0 });
        assert_eq!(
            played(&f.tracker, "user-1", "chess"),
            Some(nanos(Duration::from_secs(40)))
        );

        // A second flush without time passing adds nothing.
        f.tracker.snapshot().expect("snapshot again");

        f.clock.advance(Duration::from_secs(15));
        let live = f.tracker.live_session("user-1").expect("still live");
        assert_eq!(live.elapsed_nanos, nanos(Duration::from_secs(15)));

        f.tracker.request_end("user-1").expect("end");
        f.tracker.drain();
        assert_eq!(
            played(&f.tracker, "user-1", "chess"),
            Some(nanos(Duration::from_secs(55)))
        );
    }

    #[test]
    fn snapshot_with_no_sessions_is_empty() {
        let f = fixture();
        assert_eq!(f.tracker.snapshot().expect("snapshot"), SnapshotReport::default());
        assert!(f.tracker.get_total("user-1").expect("query").is_never());
    }

    #[test]
    fn never_started_identity_has_no_history() {
        let f = fixture();
        f.tracker.request_end("ghost").expect("end");
        f.tracker.drain();
        assert_eq!(
            f.tracker.get_total("ghost").expect("query"),
            PlayHistory::Never
        );
    }

    #[test]
    fn switching_activity_credits_the_old_one() {
        let f = fixture();
        f.tracker.start_session("user-1", "chess").expect("start chess");
        f.clock.advance(Duration::from_secs(20));
        f.tracker.start_session("user-1", "go").expect("start go");
        f.clock.advance(Duration::from_secs(5));
        f.tracker.request_end("user-1").expect("end");
        f.tracker.drain();

        assert_eq!(
            played(&f.tracker, "user-1", "chess"),
            Some(nanos(Duration::from_secs(20)))
        );
        assert_eq!(
            played(&f.tracker, "user-1", "go"),
            Some(nanos(Duration::from_secs(5)))
        );
    }

    #[test]
    fn stale_end_request_spares_newer_session() {
        let f = fixture();
        f.tracker.request_end("user-1").expect("early end");
        f.clock.advance(Duration::from_secs(1));
        f.tracker.start_session("user-1", "chess").expect("start");
        f.tracker.drain();

        let live = f.tracker.live_session("user-1").expect("session kept");
        assert_eq!(live.activity, "chess");
        assert!(f.tracker.get_total("user-1").expect("query").is_never());
    }

    #[test]
    fn snapshot_failure_keeps_unmerged_time() {
        let f = fixture();
        let conn = rusqlite::Connection::open(f.tracker.ledger().path()).expect("open raw");
        conn.execute_batch(
            "INSERT INTO identities (identity, created_at) VALUES ('broken', '2026-01-01T00:00:00Z');
             INSERT INTO playtime (identity, activity, played, updated_at)
                VALUES ('broken', 'chess', X'80', '2026-01-01T00:00:00Z');",
        )
        .expect("seed corrupt row");

        f.tracker.start_session("broken", "chess").expect("start broken");
        f.tracker.start_session("user-1", "chess").expect("start user-1");
        f.clock.advance(Duration::from_secs(12));

        let report = f.tracker.snapshot().expect("snapshot");
        assert_eq!(report, SnapshotReport { flushed: 1, failed: 1 });

        f.clock.advance(Duration::from_secs(3));
        let broken = f.tracker.live_session("broken").expect("broken live");
        let healthy = f.tracker.live_session("user-1").expect("user-1 live");
        assert_eq!(broken.elapsed_nanos, nanos(Duration::from_secs(15)));
        assert_eq!(healthy.elapsed_nanos, nanos(Duration::from_secs(3)));
        assert!(matches!(
            f.tracker.get_total("broken"),
            Err(PlaytimeError::CorruptValue { .. })
        ));
    }

    #[test]
    fn failed_end_merge_is_counted_and_dropped() {
        let f = fixture();
        let conn = rusqlite::Connection::open(f.tracker.ledger().path()).expect("open raw");
        conn.execute_batch(
            "INSERT INTO identities (identity, created_at) VALUES ('broken', '2026-01-01T00:00:00Z');
             INSERT INTO playtime (identity, activity, played, updated_at)
                VALUES ('broken', 'chess', X'80', '2026-01-01T00:00:00Z');",
        )
        .expect("seed corrupt row");

        f.tracker.start_session("broken", "chess").expect("start");
        f.clock.advance(Duration::from_secs(5));
        f.tracker.request_end("broken").expect("end");
        f.tracker.drain();

        let stats = f.tracker.stats();
        assert_eq!(stats.merges_failed, 1);
        assert_eq!(stats.merges_committed, 0);
        assert_eq!(stats.live_sessions, 0);
        assert_eq!(stats.pending_end_requests, 0);
    }

    #[test]
    fn concurrent_identities_do_not_interfere() {
        let f = fixture_with(TrackerConfig {
            max_in_flight_merges: 3,
        });
        let tracker = Arc::new(f.tracker);
        let identities: Vec<String> = (0..12).map(|i| format!("user-{i}")).collect();

        for identity in &identities {
            tracker.start_session(identity, "chess").expect("start");
        }
        f.clock.advance(Duration::from_secs(60));

        let handles: Vec<_> = identities
            .iter()
            .cloned()
            .map(|identity| {
                let tracker = Arc::clone(&tracker);
                thread::spawn(move || tracker.request_end(&identity).expect("end"))
            })
            .collect();
        for handle in handles {
            handle.join().expect("join");
        }
        tracker.drain();

        for identity in &identities {
            assert_eq!(
                played(&tracker, identity, "chess"),
                Some(nanos(Duration::from_secs(60))),
                "{identity}"
            );
        }
        assert_eq!(tracker.stats().merges_committed, 12);
    }

    #[test]
    fn shutdown_flushes_live_sessions_and_closes() {
        let f = fixture();
        f.tracker.start_session("user-1", "chess").expect("start");
        f.tracker.start_session("user-2", "go").expect("start");
        f.clock.advance(Duration::from_secs(45));

        let report = f.tracker.shutdown().expect("shutdown");
        assert_eq!(report.flushed, 2);
        assert!(f.tracker.live_sessions().is_empty());
        assert!(f.tracker.ledger().is_closed());

        assert!(matches!(
            f.tracker.start_session("user-1", "chess"),
            Err(PlaytimeError::ShuttingDown)
        ));
        assert!(matches!(
            f.tracker.request_end("user-1"),
            Err(PlaytimeError::ShuttingDown)
        ));
        assert_eq!(
            f.tracker.shutdown().expect("second shutdown"),
            SnapshotReport::default()
        );

        let reopened = Ledger::open(f.tracker.ledger().path()).expect("reopen");
        let history = reopened.query("user-1").expect("query");
        assert_eq!(
            history.nanos_for("chess"),
            Some(nanos(Duration::from_secs(45)))
        );
    }

    #[test]
    fn shutdown_waits_for_queued_end_requests() {
        let f = fixture_with(TrackerConfig {
            max_in_flight_merges: 1,
        });
        for i in 0..5 {
            f.tracker
                .start_session(&format!("user-{i}"), "chess")
                .expect("start");
        }
        f.clock.advance(Duration::from_secs(8));
        for i in 0..5 {
            f.tracker.request_end(&format!("user-{i}")).expect("end");
        }

        let report = f.tracker.shutdown().expect("shutdown");
        assert_eq!(report, SnapshotReport::default());

        let reopened = Ledger::open(f.tracker.ledger().path()).expect("reopen");
        for i in 0..5 {
            assert_eq!(
                reopened
                    .query(&format!("user-{i}"))
                    .expect("query")
                    .nanos_for("chess"),
                Some(nanos(Duration::from_secs(8)))
            );
        }
    }

    #[test]
    fn live_sessions_are_sorted_and_report_unmerged_time() {
        let f = fixture();
        f.tracker.start_session("b-user", "go").expect("start");
        f.clock.advance(Duration::from_secs(2));
        f.tracker.start_session("a-user", "chess").expect("start");
        f.clock.advance(Duration::from_secs(3));

        let live = f.tracker.live_sessions();
        assert_eq!(live.len(), 2);
        assert_eq!(live[0].identity, "a-user");
        assert_eq!(live[0].elapsed_nanos, nanos(Duration::from_secs(3)));
        assert_eq!(live[1].identity, "b-user");
        assert_eq!(live[1].elapsed_nanos, nanos(Duration::from_secs(5)));
    }
}
