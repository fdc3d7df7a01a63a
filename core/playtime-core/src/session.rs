//! Session values handed between the tracker and the ledger.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::{Duration, Instant};

/// One in-progress activity for one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub identity: String,
    pub activity: String,
    /// Start of the stretch that has not been merged yet. Reset by snapshots.
    pub started_at: Instant,
    /// When the session was opened. Never reset.
    pub opened_at: Instant,
    pub opened_at_wall: DateTime<Utc>,
}

impl Session {
    pub fn open(
        identity: impl Into<String>,
        activity: impl Into<String>,
        now: Instant,
        wall: DateTime<Utc>,
    ) -> Self {
        Self {
            identity: identity.into(),
            activity: activity.into(),
            started_at: now,
            opened_at: now,
            opened_at_wall: wall,
        }
    }

    /// Unmerged time as of `now`. Zero if `now` precedes the start.
    pub fn elapsed(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.started_at)
    }

    pub fn close(self, ended_at: Instant) -> ClosedSession {
        let elapsed = self.elapsed(ended_at);
        ClosedSession {
            identity: self.identity,
            activity: self.activity,
            elapsed,
        }
    }
}

/// A session detached from the live set, ready to be merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClosedSession {
    pub identity: String,
    pub activity: String,
    pub elapsed: Duration,
}

/// Reporting view of a live session.
///
/// `elapsed_nanos` is time not yet merged into the ledger; add it to the
/// ledger total to get "played so far".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LiveSession {
    pub identity: String,
    pub activity: String,
    pub opened_at: DateTime<Utc>,
    pub elapsed_nanos: i64,
}

impl LiveSession {
    pub(crate) fn from_session(session: &Session, now: Instant) -> Self {
        Self {
            identity: session.identity.clone(),
            activity: session.activity.clone(),
            opened_at: session.opened_at_wall,
            elapsed_nanos: duration_to_nanos(session.elapsed(now)),
        }
    }
}

pub(crate) fn duration_to_nanos(duration: Duration) -> i64 {
    i64::try_from(duration.as_nanos()).unwrap_or(i64::MAX)
}
