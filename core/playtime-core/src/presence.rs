//! Presence-driven session control.
//!
//! Chat clients report presence as "this identity is now doing X" or "this
//! identity is doing nothing". This adapter turns those reports into tracker
//! start/end calls.

use serde::Serialize;
use tracing::debug;

use crate::error::Result;
use crate::tracker::SessionTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceOutcome {
    /// A new session was opened.
    Started,
    /// The live session was closed and one for another activity opened.
    Switched,
    /// Repeated presence for the activity already being counted.
    Unchanged,
    /// The live session was queued for ending.
    Ended,
    /// Nothing live and nothing reported.
    Idle,
}

pub fn on_presence(
    tracker: &SessionTracker,
    identity: &str,
    activity: Option<&str>,
) -> Result<PresenceOutcome> {
    let activity = activity.map(str::trim).filter(|value| !value.is_empty());
    let live = tracker.live_session(identity);

    match (live, activity) {
        (Some(_), None) => {
            tracker.request_end(identity)?;
            Ok(PresenceOutcome::Ended)
        }
        (None, None) => Ok(PresenceOutcome::Idle),
        (Some(live), Some(activity)) if live.activity == activity => {
            debug!(identity = %identity, activity = %activity, "Ignoring repeated presence");
            Ok(PresenceOutcome::Unchanged)
        }
        (Some(_), Some(activity)) => {
            tracker.start_session(identity, activity)?;
            Ok(PresenceOutcome::Switched)
        }
        (None, Some(activity)) => {
            tracker.start_session(identity, activity)?;
            Ok(PresenceOutcome::Started)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::ledger::Ledger;
    use crate::tracker::TrackerConfig;
    use std::sync::Arc;
    use std::time::Duration;

    fn tracker(temp_dir: &tempfile::TempDir) -> (Arc<ManualClock>, SessionTracker) {
        let ledger = Arc::new(Ledger::open(temp_dir.path().join("ledger.db")).expect("ledger"));
        let clock = Arc::new(ManualClock::new());
        let tracker = SessionTracker::with_clock(ledger, clock.clone(), TrackerConfig::default())
            .expect("tracker");
        (clock, tracker)
    }

    #[test]
    fn presence_walks_through_session_lifecycle() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let (clock, tracker) = tracker(&temp_dir);

        assert_eq!(
            on_presence(&tracker, "user-1", None).expect("idle"),
            PresenceOutcome::Idle
        );
        assert_eq!(
            on_presence(&tracker, "user-1", Some("chess")).expect("start"),
            PresenceOutcome::Started
        );
        clock.advance(Duration::from_secs(10));
        assert_eq!(
            on_presence(&tracker, "user-1", Some("chess")).expect("repeat"),
            PresenceOutcome::Unchanged
        );
        clock.advance(Duration::from_secs(10));
        assert_eq!(
            on_presence(&tracker, "user-1", Some("go")).expect("switch"),
            PresenceOutcome::Switched
        );
        clock.advance(Duration::from_secs(4));
        assert_eq!(
            on_presence(&tracker, "user-1", None).expect("end"),
            PresenceOutcome::Ended
        );
        tracker.drain();

        let history = tracker.get_total("user-1").expect("query");
        assert_eq!(
            history.nanos_for("chess"),
            Some(Duration::from_secs(20).as_nanos() as i64)
        );
        assert_eq!(
            history.nanos_for("go"),
            Some(Duration::from_secs(4).as_nanos() as i64)
        );
    }

    #[test]
    fn blank_activity_counts_as_nothing() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let (_clock, tracker) = tracker(&temp_dir);

        assert_eq!(
            on_presence(&tracker, "user-1", Some("   ")).expect("blank"),
            PresenceOutcome::Idle
        );
        assert!(tracker.live_session("user-1").is_none());
    }
}
