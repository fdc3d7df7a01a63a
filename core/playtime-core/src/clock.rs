//! Time sources for the session tracker.
//!
//! Elapsed play time is always measured on a monotonic clock. `ManualClock`
//! lets tests and replays advance time explicitly.

use chrono::{DateTime, Utc};
use std::sync::Mutex;
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    /// Monotonic instant used for elapsed-time accounting.
    fn now(&self) -> Instant;

    /// Wall-clock time, only used for reporting.
    fn wall(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn wall(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    state: Mutex<(Instant, DateTime<Utc>)>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            state: Mutex::new((Instant::now(), Utc::now())),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut state = match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        state.0 += by;
        state.1 += chrono::Duration::from_std(by).unwrap_or(chrono::Duration::zero());
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        match self.state.lock() {
            Ok(state) => state.0,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }

    fn wall(&self) -> DateTime<Utc> {
        match self.state.lock() {
            Ok(state) => state.1,
            Err(poisoned) => poisoned.into_inner().1,
        }
    }
}
