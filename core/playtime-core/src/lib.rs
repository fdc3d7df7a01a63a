//! # playtime-core
//!
//! Playtime accounting shared by the daemon and its tools: a durable ledger
//! of time played per identity and activity, and the tracker that turns
//! start/end signals into merges.
//!
//! ## Design Principles
//!
//! - **Synchronous**: std threads only. The tracker runs its own end-request
//!   dispatcher; callers never block on ledger I/O to end a session.
//! - **Single writer**: one process owns the ledger file. SQLite serializes
//!   write transactions.
//! - **No silent loss**: corrupt stored values are errors, never zero.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use playtime_core::{Ledger, SessionTracker};
//! use std::sync::Arc;
//!
//! let ledger = Arc::new(Ledger::open("ledger.db")?);
//! let tracker = SessionTracker::new(ledger)?;
//! tracker.start_session("user-1", "chess")?;
//! tracker.request_end("user-1")?;
//! tracker.shutdown()?;
//! ```

pub mod clock;
pub mod error;
pub mod ledger;
pub mod presence;
pub mod session;
pub mod tracker;
pub mod varint;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{PlaytimeError, Result};
pub use ledger::{Ledger, PlayHistory};
pub use presence::{on_presence, PresenceOutcome};
pub use session::{ClosedSession, LiveSession, Session};
pub use tracker::{
    SessionTracker, SnapshotReport, TrackerConfig, TrackerStats, DEFAULT_MAX_IN_FLIGHT_MERGES,
};
