//! Error types for playtime-core operations.

use std::path::PathBuf;

/// All errors that can occur while tracking sessions or touching the ledger.
///
/// "Never played" is not an error; see [`crate::PlayHistory::Never`].
#[derive(Debug, thiserror::Error)]
pub enum PlaytimeError {
    // ─────────────────────────────────────────────────────────────────────
    // Store Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Failed to open ledger at {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Ledger operation failed: {context}: {source}")]
    Sqlite {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Ledger is closed")]
    Closed,

    // ─────────────────────────────────────────────────────────────────────
    // Value Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Corrupt playtime value for {identity}/{activity}: {details}")]
    CorruptValue {
        identity: String,
        activity: String,
        details: String,
    },

    #[error("Playtime total overflowed for {identity}/{activity}")]
    Overflow { identity: String, activity: String },

    // ─────────────────────────────────────────────────────────────────────
    // Tracker Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Session tracker is shutting down")]
    ShuttingDown,
}

impl PlaytimeError {
    pub(crate) fn sqlite(context: impl Into<String>, source: rusqlite::Error) -> Self {
        PlaytimeError::Sqlite {
            context: context.into(),
            source,
        }
    }
}

/// Convenience type alias for Results using PlaytimeError.
pub type Result<T> = std::result::Result<T, PlaytimeError>;

impl From<PlaytimeError> for String {
    fn from(err: PlaytimeError) -> String {
        err.to_string()
    }
}
