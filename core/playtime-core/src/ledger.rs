//! SQLite-backed playtime ledger.
//!
//! This is the single-writer store behind the tracker. Each identity owns a
//! namespace row in `identities`; its per-activity totals live in `playtime`
//! as signed LEB128 nanosecond counts. Every write runs in a `BEGIN IMMEDIATE`
//! transaction, so SQLite serializes merges and readers only ever see
//! committed totals.

use chrono::Utc;
use rusqlite::types::ValueRef;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use crate::error::{PlaytimeError, Result};
use crate::session::{duration_to_nanos, ClosedSession};
use crate::varint::{decode_nanos, encode_nanos};

const BUSY_TIMEOUT_MS: i64 = 5000;

/// Everything the ledger knows about one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayHistory {
    /// The identity has never had a merge.
    Never,
    /// Activity → accumulated nanoseconds.
    Played(BTreeMap<String, i64>),
}

impl PlayHistory {
    pub fn nanos_for(&self, activity: &str) -> Option<i64> {
        match self {
            PlayHistory::Never => None,
            PlayHistory::Played(totals) => totals.get(activity).copied(),
        }
    }

    pub fn is_never(&self) -> bool {
        matches!(self, PlayHistory::Never)
    }
}

pub struct Ledger {
    path: PathBuf,
    closed: AtomicBool,
}

impl std::fmt::Debug for Ledger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("path", &self.path)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl Ledger {
    /// Opens (creating if needed) the ledger at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let ledger = Self {
            path: path.into(),
            closed: AtomicBool::new(false),
        };
        ledger.init_schema()?;
        Ok(ledger)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Adds `elapsed` to the stored total for `(identity, activity)` and
    /// returns the new total in nanoseconds.
    pub fn merge(&self, identity: &str, activity: &str, elapsed: Duration) -> Result<i64> {
        let elapsed_nanos = duration_to_nanos(elapsed);
        self.with_connection(|conn| {
            let tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|err| PlaytimeError::sqlite("Failed to start merge transaction", err))?;
            let total = merge_in(&tx, identity, activity, elapsed_nanos)?;
            tx.commit()
                .map_err(|err| PlaytimeError::sqlite("Failed to commit merge", err))?;
            Ok(total)
        })
    }

    /// Merges several closed stretches in one transaction.
    ///
    /// Each entry runs under its own savepoint, so a failing entry is rolled
    /// back alone and reported in its slot. The outer error is returned only
    /// when the transaction itself cannot be started or committed, in which
    /// case nothing was written.
    pub fn merge_all(&self, entries: &[ClosedSession]) -> Result<Vec<Result<i64>>> {
        self.with_connection(|conn| {
            let mut tx = conn
                .transaction_with_behavior(TransactionBehavior::Immediate)
                .map_err(|err| {
                    PlaytimeError::sqlite("Failed to start batch merge transaction", err)
                })?;

            let mut results = Vec::with_capacity(entries.len());
            for entry in entries {
                let savepoint = match tx.savepoint() {
                    Ok(savepoint) => savepoint,
                    Err(err) => {
                        results.push(Err(PlaytimeError::sqlite(
                            "Failed to create merge savepoint",
                            err,
                        )));
                        continue;
                    }
                };

                let outcome = merge_in(
                    &savepoint,
                    &entry.identity,
                    &entry.activity,
                    duration_to_nanos(entry.elapsed),
                )
                .and_then(|total| {
                    savepoint
                        .commit()
                        .map(|_| total)
                        .map_err(|err| PlaytimeError::sqlite("Failed to release savepoint", err))
                });
                results.push(outcome);
            }

            tx.commit()
                .map_err(|err| PlaytimeError::sqlite("Failed to commit batch merge", err))?;
            Ok(results)
        })
    }

    /// Reads every activity total for `identity`.
    pub fn query(&self, identity: &str) -> Result<PlayHistory> {
        self.with_connection(|conn| {
            let tx = conn
                .transaction()
                .map_err(|err| PlaytimeError::sqlite("Failed to start query transaction", err))?;

            let known: bool = tx
                .query_row(
                    "SELECT EXISTS(SELECT 1 FROM identities WHERE identity = ?1)",
                    params![identity],
                    |row| row.get(0),
                )
                .map_err(|err| PlaytimeError::sqlite("Failed to look up identity", err))?;
            if !known {
                return Ok(PlayHistory::Never);
            }

            let raw: Vec<(String, std::result::Result<Vec<u8>, String>)> = {
                let mut stmt = tx
                    .prepare(
                        "SELECT activity, played FROM playtime \
                         WHERE identity = ?1 ORDER BY activity ASC",
                    )
                    .map_err(|err| PlaytimeError::sqlite("Failed to prepare totals query", err))?;
                let rows = stmt
                    .query_map(params![identity], |row| {
                        Ok((row.get::<_, String>(0)?, stored_bytes(row.get_ref(1)?)))
                    })
                    .map_err(|err| PlaytimeError::sqlite("Failed to query totals", err))?;

                let mut raw = Vec::new();
                for row in rows {
                    raw.push(
                        row.map_err(|err| PlaytimeError::sqlite("Failed to read totals row", err))?,
                    );
                }
                raw
            };
            tx.finish()
                .map_err(|err| PlaytimeError::sqlite("Failed to finish query transaction", err))?;

            let mut totals = BTreeMap::new();
            for (activity, bytes) in raw {
                let nanos = bytes
                    .and_then(|bytes| decode_nanos(&bytes))
                    .map_err(|details| PlaytimeError::CorruptValue {
                        identity: identity.to_string(),
                        activity: activity.clone(),
                        details,
                    })?;
                totals.insert(activity, nanos);
            }
            Ok(PlayHistory::Played(totals))
        })
    }

    /// Checkpoints the WAL into the main database file and refuses further
    /// operations. Calling it again is a no-op.
    pub fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let conn = self.open_connection()?;
        conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
            .map_err(|err| PlaytimeError::sqlite("Failed to checkpoint ledger", err))?;
        tracing::debug!(path = %self.path.display(), "Ledger closed");
        Ok(())
    }

    fn init_schema(&self) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS identities (
                    identity TEXT PRIMARY KEY,
                    created_at TEXT NOT NULL
                 );
                 CREATE TABLE IF NOT EXISTS playtime (
                    identity TEXT NOT NULL REFERENCES identities(identity),
                    activity TEXT NOT NULL,
                    played BLOB NOT NULL,
                    updated_at TEXT NOT NULL,
                    PRIMARY KEY (identity, activity)
                 );
                 COMMIT;",
            )
            .map_err(|err| PlaytimeError::sqlite("Failed to initialize schema", err))
        })
    }

    fn with_connection<T>(&self, op: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        if self.is_closed() {
            return Err(PlaytimeError::Closed);
        }
        let mut conn = self.open_connection()?;
        op(&mut conn)
    }

    fn open_connection(&self) -> Result<Connection> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs_err::create_dir_all(parent).map_err(|source| PlaytimeError::Io {
                    context: "Failed to create ledger directory".to_string(),
                    source,
                })?;
            }
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn =
            Connection::open_with_flags(&self.path, flags).map_err(|source| PlaytimeError::Open {
                path: self.path.clone(),
                source,
            })?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|err| PlaytimeError::sqlite("Failed to enable WAL", err))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(|err| PlaytimeError::sqlite("Failed to set synchronous", err))?;
        conn.pragma_update(None, "busy_timeout", BUSY_TIMEOUT_MS)
            .map_err(|err| PlaytimeError::sqlite("Failed to set busy_timeout", err))?;

        Ok(conn)
    }
}

fn merge_in(conn: &Connection, identity: &str, activity: &str, elapsed_nanos: i64) -> Result<i64> {
    let now = Utc::now().to_rfc3339();

    conn.execute(
        "INSERT OR IGNORE INTO identities (identity, created_at) VALUES (?1, ?2)",
        params![identity, now],
    )
    .map_err(|err| PlaytimeError::sqlite("Failed to create identity namespace", err))?;

    let stored = conn
        .query_row(
            "SELECT played FROM playtime WHERE identity = ?1 AND activity = ?2",
            params![identity, activity],
            |row| Ok(stored_bytes(row.get_ref(0)?)),
        )
        .optional()
        .map_err(|err| PlaytimeError::sqlite("Failed to read playtime", err))?;

    let corrupt = |details: String| PlaytimeError::CorruptValue {
        identity: identity.to_string(),
        activity: activity.to_string(),
        details,
    };
    let current = match stored {
        Some(bytes) => bytes.and_then(|bytes| decode_nanos(&bytes)).map_err(corrupt)?,
        None => 0,
    };

    let total = current
        .checked_add(elapsed_nanos)
        .ok_or_else(|| PlaytimeError::Overflow {
            identity: identity.to_string(),
            activity: activity.to_string(),
        })?;

    conn.execute(
        "INSERT INTO playtime (identity, activity, played, updated_at) \
         VALUES (?1, ?2, ?3, ?4) \
         ON CONFLICT(identity, activity) DO UPDATE SET \
            played = excluded.played, \
            updated_at = excluded.updated_at",
        params![identity, activity, encode_nanos(total), now],
    )
    .map_err(|err| PlaytimeError::sqlite("Failed to write playtime", err))?;

    Ok(total)
}

fn stored_bytes(value: ValueRef<'_>) -> std::result::Result<Vec<u8>, String> {
    match value {
        ValueRef::Blob(bytes) => Ok(bytes.to_vec()),
        other => Err(format!("stored as {} instead of a blob", other.data_type())),
    }
}
