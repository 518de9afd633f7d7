//! Connection setup, schema, and the transactional retry discipline.
//!
//! Every mutating operation funnels through [`transact`]: the closure runs
//! inside an IMMEDIATE transaction, and when SQLite reports transient
//! contention the whole closure, reads included, is discarded and rerun
//! from scratch, so no operation ever acts on stale reads. Contention is
//! never surfaced to callers.

use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{Connection, ErrorCode, Transaction, TransactionBehavior};
use tracing::trace;

use crate::store::types::{StoreError, StoreResult};

/// Typed schema. All statements elsewhere are parameterized; no SQL is
/// built from strings at runtime.
pub(crate) const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS game (
    k TEXT PRIMARY KEY,
    v NOT NULL
);
CREATE TABLE IF NOT EXISTS players (
    id      INTEGER PRIMARY KEY,
    name    TEXT NOT NULL UNIQUE,
    cash    INTEGER NOT NULL DEFAULT 0,
    admin   INTEGER NOT NULL DEFAULT 0,
    pw_algo TEXT,
    pw_salt BLOB,
    pw_hash BLOB
);
CREATE TABLE IF NOT EXISTS stocks (
    idx   INTEGER PRIMARY KEY CHECK (idx BETWEEN 1 AND 6),
    name  TEXT NOT NULL UNIQUE,
    value INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS holdings (
    player INTEGER NOT NULL REFERENCES players(id) ON DELETE CASCADE,
    stock  INTEGER NOT NULL,
    shares INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (player, stock)
);
CREATE TABLE IF NOT EXISTS news (
    id   INTEGER PRIMARY KEY,
    line TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS history (
    id   INTEGER PRIMARY KEY,
    line TEXT NOT NULL
);
"#;

const INITIAL_BACKOFF: Duration = Duration::from_millis(1);
const MAX_BACKOFF: Duration = Duration::from_millis(100);

pub(crate) fn open(path: &str) -> StoreResult<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    Ok(conn)
}

pub(crate) fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::DatabaseBusy || e.code == ErrorCode::DatabaseLocked
    )
}

pub(crate) fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

fn is_transient(err: &StoreError) -> bool {
    matches!(err, StoreError::Db(e) if is_busy(e))
}

/// Run `op` inside an IMMEDIATE transaction, retrying the whole thing from
/// scratch on transient contention. Domain errors roll back and return
/// immediately; only busy/locked conditions loop, with capped backoff.
pub(crate) fn transact<T>(
    conn: &Mutex<Connection>,
    mut op: impl FnMut(&Transaction) -> StoreResult<T>,
) -> StoreResult<T> {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        match attempt(conn, &mut op) {
            Ok(v) => return Ok(v),
            Err(e) if is_transient(&e) => {
                metrics::counter!("bourse_busy_retries").increment(1);
                trace!(backoff_ms = backoff.as_millis() as u64, "store busy, retrying");
                std::thread::sleep(backoff);
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
            Err(e) => return Err(e),
        }
    }
}

fn attempt<T>(
    conn: &Mutex<Connection>,
    op: &mut impl FnMut(&Transaction) -> StoreResult<T>,
) -> StoreResult<T> {
    let mut guard = conn.lock();
    let tx = guard.transaction_with_behavior(TransactionBehavior::Immediate)?;
    let v = op(&tx)?;
    tx.commit()?;
    Ok(v)
}
