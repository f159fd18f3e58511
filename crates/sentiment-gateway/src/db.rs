//! SQLite schema and connection setup shared by the stores.
//!
//! Every store opens a fresh connection per operation, the same way several
//! gateway instances pointed at one database file would. Concurrency control
//! is left to SQLite: single-statement conditional updates and `IMMEDIATE`
//! transactions, with a busy timeout so writers queue instead of failing.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Connection;

/// How long a writer waits for the database lock before giving up.
pub const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS Plans (
    plan_id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT UNIQUE NOT NULL,
    monthly_quota INTEGER NOT NULL CHECK (monthly_quota >= 0)
);
CREATE TABLE IF NOT EXISTS Accounts (
    account_id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    email TEXT UNIQUE NOT NULL,
    password_hash TEXT NOT NULL,
    plan_id INTEGER NOT NULL,
    created_at_ms INTEGER NOT NULL,
    FOREIGN KEY (plan_id) REFERENCES Plans(plan_id)
);
CREATE TABLE IF NOT EXISTS Quotas (
    account_id INTEGER PRIMARY KEY,
    max_requests INTEGER NOT NULL CHECK (max_requests >= 0),
    requests_used INTEGER NOT NULL DEFAULT 0 CHECK (requests_used >= 0),
    last_reset_ms INTEGER NOT NULL,
    key_id TEXT UNIQUE NOT NULL,
    key_version INTEGER NOT NULL,
    key_digest BLOB UNIQUE NOT NULL,
    FOREIGN KEY (account_id) REFERENCES Accounts(account_id)
);
CREATE TABLE IF NOT EXISTS VideoFiles (
    key TEXT PRIMARY KEY,
    account_id INTEGER NOT NULL,
    analyzed BOOLEAN NOT NULL DEFAULT 0,
    created_at_ms INTEGER NOT NULL,
    FOREIGN KEY (account_id) REFERENCES Accounts(account_id)
);
CREATE INDEX IF NOT EXISTS idx_videofiles_account ON VideoFiles(account_id);
"#;

/// Open a read-write connection with the gateway's pragmas applied.
pub fn open_connection(db_path: &Path) -> Result<Connection, rusqlite::Error> {
    let conn = Connection::open(db_path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    Ok(conn)
}

/// Create tables if needed and switch the database to WAL mode.
pub fn init_schema(db_path: &Path) -> Result<(), rusqlite::Error> {
    let conn = open_connection(db_path)?;
    let mode: String =
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        log::warn!("SQLite refused WAL mode, running with journal_mode={mode}");
    }
    conn.execute_batch(SCHEMA)?;
    log::info!("Database schema ready at {}", db_path.display());
    Ok(())
}

/// Timestamps are stored as Unix milliseconds.
pub fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub fn from_millis(ms: i64, column: usize) -> Result<DateTime<Utc>, rusqlite::Error> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(column, ms))
}
