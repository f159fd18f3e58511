//! SQLite implementation of [`QuotaStore`].
//!
//! Guards are compiled into the `WHERE` clause of a single `UPDATE`, so the
//! check and the write are one statement and SQLite serialises them.

use std::path::{Path, PathBuf};

use rusqlite::{OptionalExtension, Row, params_from_iter};
use uuid::Uuid;

use crate::db::{from_millis, open_connection, to_millis};
use crate::ledger::{AccountId, Change, Guard, LedgerError, QuotaRecord, QuotaStore};

pub struct SqliteQuotaStore {
    db_path: PathBuf,
}

impl SqliteQuotaStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }
}

fn record_from_row(row: &Row<'_>) -> Result<QuotaRecord, rusqlite::Error> {
    let key_id: String = row.get(4)?;
    Ok(QuotaRecord {
        account_id: row.get(0)?,
        max_requests: row.get(1)?,
        requests_used: row.get(2)?,
        last_reset_date: from_millis(row.get(3)?, 3)?,
        key_id: Uuid::parse_str(&key_id).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(4, rusqlite::types::Type::Text, Box::new(e))
        })?,
    })
}

/// Build the conditional update for a guard/change pair.
///
/// Parameters are positional: `?1` account, `?2` observed window start and,
/// for rollovers, `?3` the new window start.
fn conditional_update(
    account_id: AccountId,
    guard: Guard,
    change: Change,
) -> (String, Vec<i64>) {
    let mut params = vec![account_id, to_millis(guard.window_start)];

    let set = match change {
        Change::Increment => "requests_used = requests_used + 1",
        Change::Rollover(at) => {
            params.push(to_millis(at));
            "requests_used = 1, last_reset_ms = ?3"
        }
    };
    let cap = if guard.below_cap {
        " AND requests_used < max_requests"
    } else {
        ""
    };

    (
        format!("UPDATE Quotas SET {set} WHERE account_id = ?1 AND last_reset_ms = ?2{cap}"),
        params,
    )
}

impl QuotaStore for SqliteQuotaStore {
    fn get(&self, account_id: AccountId) -> Result<QuotaRecord, LedgerError> {
        let conn = open_connection(&self.db_path)?;
        conn.query_row(
            "SELECT account_id, max_requests, requests_used, last_reset_ms, key_id FROM Quotas WHERE account_id = ?1",
            [account_id],
            record_from_row,
        )
        .optional()?
        .ok_or(LedgerError::RecordNotFound(account_id))
    }

    fn update(
        &self,
        account_id: AccountId,
        guard: Guard,
        change: Change,
    ) -> Result<usize, LedgerError> {
        let (sql, params) = conditional_update(account_id, guard, change);
        let conn = open_connection(&self.db_path)?;
        Ok(conn.execute(&sql, params_from_iter(params))?)
    }
}
