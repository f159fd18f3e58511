//! Monthly request quota accounting.
//!
//! Each account owns one [`QuotaRecord`]: a ceiling, a counter and the start
//! of the current 30 day window. [`QuotaLedger::try_consume`] decides whether
//! one more request fits and records it in the same storage operation, so two
//! gateway instances can never both spend the last unit.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use uuid::Uuid;

pub type AccountId = i64;

/// Length of a quota window in 24h days. Calendar months are not used.
pub const WINDOW_DAYS: i64 = 30;

pub fn window_length() -> Duration {
    Duration::days(WINDOW_DAYS)
}

// ============================================================================
// Data Structs
// ============================================================================

/// Quota state for one account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaRecord {
    pub account_id: AccountId,
    pub max_requests: i64,
    pub requests_used: i64,
    pub last_reset_date: DateTime<Utc>,
    /// Public half of the account's secret key.
    pub key_id: Uuid,
}

impl QuotaRecord {
    /// Whether the window that started at `last_reset_date` is over at `now`.
    pub fn window_expired(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.last_reset_date) >= window_length()
    }

    /// Requests left in the current window, ignoring a pending rollover.
    pub fn remaining(&self) -> i64 {
        (self.max_requests - self.requests_used).max(0)
    }

    pub fn resets_at(&self) -> DateTime<Utc> {
        self.last_reset_date + window_length()
    }
}

/// Condition evaluated by the store atomically with a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Guard {
    /// The write only applies while the row still has this window start.
    pub window_start: DateTime<Utc>,
    /// The write only applies while `requests_used < max_requests`.
    pub below_cap: bool,
}

impl Guard {
    pub fn same_window(window_start: DateTime<Utc>) -> Self {
        Self {
            window_start,
            below_cap: false,
        }
    }

    pub fn below_cap(window_start: DateTime<Utc>) -> Self {
        Self {
            window_start,
            below_cap: true,
        }
    }
}

/// Mutation applied when a [`Guard`] holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    /// `requests_used += 1`, evaluated by the store against the current row.
    Increment,
    /// Open a new window at the given instant with one request already spent.
    Rollover(DateTime<Utc>),
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum LedgerError {
    /// The account exists but its quota row does not.
    #[error("no quota record for account {0}")]
    RecordNotFound(AccountId),

    /// A concurrent consume changed the row between read and write.
    #[error("concurrent quota update for account {0}")]
    StorageConflict(AccountId),

    #[error("quota storage unavailable: {0}")]
    StorageUnavailable(#[from] rusqlite::Error),
}

// ============================================================================
// Storage and Clock Traits
// ============================================================================

/// Persistence collaborator of the ledger.
pub trait QuotaStore: Send + Sync {
    fn get(&self, account_id: AccountId) -> Result<QuotaRecord, LedgerError>;

    /// Apply `change` if `guard` holds, as one storage operation.
    ///
    /// Returns the number of rows written: 1 when applied, 0 when the guard
    /// failed.
    fn update(
        &self,
        account_id: AccountId,
        guard: Guard,
        change: Change,
    ) -> Result<usize, LedgerError>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

// ============================================================================
// Quota Ledger
// ============================================================================

pub struct QuotaLedger {
    store: Arc<dyn QuotaStore>,
    clock: Arc<dyn Clock>,
}

impl QuotaLedger {
    pub fn new(store: Arc<dyn QuotaStore>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<dyn QuotaStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Spend one request for `account_id`.
    ///
    /// Returns `Ok(false)` only when the window's allowance is used up. A lost
    /// race against another consume is retried once; losing again is reported
    /// as exhausted.
    pub fn try_consume(&self, account_id: AccountId) -> Result<bool, LedgerError> {
        match self.consume_once(account_id) {
            Err(LedgerError::StorageConflict(_)) => {
                log::debug!("Quota update raced for account {account_id}, retrying");
                match self.consume_once(account_id) {
                    Err(LedgerError::StorageConflict(_)) => {
                        log::warn!(
                            "Quota update for account {account_id} lost twice, rejecting request"
                        );
                        Ok(false)
                    }
                    other => other,
                }
            }
            other => other,
        }
    }

    /// Read the current record without touching it.
    pub fn peek(&self, account_id: AccountId) -> Result<QuotaRecord, LedgerError> {
        self.store.get(account_id)
    }

    fn consume_once(&self, account_id: AccountId) -> Result<bool, LedgerError> {
        let record = self.store.get(account_id)?;
        let now = self.clock.now();

        if record.window_expired(now) {
            // The request that notices the expired window is always granted,
            // even when max_requests is 0.
            let applied = self.store.update(
                account_id,
                Guard::same_window(record.last_reset_date),
                Change::Rollover(now),
            )?;
            if applied == 0 {
                return Err(LedgerError::StorageConflict(account_id));
            }
            log::info!(
                "Quota window rolled over for account {account_id} ({} of {} used in previous window)",
                record.requests_used,
                record.max_requests
            );
            return Ok(true);
        }

        if record.requests_used >= record.max_requests {
            return Ok(false);
        }

        let applied = self.store.update(
            account_id,
            Guard::below_cap(record.last_reset_date),
            Change::Increment,
        )?;
        if applied == 0 {
            return Err(LedgerError::StorageConflict(account_id));
        }
        Ok(true)
    }
}

// ============================================================================
// Tests
// ============================================================================
