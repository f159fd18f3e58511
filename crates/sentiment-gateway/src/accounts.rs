//! Account registration and secret key resolution.
//!
//! An account, its quota row and its secret key are created in one SQLite
//! transaction. Only the key id and a digest of the secret are stored; the
//! token itself is returned to the caller once. Passwords are kept as salted
//! Argon2id hashes.

use std::fmt;
use std::path::{Path, PathBuf};

use argon2::Argon2;
use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use chrono::{DateTime, Utc};
use rusqlite::{ErrorCode, OptionalExtension, TransactionBehavior, params};
use secret_key::{KeyIssuer, StoredKey};
use thiserror::Error;

use crate::db::{from_millis, open_connection, to_millis};
use crate::ledger::AccountId;

// ============================================================================
// Data Structs
// ============================================================================

/// A pricing tier. `monthly_quota` becomes the account's `max_requests`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    pub name: String,
    pub monthly_quota: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub account_id: AccountId,
    pub name: String,
    pub email: String,
    pub plan: String,
    pub created_at: DateTime<Utc>,
}

/// Shortest password accepted at signup.
pub const MIN_PASSWORD_LEN: usize = 8;

/// Signup input.
#[derive(Clone)]
pub struct NewAccount {
    pub name: String,
    pub email: String,
    pub password: String,
    pub plan: String,
}

impl fmt::Debug for NewAccount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewAccount")
            .field("name", &self.name)
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .field("plan", &self.plan)
            .finish()
    }
}

/// Result of a successful signup. `secret_key` is not recoverable later.
#[derive(Debug, Clone)]
pub struct Registration {
    pub account_id: AccountId,
    pub secret_key: String,
    pub max_requests: i64,
}

#[derive(Debug, Error)]
pub enum RegistrationError {
    #[error("invalid signup data: {0}")]
    InvalidInput(&'static str),

    #[error("an account with this email already exists")]
    EmailTaken,

    #[error("unknown plan '{0}'")]
    UnknownPlan(String),

    /// The generated key id or digest already exists. Never overwritten.
    #[error("generated secret key collides with an existing key")]
    KeyCollision,

    #[error("failed to hash password: {0}")]
    PasswordHash(String),

    #[error("account storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

impl NewAccount {
    fn validate(&self) -> Result<(String, String), RegistrationError> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(RegistrationError::InvalidInput("name is required"));
        }

        let email = self.email.trim().to_ascii_lowercase();
        let valid_email = match email.split_once('@') {
            Some((local, domain)) => {
                !local.is_empty() && domain.contains('.') && !domain.starts_with('.')
            }
            None => false,
        };
        if !valid_email || email.contains(char::is_whitespace) {
            return Err(RegistrationError::InvalidInput("email is malformed"));
        }

        if self.password.chars().count() < MIN_PASSWORD_LEN {
            return Err(RegistrationError::InvalidInput(
                "password must be at least 8 characters",
            ));
        }

        Ok((name.to_string(), email))
    }
}

fn hash_password(password: &str) -> Result<String, RegistrationError> {
    let salt = SaltString::generate(&mut OsRng);
    Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| RegistrationError::PasswordHash(e.to_string()))
}

// ============================================================================
// Account Registry
// ============================================================================

pub struct AccountRegistry {
    db_path: PathBuf,
    issuer: KeyIssuer,
}

impl AccountRegistry {
    pub fn new<P: AsRef<Path>>(db_path: P, issuer: KeyIssuer) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
            issuer,
        }
    }

    /// Insert a plan or update its quota. Existing accounts keep the
    /// allowance they were provisioned with.
    pub fn upsert_plan(&self, plan: &Plan) -> Result<(), rusqlite::Error> {
        let conn = open_connection(&self.db_path)?;
        conn.execute(
            "INSERT INTO Plans (name, monthly_quota) VALUES (?1, ?2)
             ON CONFLICT(name) DO UPDATE SET monthly_quota = excluded.monthly_quota",
            params![plan.name, plan.monthly_quota],
        )?;
        Ok(())
    }

    /// Create an account together with its quota row and secret key.
    pub fn register(
        &self,
        new: &NewAccount,
        now: DateTime<Utc>,
    ) -> Result<Registration, RegistrationError> {
        let (name, email) = new.validate()?;
        // Hashed before the write lock is taken.
        let password_hash = hash_password(&new.password)?;

        let mut conn = open_connection(&self.db_path)?;
        // Dropping the transaction on any early return rolls everything back.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let (plan_id, monthly_quota): (i64, i64) = tx
            .query_row(
                "SELECT plan_id, monthly_quota FROM Plans WHERE name = ?1",
                [&new.plan],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?
            .ok_or_else(|| RegistrationError::UnknownPlan(new.plan.clone()))?;

        let taken: bool = tx.query_row(
            "SELECT EXISTS(SELECT 1 FROM Accounts WHERE email = ?1)",
            [&email],
            |row| row.get(0),
        )?;
        if taken {
            return Err(RegistrationError::EmailTaken);
        }

        tx.execute(
            "INSERT INTO Accounts (name, email, password_hash, plan_id, created_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![name, email, password_hash, plan_id, to_millis(now)],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                RegistrationError::EmailTaken
            } else {
                e.into()
            }
        })?;
        let account_id = tx.last_insert_rowid();

        let (issued, stored) = self.issuer.issue();
        tx.execute(
            "INSERT INTO Quotas (account_id, max_requests, requests_used, last_reset_ms, key_id, key_version, key_digest)
             VALUES (?1, ?2, 0, ?3, ?4, ?5, ?6)",
            params![
                account_id,
                monthly_quota,
                to_millis(now),
                stored.key_id.to_string(),
                stored.version,
                &stored.digest[..],
            ],
        )
        .map_err(|e| {
            if is_constraint_violation(&e) {
                log::error!("Secret key collision while provisioning account {account_id}");
                RegistrationError::KeyCollision
            } else {
                e.into()
            }
        })?;

        tx.commit()?;

        log::info!(
            "Registered account {account_id} on plan '{}' with {monthly_quota} requests per window",
            new.plan
        );

        Ok(Registration {
            account_id,
            secret_key: issued.token,
            max_requests: monthly_quota,
        })
    }

    /// Check an email and password pair. Unknown emails and wrong passwords
    /// both resolve to `None`.
    pub fn verify_password(
        &self,
        email: &str,
        password: &str,
    ) -> Result<Option<AccountId>, rusqlite::Error> {
        let email = email.trim().to_ascii_lowercase();
        let conn = open_connection(&self.db_path)?;
        let row: Option<(AccountId, String)> = conn
            .query_row(
                "SELECT account_id, password_hash FROM Accounts WHERE email = ?1",
                [&email],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((account_id, stored)) = row else {
            return Ok(None);
        };
        let parsed = match PasswordHash::new(&stored) {
            Ok(parsed) => parsed,
            Err(e) => {
                log::error!("Stored password hash for account {account_id} is corrupt: {e}");
                return Ok(None);
            }
        };
        let valid = Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok();
        Ok(valid.then_some(account_id))
    }

    /// Map a bearer token to its account.
    ///
    /// Malformed, unknown and non-matching tokens all resolve to `None`.
    pub fn resolve_key(&self, token: &str) -> Result<Option<AccountId>, rusqlite::Error> {
        let presented = match self.issuer.parse(token) {
            Ok(presented) => presented,
            Err(e) => {
                log::debug!("Rejected bearer token: {e}");
                return Ok(None);
            }
        };

        let conn = open_connection(&self.db_path)?;
        let row: Option<(AccountId, i16, Vec<u8>)> = conn
            .query_row(
                "SELECT account_id, key_version, key_digest FROM Quotas WHERE key_id = ?1",
                [presented.key_id().to_string()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let Some((account_id, version, digest)) = row else {
            return Ok(None);
        };
        let Some(stored) = StoredKey::from_parts(presented.key_id(), version, &digest) else {
            log::error!("Stored key digest for account {account_id} is corrupt");
            return Ok(None);
        };

        Ok(stored.matches(&presented).then_some(account_id))
    }

    pub fn account(&self, account_id: AccountId) -> Result<Option<Account>, rusqlite::Error> {
        let conn = open_connection(&self.db_path)?;
        conn.query_row(
            "SELECT a.account_id, a.name, a.email, p.name, a.created_at_ms
             FROM Accounts a JOIN Plans p ON p.plan_id = a.plan_id
             WHERE a.account_id = ?1",
            [account_id],
            |row| {
                Ok(Account {
                    account_id: row.get(0)?,
                    name: row.get(1)?,
                    email: row.get(2)?,
                    plan: row.get(3)?,
                    created_at: from_millis(row.get(4)?, 4)?,
                })
            },
        )
        .optional()
    }
}

// ============================================================================
// Tests
// ============================================================================
