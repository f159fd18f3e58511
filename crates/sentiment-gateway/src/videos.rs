//! Registry of uploaded video files awaiting analysis.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, params};
use uuid::Uuid;

use crate::db::{from_millis, open_connection, to_millis};
use crate::ledger::AccountId;

/// Upload formats the inference model accepts.
pub const ALLOWED_EXTENSIONS: &[&str] = &["mp4", "mov", "avi"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoFile {
    pub key: String,
    pub account_id: AccountId,
    pub analyzed: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum VideoError {
    #[error("unsupported file type '{0}'")]
    UnsupportedType(String),

    #[error("video storage error: {0}")]
    Storage(#[from] rusqlite::Error),
}

pub struct VideoStore {
    db_path: PathBuf,
}

impl VideoStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Self {
        Self {
            db_path: db_path.as_ref().to_path_buf(),
        }
    }

    /// Register a new upload owned by `account_id` and return its key.
    ///
    /// `file_type` is an extension, with or without the leading dot.
    pub fn register_upload(
        &self,
        account_id: AccountId,
        file_type: &str,
        now: DateTime<Utc>,
    ) -> Result<VideoFile, VideoError> {
        let ext = file_type.trim().trim_start_matches('.').to_ascii_lowercase();
        if !ALLOWED_EXTENSIONS.contains(&ext.as_str()) {
            return Err(VideoError::UnsupportedType(file_type.to_string()));
        }

        let file = VideoFile {
            key: format!("inference/{}.{ext}", Uuid::new_v4()),
            account_id,
            analyzed: false,
            created_at: now,
        };

        let conn = open_connection(&self.db_path)?;
        conn.execute(
            "INSERT INTO VideoFiles (key, account_id, analyzed, created_at_ms) VALUES (?1, ?2, 0, ?3)",
            params![file.key, file.account_id, to_millis(now)],
        )?;
        Ok(file)
    }

    pub fn get(&self, key: &str) -> Result<Option<VideoFile>, VideoError> {
        let conn = open_connection(&self.db_path)?;
        let file = conn
            .query_row(
                "SELECT key, account_id, analyzed, created_at_ms FROM VideoFiles WHERE key = ?1",
                [key],
                |row| {
                    Ok(VideoFile {
                        key: row.get(0)?,
                        account_id: row.get(1)?,
                        analyzed: row.get(2)?,
                        created_at: from_millis(row.get(3)?, 3)?,
                    })
                },
            )
            .optional()?;
        Ok(file)
    }

    /// Flag a file as analyzed. Returns `false` if it was already flagged.
    pub fn mark_analyzed(&self, key: &str) -> Result<bool, VideoError> {
        let conn = open_connection(&self.db_path)?;
        let changed = conn.execute(
            "UPDATE VideoFiles SET analyzed = 1 WHERE key = ?1 AND analyzed = 0",
            [key],
        )?;
        Ok(changed == 1)
    }
}
