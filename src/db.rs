//! SQLite-backed meeting store.
//!
//! The database is owned by the scraper/archiver. This module opens it
//! read-only and joins each row with what the archive actually holds, so the
//! detector can compare recorded completeness against reality.

use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use rusqlite::{Connection, OpenFlags};
use thiserror::Error;

use crate::archive::ArchiveLayout;
use crate::types::{DocumentFlags, MeetingRecord};

/// Errors specific to database operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Database not found at {0}")]
    NotFound(PathBuf),

    #[error("Failed to create database directory: {0}")]
    CreateDir(std::io::Error),

    #[error("{0}")]
    Unavailable(String),

    #[error("Invalid meeting row {id}: {reason}")]
    InvalidRow { id: String, reason: String },
}

/// Read interface over meeting records.
///
/// Returns a complete snapshot per call or fails. Never a partial list.
pub trait MeetingStore {
    fn load_meetings(&self) -> Result<Vec<MeetingRecord>, StoreError>;
}

/// Stands in for a database that could not be opened, so the document axis
/// reports the failure while the video axis still runs.
#[derive(Debug, Clone)]
pub struct UnavailableStore {
    reason: String,
}

impl UnavailableStore {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl MeetingStore for UnavailableStore {
    fn load_meetings(&self) -> Result<Vec<MeetingRecord>, StoreError> {
        Err(StoreError::Unavailable(self.reason.clone()))
    }
}

/// A raw row from the `meetings` table.
#[derive(Debug, Clone)]
struct DbMeetingRow {
    id: String,
    title: String,
    meeting_date: String,
    status: String,
    has_agenda: bool,
    has_minutes: bool,
    has_transcript: bool,
    needs_ai_refinement: bool,
}

/// SQLite connection wrapper plus the archive it describes.
///
/// Not `Sync`; each run opens its own handle.
pub struct MeetingDb {
    conn: Connection,
    archive: ArchiveLayout,
}

impl MeetingDb {
    /// Borrow the underlying connection for ad-hoc queries.
    pub fn conn_ref(&self) -> &Connection {
        &self.conn
    }

    /// Open an existing database read-only.
    pub fn open_readonly(path: &Path, archive: ArchiveLayout) -> Result<Self, StoreError> {
        if !path.exists() {
            return Err(StoreError::NotFound(path.to_path_buf()));
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;

        Ok(Self { conn, archive })
    }

    /// Open (or create) a writable database and apply the schema.
    ///
    /// Used to bootstrap fixtures and local development databases.
    pub fn create_at(path: PathBuf, archive: ArchiveLayout) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(StoreError::CreateDir)?;
            }
        }

        let conn = Connection::open(&path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        // All statements use IF NOT EXISTS, so this is idempotent
        conn.execute_batch(include_str!("schema.sql"))?;

        Ok(Self { conn, archive })
    }

    fn query_rows(&self) -> Result<Vec<DbMeetingRow>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, title, meeting_date, status,
                    has_agenda, has_minutes, has_transcript, needs_ai_refinement
             FROM meetings
             ORDER BY meeting_date, id",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok(DbMeetingRow {
                id: row.get(0)?,
                title: row.get(1)?,
                meeting_date: row.get(2)?,
                status: row.get(3)?,
                has_agenda: row.get(4)?,
                has_minutes: row.get(5)?,
                has_transcript: row.get(6)?,
                needs_ai_refinement: row.get(7)?,
            })
        })?;

        let mut meetings = Vec::new();
        for row in rows {
            meetings.push(row?);
        }
        Ok(meetings)
    }
}

impl MeetingStore for MeetingDb {
    fn load_meetings(&self) -> Result<Vec<MeetingRecord>, StoreError> {
        let rows = self.query_rows()?;
        let mut records = Vec::with_capacity(rows.len());

        for row in rows {
            let meeting_date = NaiveDate::parse_from_str(&row.meeting_date, "%Y-%m-%d")
                .map_err(|e| StoreError::InvalidRow {
                    id: row.id.clone(),
                    reason: format!("meeting_date '{}': {}", row.meeting_date, e),
                })?;

            records.push(MeetingRecord {
                archived: self.archive.document_flags(meeting_date),
                recorded: DocumentFlags {
                    agenda: row.has_agenda,
                    minutes: row.has_minutes,
                    transcript: row.has_transcript,
                },
                id: row.id,
                title: row.title,
                meeting_date,
                status: row.status,
                needs_ai_refinement: row.needs_ai_refinement,
            });
        }

        Ok(records)
    }
}
