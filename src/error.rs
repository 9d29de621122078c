//! Error types for update runs
//!
//! Errors are classified by how far they reach:
//! - Axis-level: one detection axis failed, the other still reports
//! - Meeting-level: one reprocessing call failed, the batch continues
//! - Run-level: the run cannot proceed (lock held, store and index both down, bad setup)

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Failure of one detection axis. Never aborts the other axis.
#[derive(Debug, Clone, Error, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "camelCase")]
pub enum DetectionError {
    #[error("Meeting store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Video index unavailable: {0}")]
    VideoIndexUnavailable(String),

    #[error("Archive unreadable: {0}")]
    ArchiveUnreadable(String),
}

/// Errors from the video index collaborator.
#[derive(Debug, Error)]
pub enum VideoIndexError {
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Video index returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed video index: {0}")]
    Malformed(String),
}

/// Errors from the reprocessing collaborator for a single meeting.
#[derive(Debug, Error)]
pub enum ReprocessError {
    #[error("No reprocess command configured")]
    CommandNotConfigured,

    #[error("Failed to start reprocess command: {0}")]
    SpawnFailed(String),

    #[error("Reprocess command failed with exit code {code}: {stderr}")]
    ScriptFailed { code: i32, stderr: String },

    #[error("Reprocess command timed out after {0} seconds")]
    Timeout(u64),
}

/// Errors from notification delivery. Always swallowed by the notifier.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Notification endpoint returned {status}: {body}")]
    Status { status: u16, body: String },
}

/// Errors while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error(
        "Config file not found at {0}. Create it with: {{ \"databasePath\": \"...\", \"archivePath\": \"...\" }}"
    )]
    NotFound(PathBuf),

    #[error("Failed to read config: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Run-level failure of a check or update run.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("Another update run is in progress (pid {pid}, started {acquired_at})")]
    AlreadyRunning {
        pid: u32,
        acquired_at: DateTime<Utc>,
    },

    #[error("Change detection failed on every axis: {}", join_errors(.0))]
    DetectionFailed(Vec<DetectionError>),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

fn join_errors(errors: &[DetectionError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

impl UpdateError {
    /// Lock contention is an expected outcome on a fixed schedule, not a crash.
    pub fn is_informational(&self) -> bool {
        matches!(self, UpdateError::AlreadyRunning { .. })
    }

    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            UpdateError::AlreadyRunning { .. } => 3,
            _ => 1,
        }
    }

    /// Get a user-friendly recovery suggestion
    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            UpdateError::AlreadyRunning { .. } => {
                "Wait for the running update to finish; stale locks are reclaimed automatically."
            }
            UpdateError::DetectionFailed(_) => {
                "Check that the meeting database and video index are reachable."
            }
            UpdateError::Lock(_) => "Check permissions on the state directory.",
            UpdateError::Configuration(_) => "Check ~/.councilwatch/config.json.",
        }
    }
}

impl From<ConfigError> for UpdateError {
    fn from(err: ConfigError) -> Self {
        UpdateError::Configuration(err.to_string())
    }
}
