//! Local meeting archive layout.
//!
//! One folder per meeting date under the archive root:
//!
//! ```text
//! <root>/2025-01-15/agenda.pdf
//! <root>/2025-01-15/minutes.pdf
//! <root>/2025-01-15/meeting.json        (optional: {"id": ..., "title": ...})
//! <root>/2025-01-15/video/audio.mp3
//! <root>/2025-01-15/video/transcript.json
//! ```

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use chrono::NaiveDate;
use regex::Regex;
use serde::Deserialize;
use walkdir::WalkDir;

use crate::types::{ContentKind, DocumentFlags};

/// Audio extensions accepted as a completed audio extraction.
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "m4a", "wav", "aac", "opus", "ogg"];

/// Label used when a folder has no manifest.
pub const DEFAULT_MEETING_LABEL: &str = "Meeting";

const MANIFEST_FILE: &str = "meeting.json";
const VIDEO_DIR: &str = "video";
const VIDEO_TRANSCRIPT_FILE: &str = "transcript.json";

fn date_folder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\d{4})-(\d{2})-(\d{2})$").expect("static regex"))
}

/// Parse a `YYYY-MM-DD` folder name.
pub fn parse_date_key(name: &str) -> Option<NaiveDate> {
    let caps = date_folder_re().captures(name)?;
    let year: i32 = caps[1].parse().ok()?;
    let month: u32 = caps[2].parse().ok()?;
    let day: u32 = caps[3].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Canonical date key shared by the archive and the video index.
pub fn date_key(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

#[derive(Debug, Deserialize)]
struct FolderManifest {
    id: Option<String>,
    title: Option<String>,
}

/// A dated meeting folder found on the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveFolder {
    pub date: NaiveDate,
    pub meeting_id: String,
    pub label: String,
}

/// Completion state of the local video artifacts for one meeting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VideoArtifacts {
    pub audio: bool,
    pub transcript_json: bool,
}

impl VideoArtifacts {
    pub fn is_complete(&self) -> bool {
        self.audio && self.transcript_json
    }
}

/// Read-only view over the archive root.
#[derive(Debug, Clone)]
pub struct ArchiveLayout {
    root: PathBuf,
}

impl ArchiveLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn meeting_dir(&self, date: NaiveDate) -> PathBuf {
        self.root.join(date_key(date))
    }

    /// Which document kinds exist for the meeting on `date`.
    pub fn document_flags(&self, date: NaiveDate) -> DocumentFlags {
        let dir = self.meeting_dir(date);
        let mut flags = DocumentFlags::default();

        let entries = match std::fs::read_dir(&dir) {
            Ok(e) => e,
            Err(_) => return flags,
        };

        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            // transcript.json belongs to the video pipeline, never a document
            if has_extension(&path, "json") {
                continue;
            }
            let Some(stem) = path.file_stem().map(|s| s.to_string_lossy().to_lowercase()) else {
                continue;
            };
            for kind in ContentKind::DOCUMENTS {
                if stem == kind.as_str() {
                    flags.set(kind, true);
                }
            }
        }

        flags
    }

    /// Audio and transcript state under `<date>/video/`.
    pub fn video_artifacts(&self, date: NaiveDate) -> VideoArtifacts {
        let video_dir = self.meeting_dir(date).join(VIDEO_DIR);

        let audio = std::fs::read_dir(&video_dir)
            .map(|entries| {
                entries.flatten().any(|entry| {
                    let path = entry.path();
                    path.is_file()
                        && path.file_stem().is_some_and(|s| s == "audio")
                        && AUDIO_EXTENSIONS.iter().any(|ext| has_extension(&path, ext))
                })
            })
            .unwrap_or(false);

        let transcript_json = video_dir.join(VIDEO_TRANSCRIPT_FILE).is_file();

        VideoArtifacts {
            audio,
            transcript_json,
        }
    }

    /// All dated meeting folders, sorted by date.
    ///
    /// A missing root means nothing has been archived yet and yields an empty list.
    pub fn meeting_folders(&self) -> Result<Vec<ArchiveFolder>, std::io::Error> {
        if !self.root.exists() {
            return Ok(Vec::new());
        }

        let mut folders = Vec::new();
        for entry in WalkDir::new(&self.root).min_depth(1).max_depth(1) {
            let entry = entry.map_err(std::io::Error::from)?;
            if !entry.file_type().is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            let Some(date) = parse_date_key(&name) else {
                continue;
            };

            let (meeting_id, label) = read_manifest(entry.path(), &name);
            folders.push(ArchiveFolder {
                date,
                meeting_id,
                label,
            });
        }

        folders.sort_by(|a, b| a.date.cmp(&b.date));
        Ok(folders)
    }
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .is_some_and(|e| e.to_string_lossy().eq_ignore_ascii_case(ext))
}

/// Meeting identity from `meeting.json`, falling back to the folder name.
fn read_manifest(dir: &Path, folder_name: &str) -> (String, String) {
    let fallback = || (folder_name.to_string(), DEFAULT_MEETING_LABEL.to_string());

    let content = match std::fs::read_to_string(dir.join(MANIFEST_FILE)) {
        Ok(c) => c,
        Err(_) => return fallback(),
    };

    match serde_json::from_str::<FolderManifest>(&content) {
        Ok(manifest) => (
            manifest
                .id
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| folder_name.to_string()),
            manifest
                .title
                .filter(|s| !s.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_MEETING_LABEL.to_string()),
        ),
        Err(e) => {
            log::warn!("Ignoring malformed manifest in {}: {}", dir.display(), e);
            fallback()
        }
    }
}
