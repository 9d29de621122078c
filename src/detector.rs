//! Change detection.
//!
//! Pure comparison of current state against recorded state, on two
//! independent axes:
//! - documents: store completeness flags vs. artifacts on the archive
//! - video: remote index entries vs. local audio + transcript extraction
//!
//! Nothing here writes anywhere. A failure on one axis is reported next to
//! the other axis's result instead of aborting detection.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::Serialize;

use crate::archive::{ArchiveFolder, ArchiveLayout};
use crate::db::MeetingStore;
use crate::error::DetectionError;
use crate::types::{ChangeReport, ContentKind, MeetingChange, MeetingRecord};
use crate::video_index::VideoIndex;

/// Result of a full detection pass: the (possibly partial) report plus the
/// error for each axis that failed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionOutcome {
    pub report: ChangeReport,
    pub warnings: Vec<DetectionError>,
    /// Axes actually attempted: documents always, video only when an index
    /// is configured.
    pub axes_checked: usize,
}

impl DetectionOutcome {
    pub fn is_partial(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// Every attempted axis failed; the report carries no information.
    pub fn is_total_failure(&self) -> bool {
        !self.warnings.is_empty() && self.warnings.len() >= self.axes_checked
    }
}

/// Document kinds present on the archive but not yet marked complete.
///
/// Housekeeping fields (`status`, `needs_ai_refinement`) are never consulted.
fn new_document_kinds(record: &MeetingRecord) -> Vec<ContentKind> {
    ContentKind::DOCUMENTS
        .into_iter()
        .filter(|kind| record.archived.has(*kind) && !record.recorded.has(*kind))
        .collect()
}

fn document_changes(records: &[MeetingRecord]) -> Vec<MeetingChange> {
    let mut changes: Vec<MeetingChange> = records
        .iter()
        .filter_map(|record| {
            MeetingChange::new(
                record.id.clone(),
                record.title.clone(),
                record.meeting_date,
                new_document_kinds(record),
            )
        })
        .collect();

    changes.sort_by(|a, b| {
        a.meeting_date
            .cmp(&b.meeting_date)
            .then_with(|| a.meeting_id.cmp(&b.meeting_id))
    });
    changes
}

/// Store records grouped by meeting date, used to give archive folders the
/// same identity the document axis reports.
struct KnownMeetings<'r> {
    by_date: BTreeMap<NaiveDate, Vec<&'r MeetingRecord>>,
}

impl<'r> KnownMeetings<'r> {
    fn new(records: &'r [MeetingRecord]) -> Self {
        let mut by_date: BTreeMap<NaiveDate, Vec<&'r MeetingRecord>> = BTreeMap::new();
        for record in records {
            by_date.entry(record.meeting_date).or_default().push(record);
        }
        for same_day in by_date.values_mut() {
            same_day.sort_by(|a, b| a.id.cmp(&b.id));
        }
        Self { by_date }
    }

    /// `(id, label)` for a folder. A store record on the folder's date wins;
    /// the manifest (or folder name) is used only when the store has none.
    /// With several records on one day, the one matching the manifest id is
    /// preferred, otherwise the lowest id.
    fn resolve(&self, folder: &ArchiveFolder) -> (String, String) {
        match self.by_date.get(&folder.date) {
            Some(same_day) if !same_day.is_empty() => {
                let chosen = same_day
                    .iter()
                    .find(|r| r.id == folder.meeting_id)
                    .unwrap_or(&same_day[0]);
                if same_day.len() > 1 {
                    log::debug!(
                        "{} meetings on {}; attributing video to {}",
                        same_day.len(),
                        folder.date,
                        chosen.id
                    );
                }
                (chosen.id.clone(), chosen.title.clone())
            }
            _ => (folder.meeting_id.clone(), folder.label.clone()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChangeDetector {
    archive: ArchiveLayout,
}

impl ChangeDetector {
    pub fn new(archive: ArchiveLayout) -> Self {
        Self { archive }
    }

    /// Meetings whose agenda, minutes or transcript newly appeared, by date.
    pub fn detect_document_changes(
        &self,
        store: &dyn MeetingStore,
    ) -> Result<Vec<MeetingChange>, DetectionError> {
        let records = store
            .load_meetings()
            .map_err(|e| DetectionError::StoreUnavailable(e.to_string()))?;

        let changes = document_changes(&records);
        log::debug!("Document detection: {} meeting(s) changed", changes.len());
        Ok(changes)
    }

    /// Meetings whose video is indexed remotely but not fully extracted locally.
    ///
    /// `None` means no video client is configured: zero changes, not an error.
    /// Identity comes from the folder manifest; `detect_all_changes` resolves
    /// it against the store instead.
    pub async fn detect_video_changes(
        &self,
        video_index: Option<&dyn VideoIndex>,
    ) -> Result<Vec<MeetingChange>, DetectionError> {
        self.video_changes(video_index, &KnownMeetings::new(&[]))
            .await
    }

    async fn video_changes(
        &self,
        video_index: Option<&dyn VideoIndex>,
        known: &KnownMeetings<'_>,
    ) -> Result<Vec<MeetingChange>, DetectionError> {
        let Some(index_client) = video_index else {
            log::debug!("Video detection skipped: no video index configured");
            return Ok(Vec::new());
        };

        let folders = self
            .archive
            .meeting_folders()
            .map_err(|e| DetectionError::ArchiveUnreadable(e.to_string()))?;
        if folders.is_empty() {
            return Ok(Vec::new());
        }

        let index = index_client
            .fetch_index()
            .await
            .map_err(|e| DetectionError::VideoIndexUnavailable(e.to_string()))?;

        let mut changes = Vec::new();
        for folder in folders {
            let Some(video_id) = index.get(&folder.date) else {
                continue;
            };
            let artifacts = self.archive.video_artifacts(folder.date);
            if artifacts.is_complete() {
                continue;
            }

            let (meeting_id, label) = known.resolve(&folder);
            log::debug!(
                "Video {} for {} missing locally (audio: {}, transcript: {})",
                video_id,
                meeting_id,
                artifacts.audio,
                artifacts.transcript_json
            );
            changes.extend(MeetingChange::new(
                meeting_id,
                label,
                folder.date,
                [ContentKind::Video],
            ));
        }

        log::debug!(
            "Video detection ({}): {} meeting(s) changed",
            index_client.backend_name(),
            changes.len()
        );
        Ok(changes)
    }

    /// Run both axes and assemble one report.
    ///
    /// The store is read once; the same snapshot feeds the document axis and
    /// names the meetings found on the video axis, so a meeting that changed
    /// on both carries one id.
    pub async fn detect_all_changes(
        &self,
        store: &dyn MeetingStore,
        video_index: Option<&dyn VideoIndex>,
    ) -> DetectionOutcome {
        let mut warnings = Vec::new();

        let records = match store.load_meetings() {
            Ok(records) => records,
            Err(e) => {
                let e = DetectionError::StoreUnavailable(e.to_string());
                log::warn!("Document change detection failed: {}", e);
                warnings.push(e);
                Vec::new()
            }
        };
        let docs = document_changes(&records);
        log::debug!("Document detection: {} meeting(s) changed", docs.len());

        let known = KnownMeetings::new(&records);
        let video = match self.video_changes(video_index, &known).await {
            Ok(changes) => changes,
            Err(e) => {
                log::warn!("Video change detection failed: {}", e);
                warnings.push(e);
                Vec::new()
            }
        };

        DetectionOutcome {
            report: ChangeReport::new(docs, video),
            warnings,
            axes_checked: 1 + usize::from(video_index.is_some()),
        }
    }
}
