//! Data model for change detection runs.
//!
//! A `ChangeReport` is built fresh on every run, consumed by the reprocessing
//! pass and the notifier, then dropped. Nothing here is persisted.

use std::collections::{BTreeSet, HashMap};
use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Unit of "what changed" for a meeting.
///
/// Declaration order is the canonical display order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Agenda,
    Minutes,
    Transcript,
    Video,
}

impl ContentKind {
    /// Kinds eligible for document detection.
    pub const DOCUMENTS: [ContentKind; 3] = [
        ContentKind::Agenda,
        ContentKind::Minutes,
        ContentKind::Transcript,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Agenda => "agenda",
            ContentKind::Minutes => "minutes",
            ContentKind::Transcript => "transcript",
            ContentKind::Video => "video",
        }
    }
}

impl fmt::Display for ContentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Presence of each document kind, either as recorded in the store or as
/// found on the archive.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentFlags {
    pub agenda: bool,
    pub minutes: bool,
    pub transcript: bool,
}

impl DocumentFlags {
    pub fn has(&self, kind: ContentKind) -> bool {
        match kind {
            ContentKind::Agenda => self.agenda,
            ContentKind::Minutes => self.minutes,
            ContentKind::Transcript => self.transcript,
            ContentKind::Video => false,
        }
    }

    pub fn set(&mut self, kind: ContentKind, present: bool) {
        match kind {
            ContentKind::Agenda => self.agenda = present,
            ContentKind::Minutes => self.minutes = present,
            ContentKind::Transcript => self.transcript = present,
            ContentKind::Video => {}
        }
    }
}

/// One meeting as returned by the store: recorded completeness flags, the
/// artifacts actually present on the archive, and housekeeping fields that
/// never count as new content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeetingRecord {
    pub id: String,
    pub title: String,
    pub meeting_date: NaiveDate,
    pub recorded: DocumentFlags,
    pub archived: DocumentFlags,
    pub status: String,
    pub needs_ai_refinement: bool,
}

/// One meeting's detected delta. `content_kinds_changed` is never empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeetingChange {
    pub meeting_id: String,
    pub meeting_label: String,
    pub meeting_date: NaiveDate,
    content_kinds_changed: BTreeSet<ContentKind>,
}

impl MeetingChange {
    /// Build a change, or `None` when nothing changed.
    pub fn new(
        meeting_id: impl Into<String>,
        meeting_label: impl Into<String>,
        meeting_date: NaiveDate,
        kinds: impl IntoIterator<Item = ContentKind>,
    ) -> Option<Self> {
        let content_kinds_changed: BTreeSet<ContentKind> = kinds.into_iter().collect();
        if content_kinds_changed.is_empty() {
            return None;
        }
        Some(Self {
            meeting_id: meeting_id.into(),
            meeting_label: meeting_label.into(),
            meeting_date,
            content_kinds_changed,
        })
    }

    pub fn content_kinds_changed(&self) -> &BTreeSet<ContentKind> {
        &self.content_kinds_changed
    }

    /// Display form used in summaries: `Jan 15 Council (minutes, video)`.
    pub fn summary_line(&self) -> String {
        let kinds = self
            .content_kinds_changed
            .iter()
            .map(|k| k.as_str())
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "{} {} ({})",
            self.meeting_date.format("%b %-d"),
            self.meeting_label,
            kinds
        )
    }
}

/// Aggregate result of one detection run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeReport {
    pub meetings_with_new_docs: Vec<MeetingChange>,
    pub meetings_with_new_video: Vec<MeetingChange>,
}

impl ChangeReport {
    pub fn new(docs: Vec<MeetingChange>, video: Vec<MeetingChange>) -> Self {
        Self {
            meetings_with_new_docs: docs,
            meetings_with_new_video: video,
        }
    }

    /// Entries across both sequences. A meeting on both axes counts twice.
    pub fn total_changes(&self) -> usize {
        self.meetings_with_new_docs.len() + self.meetings_with_new_video.len()
    }

    pub fn is_empty(&self) -> bool {
        self.total_changes() == 0
    }

    /// One entry per meeting with the union of its changed kinds.
    ///
    /// Document changes keep their order; meetings that only changed on the
    /// video axis follow in video order.
    pub fn merged_changes(&self) -> Vec<MeetingChange> {
        let mut merged: Vec<MeetingChange> = Vec::new();
        let mut positions: HashMap<String, usize> = HashMap::new();

        for change in self
            .meetings_with_new_docs
            .iter()
            .chain(self.meetings_with_new_video.iter())
        {
            match positions.get(&change.meeting_id) {
                Some(&idx) => {
                    merged[idx]
                        .content_kinds_changed
                        .extend(change.content_kinds_changed.iter().copied());
                }
                None => {
                    positions.insert(change.meeting_id.clone(), merged.len());
                    merged.push(change.clone());
                }
            }
        }

        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_meeting_change_requires_a_kind() {
        assert!(MeetingChange::new("m1", "Council", date(2025, 1, 15), []).is_none());
        assert!(
            MeetingChange::new("m1", "Council", date(2025, 1, 15), [ContentKind::Minutes])
                .is_some()
        );
    }

    #[test]
    fn test_summary_line_format() {
        let change =
            MeetingChange::new("m1", "Council", date(2025, 1, 15), [ContentKind::Minutes])
                .unwrap();
        assert_eq!(change.summary_line(), "Jan 15 Council (minutes)");

        let change = MeetingChange::new(
            "m2",
            "Council",
            date(2025, 2, 3),
            [ContentKind::Video, ContentKind::Agenda],
        )
        .unwrap();
        assert_eq!(change.summary_line(), "Feb 3 Council (agenda, video)");
    }

    #[test]
    fn test_total_changes_counts_both_axes() {
        let d = date(2025, 1, 15);
        let docs = MeetingChange::new("m1", "Council", d, [ContentKind::Minutes]).unwrap();
        let video = MeetingChange::new("m1", "Council", d, [ContentKind::Video]).unwrap();
        let report = ChangeReport::new(vec![docs], vec![video]);

        assert_eq!(report.total_changes(), 2);
        assert!(!report.is_empty());
        assert!(ChangeReport::default().is_empty());
    }

    #[test]
    fn test_merged_changes_unions_kinds_per_meeting() {
        let jan = date(2025, 1, 15);
        let feb = date(2025, 2, 3);
        let report = ChangeReport::new(
            vec![MeetingChange::new("m1", "Council", jan, [ContentKind::Minutes]).unwrap()],
            vec![
                MeetingChange::new("m1", "Council", jan, [ContentKind::Video]).unwrap(),
                MeetingChange::new("m2", "Council", feb, [ContentKind::Video]).unwrap(),
            ],
        );

        let merged = report.merged_changes();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].meeting_id, "m1");
        assert_eq!(
            merged[0].content_kinds_changed().iter().copied().collect::<Vec<_>>(),
            vec![ContentKind::Minutes, ContentKind::Video]
        );
        assert_eq!(merged[1].meeting_id, "m2");
    }

    #[test]
    fn test_kinds_serialize_lowercase() {
        let change =
            MeetingChange::new("m1", "Council", date(2025, 1, 15), [ContentKind::Transcript])
                .unwrap();
        let json = serde_json::to_value(&change).unwrap();
        assert_eq!(json["contentKindsChanged"], serde_json::json!(["transcript"]));
        assert_eq!(json["meetingDate"], "2025-01-15");
    }
}
