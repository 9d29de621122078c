//! Update run orchestration.
//!
//! Two modes:
//! - check: detect and report, touch nothing
//! - apply: lock, detect, reprocess each changed meeting once, notify, unlock
//!
//! Per-run phases: Idle → AcquiringLock → Detecting → Reprocessing(0..N) →
//! Notifying → Released. A total detection failure short-circuits to Released
//! without reprocessing or notifying.

use serde::Serialize;

use crate::db::MeetingStore;
use crate::detector::{ChangeDetector, DetectionOutcome};
use crate::error::{DetectionError, UpdateError};
use crate::lock::{LockError, LockGuard, RunLock};
use crate::notifier::{NotifyOutcome, UpdateNotifier};
use crate::reprocess::{kinds_arg, Reprocessor};
use crate::types::ChangeReport;
use crate::video_index::VideoIndex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    AcquiringLock,
    Detecting,
    Reprocessing { done: usize, total: usize },
    Notifying,
    Released,
}

fn enter(phase: RunPhase) {
    log::debug!("Update run phase: {:?}", phase);
}

/// A meeting whose reprocessing failed. The batch continued past it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReprocessFailure {
    pub meeting_id: String,
    pub error: String,
}

/// Result of an apply run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplySummary {
    /// The report as detected, before any reprocessing.
    pub report: ChangeReport,
    pub detection_warnings: Vec<DetectionError>,
    pub processed: Vec<String>,
    pub failures: Vec<ReprocessFailure>,
    pub notification: NotifyOutcome,
}

impl ApplySummary {
    pub fn processed_count(&self) -> usize {
        self.processed.len()
    }
}

/// Collaborators for one run, injected by the caller.
pub struct Orchestrator<'a> {
    detector: &'a ChangeDetector,
    store: &'a dyn MeetingStore,
    video_index: Option<&'a dyn VideoIndex>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        detector: &'a ChangeDetector,
        store: &'a dyn MeetingStore,
        video_index: Option<&'a dyn VideoIndex>,
    ) -> Self {
        Self {
            detector,
            store,
            video_index,
        }
    }

    async fn detect(&self) -> Result<DetectionOutcome, UpdateError> {
        enter(RunPhase::Detecting);
        let outcome = self
            .detector
            .detect_all_changes(self.store, self.video_index)
            .await;

        if outcome.is_total_failure() {
            return Err(UpdateError::DetectionFailed(outcome.warnings));
        }
        Ok(outcome)
    }

    /// Dry run: detection only. No reprocessing, no notification, no lock.
    pub async fn run_update_check(&self) -> Result<DetectionOutcome, UpdateError> {
        enter(RunPhase::Idle);
        let outcome = self.detect().await?;
        log::info!(
            "Update check: {} change(s){}",
            outcome.report.total_changes(),
            if outcome.is_partial() { " (partial)" } else { "" }
        );
        Ok(outcome)
    }

    /// Apply run: reprocess only the meetings that changed, then notify.
    ///
    /// Fails fast with `AlreadyRunning` if another run holds the lock. The
    /// lock is released on every exit path through `LockGuard`.
    pub async fn run_update_mode(
        &self,
        lock: &dyn RunLock,
        reprocessor: &dyn Reprocessor,
        notifier: &dyn UpdateNotifier,
    ) -> Result<ApplySummary, UpdateError> {
        enter(RunPhase::Idle);
        enter(RunPhase::AcquiringLock);
        let _guard = LockGuard::acquire(lock).map_err(|e| match e {
            LockError::AlreadyHeld { pid, acquired_at } => {
                UpdateError::AlreadyRunning { pid, acquired_at }
            }
            other => UpdateError::Lock(other.to_string()),
        })?;

        let result = self.apply_locked(reprocessor, notifier).await;
        enter(RunPhase::Released);
        result
    }

    async fn apply_locked(
        &self,
        reprocessor: &dyn Reprocessor,
        notifier: &dyn UpdateNotifier,
    ) -> Result<ApplySummary, UpdateError> {
        let outcome = self.detect().await?;

        // The full report is assembled before any reprocessing starts
        let meetings = outcome.report.merged_changes();
        let total = meetings.len();
        let mut processed = Vec::new();
        let mut failures = Vec::new();

        for (done, change) in meetings.iter().enumerate() {
            enter(RunPhase::Reprocessing { done, total });
            let kinds = change.content_kinds_changed();
            log::info!(
                "Reprocessing {} ({}) [{}/{}]",
                change.meeting_id,
                kinds_arg(kinds),
                done + 1,
                total
            );

            match reprocessor.reprocess(&change.meeting_id, kinds).await {
                Ok(()) => processed.push(change.meeting_id.clone()),
                Err(e) => {
                    log::warn!("Reprocessing failed for {}: {}", change.meeting_id, e);
                    failures.push(ReprocessFailure {
                        meeting_id: change.meeting_id.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        enter(RunPhase::Notifying);
        let notification = notifier
            .send_update_notification(&outcome.report, processed.len())
            .await;

        log::info!(
            "Update run complete: {} change(s), {} reprocessed, {} failed",
            outcome.report.total_changes(),
            processed.len(),
            failures.len()
        );

        Ok(ApplySummary {
            report: outcome.report,
            detection_warnings: outcome.warnings,
            processed,
            failures,
            notification,
        })
    }
}

fn render_changes(out: &mut String, report: &ChangeReport) {
    if report.is_empty() {
        out.push_str("No new meeting content found.\n");
        return;
    }

    out.push_str(&format!(
        "Meetings with new documents ({}):\n",
        report.meetings_with_new_docs.len()
    ));
    for change in &report.meetings_with_new_docs {
        out.push_str(&format!("  - {} [{}]\n", change.summary_line(), change.meeting_id));
    }

    out.push_str(&format!(
        "Meetings with new video ({}):\n",
        report.meetings_with_new_video.len()
    ));
    for change in &report.meetings_with_new_video {
        out.push_str(&format!("  - {} [{}]\n", change.summary_line(), change.meeting_id));
    }

    out.push_str(&format!("Total changes: {}\n", report.total_changes()));
}

fn render_warnings(out: &mut String, warnings: &[DetectionError]) {
    for warning in warnings {
        out.push_str(&format!("WARNING: {}\n", warning));
    }
}

/// Human-readable dry-run report.
pub fn render_report(outcome: &DetectionOutcome) -> String {
    let mut out = String::new();
    if outcome.is_partial() {
        out.push_str("Update check (PARTIAL: some sources could not be read)\n");
    } else {
        out.push_str("Update check\n");
    }
    render_warnings(&mut out, &outcome.warnings);
    render_changes(&mut out, &outcome.report);
    out
}

/// Human-readable apply summary.
pub fn render_apply_summary(summary: &ApplySummary) -> String {
    let mut out = String::from("Update run\n");
    render_warnings(&mut out, &summary.detection_warnings);
    render_changes(&mut out, &summary.report);

    out.push_str(&format!("Reprocessed: {}\n", summary.processed_count()));
    for failure in &summary.failures {
        out.push_str(&format!(
            "WARNING: reprocessing failed for {}: {}\n",
            failure.meeting_id, failure.error
        ));
    }
    out.push_str(&format!("Notification: {:?}\n", summary.notification));
    out
}
