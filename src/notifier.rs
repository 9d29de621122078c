//! Operator push notification for update runs.
//!
//! Turns a `ChangeReport` into one short message and posts it to a webhook.
//! Delivery is optional and best-effort: an empty report or a missing token
//! means no request at all, and transport failures are logged, never returned.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::NotifyError;
use crate::types::ChangeReport;

/// Upper bound on the message body, truncation marker included.
pub const MAX_MESSAGE_CHARS: usize = 1000;

/// Appended when the message is cut.
pub const TRUNCATION_MARKER: &str = "\n… (truncated)";

/// Default push webhook.
pub const DEFAULT_NOTIFY_ENDPOINT: &str = "https://api.pushover.net/1/messages.json";

/// Default timeout for the single delivery attempt.
pub const NOTIFY_TIMEOUT_SECS: u64 = 10;

/// JSON body posted to the endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PushPayload {
    pub token: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    pub title: String,
    pub message: String,
}

/// Outbound transport for a push payload.
#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn post(&self, endpoint: &str, payload: &PushPayload) -> Result<(), NotifyError>;
}

/// reqwest-backed transport with a bounded timeout and no retry.
pub struct HttpPushTransport {
    client: reqwest::Client,
}

impl HttpPushTransport {
    pub fn new(timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PushTransport for HttpPushTransport {
    async fn post(&self, endpoint: &str, payload: &PushPayload) -> Result<(), NotifyError> {
        let resp = self.client.post(endpoint).json(payload).send().await?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(NotifyError::Status { status, body });
        }
        Ok(())
    }
}

/// What the notifier did with a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum NotifyOutcome {
    SkippedNoChanges,
    SkippedNoToken,
    Delivered,
    Failed,
}

/// Receives the run result after reprocessing. Never fails the run.
#[async_trait]
pub trait UpdateNotifier: Send + Sync {
    async fn send_update_notification(
        &self,
        report: &ChangeReport,
        processed_count: usize,
    ) -> NotifyOutcome;
}

/// Notifier settings, with the token threaded in explicitly.
#[derive(Debug, Clone, Default)]
pub struct NotifierConfig {
    pub endpoint: String,
    pub token: Option<String>,
    pub user: Option<String>,
}

/// One line per changed meeting, kinds merged across axes.
pub fn summary_lines(report: &ChangeReport) -> Vec<String> {
    report
        .merged_changes()
        .iter()
        .map(|change| change.summary_line())
        .collect()
}

/// Cut `message` to at most `max_chars` characters, marker included.
///
/// Prefers the last full line that fits; falls back to a character boundary
/// when the first line alone is too long.
pub fn truncate_message(message: &str, max_chars: usize) -> String {
    if message.chars().count() <= max_chars {
        return message.to_string();
    }

    let budget = max_chars.saturating_sub(TRUNCATION_MARKER.chars().count());
    let cut_byte = message
        .char_indices()
        .nth(budget)
        .map(|(idx, _)| idx)
        .unwrap_or(message.len());
    let head = &message[..cut_byte];

    let kept = match head.rfind('\n') {
        Some(pos) if pos > 0 => &head[..pos],
        _ => head,
    };

    format!("{}{}", kept, TRUNCATION_MARKER)
}

pub fn notification_title(report: &ChangeReport, processed_count: usize) -> String {
    let total = report.total_changes();
    format!(
        "Council updates: {} change{}, {} reprocessed",
        total,
        if total == 1 { "" } else { "s" },
        processed_count
    )
}

pub struct Notifier<T: PushTransport> {
    config: NotifierConfig,
    transport: T,
}

impl<T: PushTransport> Notifier<T> {
    pub fn new(config: NotifierConfig, transport: T) -> Self {
        Self { config, transport }
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Build the payload, or the skip reason when nothing should be sent.
    pub fn build_payload(
        &self,
        report: &ChangeReport,
        processed_count: usize,
    ) -> Result<PushPayload, NotifyOutcome> {
        if report.total_changes() == 0 {
            return Err(NotifyOutcome::SkippedNoChanges);
        }
        let token = match self.config.token.as_deref().map(str::trim) {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => return Err(NotifyOutcome::SkippedNoToken),
        };

        let message = truncate_message(&summary_lines(report).join("\n"), MAX_MESSAGE_CHARS);
        Ok(PushPayload {
            token,
            user: self.config.user.clone(),
            title: notification_title(report, processed_count),
            message,
        })
    }
}

#[async_trait]
impl<T: PushTransport> UpdateNotifier for Notifier<T> {
    async fn send_update_notification(
        &self,
        report: &ChangeReport,
        processed_count: usize,
    ) -> NotifyOutcome {
        let payload = match self.build_payload(report, processed_count) {
            Ok(p) => p,
            Err(skipped) => {
                log::debug!("Notification skipped: {:?}", skipped);
                return skipped;
            }
        };

        match self.transport.post(&self.config.endpoint, &payload).await {
            Ok(()) => {
                log::info!("Notification sent: {}", payload.title);
                NotifyOutcome::Delivered
            }
            Err(e) => {
                log::warn!("Failed to send update notification: {}", e);
                NotifyOutcome::Failed
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::types::{ContentKind, MeetingChange};
    use chrono::NaiveDate;
    use std::sync::Mutex;

    /// Records every payload; optionally fails delivery.
    #[derive(Default)]
    pub(crate) struct RecordingTransport {
        pub sent: Mutex<Vec<PushPayload>>,
        pub fail: bool,
    }

    #[async_trait]
    impl PushTransport for RecordingTransport {
        async fn post(&self, _endpoint: &str, payload: &PushPayload) -> Result<(), NotifyError> {
            self.sent.lock().unwrap().push(payload.clone());
            if self.fail {
                return Err(NotifyError::Status {
                    status: 500,
                    body: "boom".to_string(),
                });
            }
            Ok(())
        }
    }

    fn config(token: Option<&str>) -> NotifierConfig {
        NotifierConfig {
            endpoint: "http://localhost/push".to_string(),
            token: token.map(String::from),
            user: None,
        }
    }

    fn change(id: &str, m: u32, d: u32, kind: ContentKind) -> MeetingChange {
        MeetingChange::new(id, "Council", NaiveDate::from_ymd_opt(2025, m, d).unwrap(), [kind])
            .unwrap()
    }

    #[tokio::test]
    async fn test_empty_report_sends_nothing() {
        let notifier = Notifier::new(config(Some("tok")), RecordingTransport::default());
        let outcome = notifier
            .send_update_notification(&ChangeReport::default(), 0)
            .await;
        assert_eq!(outcome, NotifyOutcome::SkippedNoChanges);
        assert!(notifier.transport.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_or_blank_token_sends_nothing() {
        let report = ChangeReport::new(vec![change("m1", 1, 15, ContentKind::Minutes)], vec![]);
        for token in [None, Some(""), Some("   ")] {
            let notifier = Notifier::new(config(token), RecordingTransport::default());
            let outcome = notifier.send_update_notification(&report, 1).await;
            assert_eq!(outcome, NotifyOutcome::SkippedNoToken);
            assert!(notifier.transport.sent.lock().unwrap().is_empty());
        }
    }

    #[tokio::test]
    async fn test_delivers_summary_lines() {
        let report = ChangeReport::new(
            vec![change("m1", 1, 15, ContentKind::Minutes)],
            vec![change("m2", 2, 3, ContentKind::Video)],
        );
        let notifier = Notifier::new(config(Some("tok")), RecordingTransport::default());

        let outcome = notifier.send_update_notification(&report, 2).await;
        assert_eq!(outcome, NotifyOutcome::Delivered);

        let sent = notifier.transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].message, "Jan 15 Council (minutes)\nFeb 3 Council (video)");
        assert_eq!(sent[0].token, "tok");
        assert_eq!(sent[0].title, "Council updates: 2 changes, 2 reprocessed");
    }

    #[tokio::test]
    async fn test_transport_failure_is_swallowed() {
        let report = ChangeReport::new(vec![change("m1", 1, 15, ContentKind::Agenda)], vec![]);
        let transport = RecordingTransport {
            fail: true,
            ..Default::default()
        };
        let notifier = Notifier::new(config(Some("tok")), transport);

        let outcome = notifier.send_update_notification(&report, 0).await;
        assert_eq!(outcome, NotifyOutcome::Failed);
    }

    #[test]
    fn test_truncate_short_message_untouched() {
        assert_eq!(truncate_message("abc", 10), "abc");
    }

    #[test]
    fn test_truncate_at_line_boundary() {
        let lines: Vec<String> = (0..200).map(|i| format!("Jan {} Council (minutes)", i)).collect();
        let message = lines.join("\n");
        let cut = truncate_message(&message, MAX_MESSAGE_CHARS);

        assert!(cut.chars().count() <= MAX_MESSAGE_CHARS);
        assert!(cut.ends_with(TRUNCATION_MARKER));
        let body = cut.trim_end_matches(TRUNCATION_MARKER);
        assert!(body.lines().all(|l| lines.contains(&l.to_string())));
    }

    #[test]
    fn test_truncate_single_long_line_on_char_boundary() {
        let message = "é".repeat(50);
        let cut = truncate_message(&message, 20);
        assert_eq!(cut.chars().count(), 20);
        assert!(cut.ends_with(TRUNCATION_MARKER));
    }
}
