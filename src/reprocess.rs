//! Reprocessing collaborator.
//!
//! The heavy extraction pipeline (text extraction, summarization,
//! transcription) lives outside this crate. The orchestrator only sees the
//! `Reprocessor` trait; `CommandReprocessor` drives the pipeline as an
//! external command, once per meeting.

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::ReprocessError;
use crate::types::ContentKind;

#[async_trait]
pub trait Reprocessor: Send + Sync {
    /// Re-run the pipeline for one meeting and the kinds that changed.
    async fn reprocess(
        &self,
        meeting_id: &str,
        kinds: &BTreeSet<ContentKind>,
    ) -> Result<(), ReprocessError>;
}

/// Comma-joined kind list passed to the pipeline: `agenda,minutes`.
pub fn kinds_arg(kinds: &BTreeSet<ContentKind>) -> String {
    kinds
        .iter()
        .map(|k| k.as_str())
        .collect::<Vec<_>>()
        .join(",")
}

/// Runs `argv... --meeting-id <id> --kinds <k1,k2>`.
#[derive(Debug, Clone)]
pub struct CommandReprocessor {
    argv: Vec<String>,
    timeout: Option<Duration>,
}

impl CommandReprocessor {
    pub fn new(argv: Vec<String>, timeout: Option<Duration>) -> Result<Self, ReprocessError> {
        if argv.first().map_or(true, |p| p.trim().is_empty()) {
            return Err(ReprocessError::CommandNotConfigured);
        }
        Ok(Self { argv, timeout })
    }

    fn build_command(&self, meeting_id: &str, kinds: &str) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.argv[0]);
        cmd.args(&self.argv[1..]);
        cmd.arg("--meeting-id").arg(meeting_id);
        cmd.arg("--kinds").arg(kinds);
        cmd.env("COUNCILWATCH_MEETING_ID", meeting_id);
        cmd.env("COUNCILWATCH_KINDS", kinds);
        cmd.kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Reprocessor for CommandReprocessor {
    async fn reprocess(
        &self,
        meeting_id: &str,
        kinds: &BTreeSet<ContentKind>,
    ) -> Result<(), ReprocessError> {
        let kinds = kinds_arg(kinds);
        let mut cmd = self.build_command(meeting_id, &kinds);

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, cmd.output())
                .await
                .map_err(|_| ReprocessError::Timeout(limit.as_secs()))?,
            None => cmd.output().await,
        }
        .map_err(|e| ReprocessError::SpawnFailed(format!("{}: {}", self.argv[0], e)))?;

        if !output.status.success() {
            let code = output.status.code().unwrap_or(-1);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            // Fall back to stdout when stderr says nothing useful
            let detail = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            return Err(ReprocessError::ScriptFailed {
                code,
                stderr: detail,
            });
        }

        log::info!("Reprocessed {} ({})", meeting_id, kinds);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(list: &[ContentKind]) -> BTreeSet<ContentKind> {
        list.iter().copied().collect()
    }

    #[test]
    fn test_kinds_arg_is_canonical_order() {
        assert_eq!(
            kinds_arg(&kinds(&[ContentKind::Video, ContentKind::Agenda])),
            "agenda,video"
        );
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(matches!(
            CommandReprocessor::new(Vec::new(), None),
            Err(ReprocessError::CommandNotConfigured)
        ));
        assert!(matches!(
            CommandReprocessor::new(vec![" ".to_string()], None),
            Err(ReprocessError::CommandNotConfigured)
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_receives_meeting_and_kinds() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("args.txt");
        let script = format!(
            "echo \"$COUNCILWATCH_MEETING_ID $COUNCILWATCH_KINDS $@\" > {}",
            out.display()
        );
        let reprocessor = CommandReprocessor::new(
            vec!["sh".to_string(), "-c".to_string(), script, "pipeline".to_string()],
            Some(Duration::from_secs(30)),
        )
        .unwrap();

        reprocessor
            .reprocess("m1", &kinds(&[ContentKind::Minutes]))
            .await
            .expect("reprocess");

        let written = std::fs::read_to_string(&out).unwrap();
        assert_eq!(written.trim(), "m1 minutes --meeting-id m1 --kinds minutes");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_script_failed() {
        let reprocessor = CommandReprocessor::new(
            vec![
                "sh".to_string(),
                "-c".to_string(),
                "echo extraction failed >&2; exit 4".to_string(),
            ],
            None,
        )
        .unwrap();

        match reprocessor.reprocess("m1", &kinds(&[ContentKind::Video])).await {
            Err(ReprocessError::ScriptFailed { code, stderr }) => {
                assert_eq!(code, 4);
                assert_eq!(stderr, "extraction failed");
            }
            other => panic!("expected ScriptFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_failure() {
        let reprocessor = CommandReprocessor::new(
            vec!["/nonexistent/councilwatch-pipeline".to_string()],
            None,
        )
        .unwrap();
        let result = reprocessor.reprocess("m1", &kinds(&[ContentKind::Agenda])).await;
        assert!(matches!(result, Err(ReprocessError::SpawnFailed(_))));
    }
}
