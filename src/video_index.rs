//! Remote video index: date key → video identifier.
//!
//! Two backends share one decoder:
//! - `HttpVideoIndex`: live JSON endpoint, bearer-authenticated
//! - `JsonFileVideoIndex`: cached index file refreshed by a separate job
//!
//! Accepted shapes: `{"2025-01-15": "abc123", ...}` or
//! `[{"date": "2025-01-15", "videoId": "abc123"}, ...]`.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::Deserialize;

use crate::archive::parse_date_key;
use crate::error::VideoIndexError;

/// Default timeout for index requests.
pub const VIDEO_INDEX_TIMEOUT_SECS: u64 = 30;

pub type VideoIndexMap = BTreeMap<NaiveDate, String>;

/// Read-only handle to the remote video index.
#[async_trait]
pub trait VideoIndex: Send + Sync {
    async fn fetch_index(&self) -> Result<VideoIndexMap, VideoIndexError>;

    fn backend_name(&self) -> &'static str;
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawIndex {
    Map(BTreeMap<String, String>),
    List(Vec<RawEntry>),
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEntry {
    date: String,
    #[serde(alias = "video_id", alias = "id")]
    video_id: String,
}

/// Decode an index document into a date-keyed map.
///
/// Keys that are not `YYYY-MM-DD` are rejected rather than dropped, so a
/// format change upstream surfaces as an error instead of "no new video".
pub fn parse_index(body: &str) -> Result<VideoIndexMap, VideoIndexError> {
    let raw: RawIndex =
        serde_json::from_str(body).map_err(|e| VideoIndexError::Malformed(e.to_string()))?;

    let pairs: Vec<(String, String)> = match raw {
        RawIndex::Map(map) => map.into_iter().collect(),
        RawIndex::List(entries) => entries.into_iter().map(|e| (e.date, e.video_id)).collect(),
    };

    let mut index = VideoIndexMap::new();
    for (key, video_id) in pairs {
        let date = parse_date_key(key.trim())
            .ok_or_else(|| VideoIndexError::Malformed(format!("bad date key '{}'", key)))?;
        if video_id.trim().is_empty() {
            continue;
        }
        index.insert(date, video_id);
    }
    Ok(index)
}

pub struct HttpVideoIndex {
    client: reqwest::Client,
    url: url::Url,
    api_key: Option<String>,
}

impl HttpVideoIndex {
    pub fn new(url: url::Url, api_key: Option<String>) -> Result<Self, VideoIndexError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(VIDEO_INDEX_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            url,
            api_key: api_key.filter(|k| !k.trim().is_empty()),
        })
    }
}

#[async_trait]
impl VideoIndex for HttpVideoIndex {
    async fn fetch_index(&self) -> Result<VideoIndexMap, VideoIndexError> {
        let mut request = self.client.get(self.url.clone());
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let resp = request.send().await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(VideoIndexError::Status { status, body });
        }

        let body = resp.text().await?;
        parse_index(&body)
    }

    fn backend_name(&self) -> &'static str {
        "http"
    }
}

pub struct JsonFileVideoIndex {
    path: PathBuf,
}

impl JsonFileVideoIndex {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl VideoIndex for JsonFileVideoIndex {
    async fn fetch_index(&self) -> Result<VideoIndexMap, VideoIndexError> {
        let body = tokio::fs::read_to_string(&self.path).await?;
        parse_index(&body)
    }

    fn backend_name(&self) -> &'static str {
        "file"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_map_shape() {
        let index = parse_index(r#"{"2025-01-15": "abc", "2025-02-03": "def"}"#).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(
            index.get(&NaiveDate::from_ymd_opt(2025, 1, 15).unwrap()),
            Some(&"abc".to_string())
        );
    }

    #[test]
    fn test_parse_list_shape() {
        let index = parse_index(
            r#"[{"date": "2025-01-15", "videoId": "abc"}, {"date": "2025-02-03", "video_id": ""}]"#,
        )
        .unwrap();
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_parse_rejects_bad_key() {
        let result = parse_index(r#"{"Jan 15": "abc"}"#);
        assert!(matches!(result, Err(VideoIndexError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_file_index_reads_cache() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("videos.json");
        std::fs::write(&path, r#"{"2025-01-15": "abc"}"#).unwrap();

        let index = JsonFileVideoIndex::new(&path).fetch_index().await.unwrap();
        assert_eq!(index.len(), 1);
    }

    #[tokio::test]
    async fn test_file_index_missing_is_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let result = JsonFileVideoIndex::new(dir.path().join("missing.json"))
            .fetch_index()
            .await;
        assert!(matches!(result, Err(VideoIndexError::Io(_))));
    }
}
