//! Configuration loading.
//!
//! Settings live in `~/.councilwatch/config.json` (camelCase keys). Secrets
//! never go in the file: the notification token and the video index key are
//! read from the environment and threaded into constructors explicitly.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::lock::DEFAULT_STALE_AFTER_SECS;
use crate::notifier::{NotifierConfig, DEFAULT_NOTIFY_ENDPOINT, NOTIFY_TIMEOUT_SECS};

pub const NOTIFY_TOKEN_ENV: &str = "COUNCILWATCH_NOTIFY_TOKEN";
pub const VIDEO_API_KEY_ENV: &str = "COUNCILWATCH_VIDEO_API_KEY";

const DEFAULT_LOCK_NAME: &str = "update";

fn default_lock_name() -> String {
    DEFAULT_LOCK_NAME.to_string()
}

fn default_stale_after() -> u64 {
    DEFAULT_STALE_AFTER_SECS
}

fn default_notify_endpoint() -> String {
    DEFAULT_NOTIFY_ENDPOINT.to_string()
}

fn default_notify_timeout() -> u64 {
    NOTIFY_TIMEOUT_SECS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub database_path: PathBuf,
    pub archive_path: PathBuf,
    #[serde(default)]
    pub state_dir: Option<PathBuf>,
    #[serde(default = "default_lock_name")]
    pub lock_name: String,
    #[serde(default = "default_stale_after")]
    pub lock_stale_after_secs: u64,
    #[serde(default)]
    pub video_index_url: Option<String>,
    #[serde(default)]
    pub video_index_path: Option<PathBuf>,
    #[serde(default)]
    pub reprocess_command: Vec<String>,
    #[serde(default)]
    pub reprocess_timeout_secs: Option<u64>,
    #[serde(default = "default_notify_endpoint")]
    pub notify_endpoint: String,
    #[serde(default = "default_notify_timeout")]
    pub notify_timeout_secs: u64,
    #[serde(default)]
    pub notify_user: Option<String>,
}

/// Values taken from the process environment.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Secrets {
    pub notify_token: Option<String>,
    pub video_api_key: Option<String>,
}

impl Secrets {
    /// Resolve secrets through `lookup`, treating blank values as absent.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            notify_token: read(NOTIFY_TOKEN_ENV),
            video_api_key: read(VIDEO_API_KEY_ENV),
        }
    }

    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }
}

/// Where the video index comes from, if anywhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoIndexSource {
    Http(url::Url),
    File(PathBuf),
}

impl Config {
    /// Default config location: `~/.councilwatch/config.json`.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        let home = dirs::home_dir().ok_or(ConfigError::HomeDirNotFound)?;
        Ok(home.join(".councilwatch").join("config.json"))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.lock_name.trim().is_empty()
            || self.lock_name.contains(['/', '\\'])
        {
            return Err(ConfigError::Invalid(format!(
                "lockName '{}' must be a plain file name",
                self.lock_name
            )));
        }
        if self.lock_stale_after_secs == 0 {
            return Err(ConfigError::Invalid(
                "lockStaleAfterSecs must be greater than zero".to_string(),
            ));
        }
        if self.video_index_url.is_some() && self.video_index_path.is_some() {
            return Err(ConfigError::Invalid(
                "set either videoIndexUrl or videoIndexPath, not both".to_string(),
            ));
        }
        if let Some(raw) = &self.video_index_url {
            url::Url::parse(raw)
                .map_err(|e| ConfigError::Invalid(format!("videoIndexUrl: {}", e)))?;
        }
        Ok(())
    }

    /// Directory holding the lock marker. Defaults to `~/.councilwatch`.
    pub fn state_dir(&self) -> Result<PathBuf, ConfigError> {
        match &self.state_dir {
            Some(dir) => Ok(dir.clone()),
            None => {
                let home = dirs::home_dir().ok_or(ConfigError::HomeDirNotFound)?;
                Ok(home.join(".councilwatch"))
            }
        }
    }

    pub fn lock_stale_after(&self) -> Duration {
        Duration::from_secs(self.lock_stale_after_secs)
    }

    pub fn reprocess_timeout(&self) -> Option<Duration> {
        self.reprocess_timeout_secs.map(Duration::from_secs)
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_secs(self.notify_timeout_secs)
    }

    pub fn video_index_source(&self) -> Option<VideoIndexSource> {
        if let Some(raw) = &self.video_index_url {
            // Validated on load
            return url::Url::parse(raw).ok().map(VideoIndexSource::Http);
        }
        self.video_index_path.clone().map(VideoIndexSource::File)
    }

    pub fn notifier_config(&self, secrets: &Secrets) -> NotifierConfig {
        NotifierConfig {
            endpoint: self.notify_endpoint.clone(),
            token: secrets.notify_token.clone(),
            user: self.notify_user.clone(),
        }
    }
}
