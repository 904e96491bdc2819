use anyhow::{Context, Result};
use chrono::FixedOffset;
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid setting {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub jira: JiraConfig,
    pub platform: PlatformConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub posting: PostingConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct JiraConfig {
    /// `acme` for `https://acme.atlassian.net`, or a full base URL.
    pub domain: String,
    pub email: String,
    #[serde(default)]
    pub api_token: String,
    /// Offset of the API user's Jira profile timezone; JQL dates are read in it.
    #[serde(default = "default_timezone_offset")]
    pub timezone_offset: String,
}

fn default_timezone_offset() -> String {
    "+00:00".into()
}

#[derive(Debug, Deserialize, Clone)]
pub struct PlatformConfig {
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    /// When set, posted time carrying a different caller key is rejected.
    pub caller_key: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Project allow-list. Empty means every project.
    pub project_keys: Vec<String>,
    /// Status names that never become tags, compared case-insensitively.
    pub excluded_statuses: Vec<String>,
    pub tag_upsert_path: String,
    pub batch_size: u32,
    pub interval_minutes: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            project_keys: Vec::new(),
            excluded_statuses: vec!["Closed".into(), "Done".into()],
            tag_upsert_path: "/Jira/".into(),
            // A large batch mitigates query round trip latency
            batch_size: 200,
            interval_minutes: 5,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct PostingConfig {
    pub batch_size: u32,
    pub max_attempts: u32,
    pub interval_secs: u64,
    /// Cycles an unmapped tag is retried before the record fails permanently.
    pub unknown_tag_grace_attempts: u32,
    /// Append one line per activity row to the work log comment.
    pub include_activity_rows: bool,
}

impl Default for PostingConfig {
    fn default() -> Self {
        Self {
            batch_size: 50,
            max_attempts: 5,
            interval_secs: 60,
            unknown_tag_grace_attempts: 0,
            include_activity_rows: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StoreConfig {
    pub path: Option<PathBuf>,
}

fn default_call_timeout_secs() -> u64 {
    30
}

impl AppConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn store_path(&self) -> PathBuf {
        self.store
            .path
            .clone()
            .unwrap_or_else(|| data_dir().join("state.db"))
    }

    /// Tag upsert path normalized to `/…/`.
    pub fn tag_upsert_path(&self) -> String {
        let trimmed = self.discovery.tag_upsert_path.trim_matches('/');
        if trimmed.is_empty() {
            "/".to_string()
        } else {
            format!("/{trimmed}/")
        }
    }

    pub fn jira_offset(&self) -> Result<FixedOffset, ConfigError> {
        self.jira
            .timezone_offset
            .parse::<FixedOffset>()
            .map_err(|e| ConfigError::Invalid {
                key: "jira.timezone_offset",
                reason: format!("'{}': {e}", self.jira.timezone_offset),
            })
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(token) = std::env::var("JIRA_API_TOKEN") {
            self.jira.api_token = token;
        }
        if let Ok(key) = std::env::var("PLATFORM_API_KEY") {
            self.platform.api_key = key;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.jira.domain.trim().is_empty() {
            return Err(ConfigError::Missing("jira.domain"));
        }
        if self.jira.email.trim().is_empty() {
            return Err(ConfigError::Missing("jira.email"));
        }
        if self.jira.api_token.trim().is_empty() {
            return Err(ConfigError::Missing("jira.api_token"));
        }
        if self.platform.api_key.trim().is_empty() {
            return Err(ConfigError::Missing("platform.api_key"));
        }
        if !self.platform.base_url.starts_with("http://")
            && !self.platform.base_url.starts_with("https://")
        {
            return Err(ConfigError::Invalid {
                key: "platform.base_url",
                reason: format!("'{}' is not an http(s) URL", self.platform.base_url),
            });
        }
        self.jira_offset()?;
        if let Some(bad) = self
            .discovery
            .project_keys
            .iter()
            .find(|k| k.is_empty() || !k.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'))
        {
            return Err(ConfigError::Invalid {
                key: "discovery.project_keys",
                reason: format!("'{bad}' is not a Jira project key"),
            });
        }
        let positive: [(&'static str, u64); 6] = [
            ("discovery.batch_size", self.discovery.batch_size.into()),
            ("discovery.interval_minutes", self.discovery.interval_minutes),
            ("posting.batch_size", self.posting.batch_size.into()),
            ("posting.max_attempts", self.posting.max_attempts.into()),
            ("posting.interval_secs", self.posting.interval_secs),
            ("call_timeout_secs", self.call_timeout_secs),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key,
                    reason: "must be greater than zero".into(),
                });
            }
        }
        Ok(())
    }
}

fn config_path() -> PathBuf {
    if let Ok(path) = std::env::var("JIRATIME_CONFIG") {
        return PathBuf::from(path);
    }
    data_dir().join("config.toml")
}

pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".jiratime")
}

pub fn parse_config(contents: &str) -> Result<AppConfig> {
    let mut config: AppConfig =
        toml::from_str(contents).with_context(|| "Failed to parse config.toml")?;
    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

pub fn load_config() -> Result<AppConfig> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config from {}", path.display()))?;
    parse_config(&contents)
}
