pub mod jira;
pub mod platform;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::AppConfig;
use crate::error::ApiError;
use crate::model::issue::Issue;
use crate::model::tag::Tag;
use crate::model::time_record::{Author, TimeRecord};
use crate::model::worklog::WorkLogEntry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IssueOrder {
    /// Oldest change first; used by discovery so the cursor can follow.
    Updated,
    /// Creation order; stable enough to page through for refresh.
    Created,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssueQuery {
    pub updated_since: Option<DateTime<Utc>>,
    pub project_keys: Vec<String>,
    pub excluded_statuses: Vec<String>,
    pub order: IssueOrder,
    pub start_at: u32,
    pub max_results: u32,
}

#[derive(Debug, Clone, Default)]
pub struct IssuePage {
    pub issues: Vec<Issue>,
    pub start_at: u32,
    pub total: u32,
}

impl IssuePage {
    pub fn is_last(&self) -> bool {
        self.issues.is_empty() || self.start_at as usize + self.issues.len() >= self.total as usize
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerUser {
    pub account_id: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AckStatus {
    Success,
    Failure,
}

/// What the platform is told once a record reaches a terminal outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Acknowledgement {
    pub status: AckStatus,
    pub message: Option<String>,
}

impl Acknowledgement {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: AckStatus::Success,
            message: Some(message.into()),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: AckStatus::Failure,
            message: Some(message.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == AckStatus::Success
    }
}

/// The issue tracker: source of tags, destination of work logs.
#[async_trait]
pub trait Tracker: Send + Sync {
    fn name(&self) -> &str;
    /// Check credentials and reachability. Used at startup and by `health`.
    async fn verify_access(&self) -> Result<(), ApiError>;
    async fn search_issues(&self, query: &IssueQuery) -> Result<IssuePage, ApiError>;
    async fn find_user(&self, author: &Author) -> Result<Option<TrackerUser>, ApiError>;
    /// Id of an existing work log on `issue_key` carrying `idempotency_key`, if any.
    async fn find_worklog(
        &self,
        issue_key: &str,
        idempotency_key: &str,
    ) -> Result<Option<String>, ApiError>;
    /// Create the work log and return its id. Does not check for duplicates.
    async fn create_worklog(&self, entry: &WorkLogEntry) -> Result<String, ApiError>;
}

/// The time-tracking platform: destination of tags, source of posted time.
#[async_trait]
pub trait Platform: Send + Sync {
    fn name(&self) -> &str;
    async fn verify_access(&self) -> Result<(), ApiError>;
    async fn fetch_posted_time(&self, limit: u32) -> Result<Vec<TimeRecord>, ApiError>;
    async fn upsert_tag(&self, tag: &Tag) -> Result<(), ApiError>;
    async fn acknowledge(&self, record_id: &str, ack: &Acknowledgement) -> Result<(), ApiError>;
}

/// Turn a non-2xx response into an [`ApiError::Status`] carrying the body.
async fn check(resp: reqwest::Response) -> Result<reqwest::Response, ApiError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(ApiError::status(status, body))
}

#[cfg(test)]
pub mod fake;


pub fn create_providers(config: &AppConfig) -> Result<(Arc<dyn Tracker>, Arc<dyn Platform>)> {
    let tracker = jira::JiraTracker::new(
        &config.jira.domain,
        &config.jira.email,
        &config.jira.api_token,
        config.jira_offset()?,
    );
    let platform = platform::PlatformClient::new(
        config.platform.base_url.clone(),
        config.platform.api_key.clone(),
    );
    Ok((Arc::new(tracker), Arc::new(platform)))
}
