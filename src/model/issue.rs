use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A Jira issue as seen by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    pub id: String,
    /// `{projectKey}-{issueNumber}`, e.g. `WT-1234`
    pub key: String,
    pub project_key: String,
    pub summary: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_category: Option<String>,
    pub updated: DateTime<Utc>,
}

/// Jira issue reference parsed from a tag name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IssueKey {
    pub project_key: String,
    pub issue_number: u64,
}

impl IssueKey {
    /// Parse a tag name of the exact form `PROJ-42`. Anything else is not an issue key.
    pub fn from_tag_name(tag_name: &str) -> Option<Self> {
        let (project, number) = tag_name.split_once('-')?;
        if project.is_empty() || number.contains('-') {
            return None;
        }
        if !project.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return None;
        }
        let issue_number = number.parse::<u64>().ok()?;
        Some(Self {
            project_key: project.to_string(),
            issue_number,
        })
    }
}

impl fmt::Display for IssueKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.project_key, self.issue_number)
    }
}
