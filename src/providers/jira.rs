use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, FixedOffset, Utc};
use serde::Deserialize;
use serde_json::json;

use super::{check, IssueOrder, IssuePage, IssueQuery, Tracker, TrackerUser};
use crate::error::ApiError;
use crate::model::issue::Issue;
use crate::model::time_record::Author;
use crate::model::worklog::WorkLogEntry;
use crate::util::adf::text_to_adf;

/// Work log entity property that carries the idempotency key.
pub const IDEMPOTENCY_PROPERTY: &str = "jiratime.idempotency";

const ISSUE_FIELDS: &str = "summary,status,project,updated";

pub struct JiraTracker {
    base_url: String,
    auth_header: String,
    /// JQL date literals are interpreted in the API user's timezone.
    offset: FixedOffset,
    client: reqwest::Client,
}

impl JiraTracker {
    pub fn new(domain: &str, email: &str, api_token: &str, offset: FixedOffset) -> Self {
        let creds = format!("{email}:{api_token}");
        let encoded = base64::engine::general_purpose::STANDARD.encode(creds);
        let base_url = if domain.starts_with("http://") || domain.starts_with("https://") {
            domain.trim_end_matches('/').to_string()
        } else {
            format!("https://{domain}.atlassian.net")
        };
        Self {
            base_url,
            auth_header: format!("Basic {encoded}"),
            offset,
            client: reqwest::Client::new(),
        }
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response, ApiError> {
        let resp = self
            .client
            .get(url)
            .header("Authorization", &self.auth_header)
            .header("Accept", "application/json")
            .send()
            .await?;
        check(resp).await
    }
}

/// Build the JQL for an issue query. Dates are rendered in `offset`, minute precision.
pub fn build_jql(query: &IssueQuery, offset: FixedOffset) -> String {
    let mut clauses = Vec::new();
    if let Some(since) = query.updated_since {
        let local = since.with_timezone(&offset);
        clauses.push(format!("updated >= \"{}\"", local.format("%Y/%m/%d %H:%M")));
    }
    if !query.project_keys.is_empty() {
        clauses.push(format!("project in ({})", query.project_keys.join(", ")));
    }
    if !query.excluded_statuses.is_empty() {
        let statuses: Vec<String> = query
            .excluded_statuses
            .iter()
            .map(|s| format!("\"{}\"", s.replace('"', "\\\"")))
            .collect();
        clauses.push(format!("status not in ({})", statuses.join(", ")));
    }
    let order = match query.order {
        IssueOrder::Updated => "ORDER BY updated ASC, key ASC",
        IssueOrder::Created => "ORDER BY created ASC, key ASC",
    };
    if clauses.is_empty() {
        order.to_string()
    } else {
        format!("{} {order}", clauses.join(" AND "))
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SearchResponse {
    #[serde(default)]
    start_at: u32,
    #[serde(default)]
    total: u32,
    issues: Vec<JiraIssue>,
}

#[derive(Deserialize)]
struct JiraIssue {
    id: String,
    key: String,
    fields: IssueFields,
}

#[derive(Deserialize)]
struct IssueFields {
    summary: Option<String>,
    status: Option<StatusField>,
    project: Option<ProjectField>,
    updated: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StatusField {
    name: String,
    status_category: Option<StatusCategory>,
}

#[derive(Deserialize)]
struct StatusCategory {
    name: String,
}

#[derive(Deserialize)]
struct ProjectField {
    key: String,
}

impl SearchResponse {
    pub(crate) fn into_page(self) -> Result<IssuePage, ApiError> {
        let issues = self
            .issues
            .into_iter()
            .map(|issue| {
                let updated = issue
                    .fields
                    .updated
                    .as_deref()
                    .map(parse_jira_timestamp)
                    .transpose()?
                    .ok_or_else(|| ApiError::Decode(format!("issue {} has no updated time", issue.key)))?;
                let project_key = issue
                    .fields
                    .project
                    .map(|p| p.key)
                    .or_else(|| issue.key.split_once('-').map(|(p, _)| p.to_string()))
                    .unwrap_or_default();
                Ok(Issue {
                    id: issue.id,
                    project_key,
                    summary: issue.fields.summary.unwrap_or_default(),
                    status: issue.fields.status.as_ref().map(|s| s.name.clone()),
                    status_category: issue
                        .fields
                        .status
                        .and_then(|s| s.status_category)
                        .map(|c| c.name),
                    key: issue.key,
                    updated,
                })
            })
            .collect::<Result<Vec<_>, ApiError>>()?;
        Ok(IssuePage {
            issues,
            start_at: self.start_at,
            total: self.total,
        })
    }
}

/// Parse Jira's `2019-01-02T10:15:30.000+0000` timestamps.
pub fn parse_jira_timestamp(value: &str) -> Result<DateTime<Utc>, ApiError> {
    DateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f%z")
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| ApiError::Decode(format!("bad timestamp '{value}': {e}")))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorklogPage {
    #[serde(default)]
    start_at: u32,
    #[serde(default)]
    total: u32,
    worklogs: Vec<JiraWorklog>,
}

#[derive(Deserialize)]
struct JiraWorklog {
    id: String,
    #[serde(default)]
    properties: Vec<EntityProperty>,
}

#[derive(Deserialize)]
struct EntityProperty {
    key: String,
    value: serde_json::Value,
}

impl JiraWorklog {
    fn carries_key(&self, idempotency_key: &str) -> bool {
        self.properties.iter().any(|p| {
            p.key == IDEMPOTENCY_PROPERTY
                && p.value.get("key").and_then(|k| k.as_str()) == Some(idempotency_key)
        })
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct JiraUser {
    account_id: String,
    #[serde(default)]
    display_name: String,
    #[serde(default)]
    email_address: Option<String>,
    #[serde(default = "active_default")]
    active: bool,
}

fn active_default() -> bool {
    true
}

impl From<JiraUser> for TrackerUser {
    fn from(user: JiraUser) -> Self {
        TrackerUser {
            account_id: user.account_id,
            display_name: user.display_name,
        }
    }
}

#[derive(Deserialize)]
struct CreatedWorklog {
    id: String,
}

/// Request body for creating a work log.
pub fn worklog_body(entry: &WorkLogEntry) -> serde_json::Value {
    let mut comment = entry.comment.clone();
    if !entry.author.is_empty() {
        if !comment.is_empty() {
            comment.push('\n');
        }
        comment.push_str(&format!("Posted on behalf of {}", entry.author));
    }
    json!({
        "comment": text_to_adf(&comment),
        "started": entry.started.format("%Y-%m-%dT%H:%M:%S%.3f%z").to_string(),
        "timeSpentSeconds": entry.time_spent_secs,
        "properties": [{
            "key": IDEMPOTENCY_PROPERTY,
            "value": { "key": entry.idempotency_key }
        }]
    })
}

#[async_trait]
impl Tracker for JiraTracker {
    fn name(&self) -> &str {
        "Jira"
    }

    async fn verify_access(&self) -> Result<(), ApiError> {
        self.get(&format!("{}/rest/api/3/myself", self.base_url))
            .await
            .map(|_| ())
    }

    async fn search_issues(&self, query: &IssueQuery) -> Result<IssuePage, ApiError> {
        let jql = build_jql(query, self.offset);
        let url = format!(
            "{}/rest/api/3/search?jql={}&startAt={}&maxResults={}&fields={ISSUE_FIELDS}",
            self.base_url,
            urlencoding::encode(&jql),
            query.start_at,
            query.max_results
        );
        let search: SearchResponse = self.get(&url).await?.json().await?;
        search.into_page()
    }

    async fn find_user(&self, author: &Author) -> Result<Option<TrackerUser>, ApiError> {
        if let Some(external_id) = author.external_id.as_deref().filter(|id| !id.is_empty()) {
            let url = format!(
                "{}/rest/api/3/user?accountId={}",
                self.base_url,
                urlencoding::encode(external_id)
            );
            match self.get(&url).await {
                Ok(resp) => return Ok(Some(resp.json::<JiraUser>().await?.into())),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }

        // Fall back to the email, or an external id that looks like one
        let email = author
            .external_id
            .as_deref()
            .filter(|id| id.split('@').count() == 2)
            .or(author.email.as_deref())
            .filter(|e| !e.is_empty());
        let Some(email) = email else {
            return Ok(None);
        };

        let url = format!(
            "{}/rest/api/3/user/search?query={}",
            self.base_url,
            urlencoding::encode(email)
        );
        let users: Vec<JiraUser> = self.get(&url).await?.json().await?;
        Ok(users
            .into_iter()
            .filter(|u| u.active)
            .find(|u| {
                u.email_address
                    .as_deref()
                    .map_or(true, |addr| addr.eq_ignore_ascii_case(email))
            })
            .map(TrackerUser::from))
    }

    async fn find_worklog(
        &self,
        issue_key: &str,
        idempotency_key: &str,
    ) -> Result<Option<String>, ApiError> {
        let mut start_at = 0u32;
        loop {
            let url = format!(
                "{}/rest/api/3/issue/{}/worklog?expand=properties&startAt={start_at}&maxResults=100",
                self.base_url,
                urlencoding::encode(issue_key)
            );
            let page: WorklogPage = self.get(&url).await?.json().await?;
            if let Some(found) = page.worklogs.iter().find(|w| w.carries_key(idempotency_key)) {
                return Ok(Some(found.id.clone()));
            }
            let seen = page.start_at + page.worklogs.len() as u32;
            if page.worklogs.is_empty() || seen >= page.total {
                return Ok(None);
            }
            start_at = seen;
        }
    }

    async fn create_worklog(&self, entry: &WorkLogEntry) -> Result<String, ApiError> {
        let url = format!(
            "{}/rest/api/3/issue/{}/worklog?notifyUsers=false",
            self.base_url,
            urlencoding::encode(&entry.issue_key)
        );
        let resp = self
            .client
            .post(&url)
            .header("Authorization", &self.auth_header)
            .header("Accept", "application/json")
            .json(&worklog_body(entry))
            .send()
            .await?;
        let created: CreatedWorklog = check(resp).await?.json().await?;
        Ok(created.id)
    }
}
