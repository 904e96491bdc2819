//! In-memory tracker and platform used by the sync tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{Acknowledgement, IssueOrder, IssuePage, IssueQuery, Platform, Tracker, TrackerUser};
use crate::error::ApiError;
use crate::model::issue::Issue;
use crate::model::tag::Tag;
use crate::model::time_record::{Author, TimeRecord};
use crate::model::worklog::WorkLogEntry;

pub fn not_found() -> ApiError {
    ApiError::Status {
        status: 404,
        body: "Issue does not exist or you do not have permission to see it.".into(),
    }
}

pub fn unavailable() -> ApiError {
    ApiError::Status {
        status: 503,
        body: "Service Unavailable".into(),
    }
}

pub fn unauthorized() -> ApiError {
    ApiError::Status {
        status: 401,
        body: "Unauthorized".into(),
    }
}

#[derive(Debug, Clone)]
pub struct StoredWorklog {
    pub id: String,
    pub entry: WorkLogEntry,
}

pub struct FakeTracker {
    issues: Mutex<Vec<Issue>>,
    users: Mutex<Vec<(String, TrackerUser)>>,
    worklogs: Mutex<Vec<StoredWorklog>>,
    /// When false the fake ignores project and status clauses, like a misconfigured JQL.
    apply_query_filters: bool,
    search_errors: Mutex<VecDeque<ApiError>>,
    /// Issue versions swapped in when the numbered search arrives.
    scheduled_edits: Mutex<Vec<(usize, Issue)>>,
    create_errors: Mutex<HashMap<String, VecDeque<ApiError>>>,
    lose_next_response: AtomicBool,
    pub searches: Mutex<Vec<IssueQuery>>,
    pub create_calls: AtomicUsize,
}

impl FakeTracker {
    pub fn new() -> Self {
        Self {
            issues: Mutex::new(Vec::new()),
            users: Mutex::new(Vec::new()),
            worklogs: Mutex::new(Vec::new()),
            apply_query_filters: true,
            search_errors: Mutex::new(VecDeque::new()),
            scheduled_edits: Mutex::new(Vec::new()),
            create_errors: Mutex::new(HashMap::new()),
            lose_next_response: AtomicBool::new(false),
            searches: Mutex::new(Vec::new()),
            create_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_issues(issues: Vec<Issue>) -> Self {
        let tracker = Self::new();
        *tracker.issues.lock().unwrap() = issues;
        tracker
    }

    pub fn without_query_filters(mut self) -> Self {
        self.apply_query_filters = false;
        self
    }

    pub fn with_user(self, email: &str, account_id: &str, display_name: &str) -> Self {
        self.users.lock().unwrap().push((
            email.to_string(),
            TrackerUser {
                account_id: account_id.to_string(),
                display_name: display_name.to_string(),
            },
        ));
        self
    }

    pub fn add_issue(&self, issue: Issue) {
        let mut issues = self.issues.lock().unwrap();
        issues.retain(|i| i.key != issue.key);
        issues.push(issue);
    }

    pub fn delete_issue(&self, key: &str) {
        self.issues.lock().unwrap().retain(|i| i.key != key);
    }

    pub fn fail_next_search(&self, err: ApiError) {
        self.search_errors.lock().unwrap().push_back(err);
    }

    /// Replace an issue with `edited` just before search number `search` (1-based) runs.
    pub fn edit_before_search(&self, search: usize, edited: Issue) {
        self.scheduled_edits.lock().unwrap().push((search, edited));
    }

    pub fn fail_next_create(&self, issue_key: &str, err: ApiError) {
        self.create_errors
            .lock()
            .unwrap()
            .entry(issue_key.to_string())
            .or_default()
            .push_back(err);
    }

    /// The next create succeeds on the tracker but the caller sees a timeout.
    pub fn lose_next_create_response(&self) {
        self.lose_next_response.store(true, Ordering::SeqCst);
    }

    pub fn worklogs(&self) -> Vec<StoredWorklog> {
        self.worklogs.lock().unwrap().clone()
    }

    pub fn worklogs_on(&self, issue_key: &str) -> Vec<StoredWorklog> {
        self.worklogs()
            .into_iter()
            .filter(|w| w.entry.issue_key == issue_key)
            .collect()
    }

    /// Store a work log directly, as if an earlier process created it and then died.
    pub fn insert_worklog(&self, entry: WorkLogEntry) -> String {
        let mut worklogs = self.worklogs.lock().unwrap();
        let id = (10_000 + worklogs.len()).to_string();
        worklogs.push(StoredWorklog {
            id: id.clone(),
            entry,
        });
        id
    }

    fn has_issue(&self, key: &str) -> bool {
        self.issues.lock().unwrap().iter().any(|i| i.key == key)
    }
}

#[async_trait]
impl Tracker for FakeTracker {
    fn name(&self) -> &str {
        "fake-tracker"
    }

    async fn verify_access(&self) -> Result<(), ApiError> {
        Ok(())
    }

    async fn search_issues(&self, query: &IssueQuery) -> Result<IssuePage, ApiError> {
        let search = {
            let mut searches = self.searches.lock().unwrap();
            searches.push(query.clone());
            searches.len()
        };
        let due: Vec<Issue> = {
            let mut edits = self.scheduled_edits.lock().unwrap();
            let (due, later): (Vec<_>, Vec<_>) =
                edits.drain(..).partition(|(n, _)| *n == search);
            *edits = later;
            due.into_iter().map(|(_, issue)| issue).collect()
        };
        for issue in due {
            self.add_issue(issue);
        }
        if let Some(err) = self.search_errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        let mut matching: Vec<Issue> = self
            .issues
            .lock()
            .unwrap()
            .iter()
            .filter(|i| query.updated_since.map_or(true, |since| i.updated >= since))
            .filter(|i| {
                !self.apply_query_filters
                    || query.project_keys.is_empty()
                    || query.project_keys.contains(&i.project_key)
            })
            .filter(|i| {
                !self.apply_query_filters
                    || !query.excluded_statuses.iter().any(|s| {
                        i.status
                            .as_deref()
                            .map_or(false, |status| status.eq_ignore_ascii_case(s))
                    })
            })
            .cloned()
            .collect();
        match query.order {
            IssueOrder::Updated => {
                matching.sort_by(|a, b| (a.updated, &a.key).cmp(&(b.updated, &b.key)))
            }
            IssueOrder::Created => matching.sort_by(|a, b| a.id.cmp(&b.id)),
        }
        let total = matching.len() as u32;
        let issues = matching
            .into_iter()
            .skip(query.start_at as usize)
            .take(query.max_results as usize)
            .collect();
        Ok(IssuePage {
            issues,
            start_at: query.start_at,
            total,
        })
    }

    async fn find_user(&self, author: &Author) -> Result<Option<TrackerUser>, ApiError> {
        let users = self.users.lock().unwrap();
        let by_id = author
            .external_id
            .as_deref()
            .and_then(|id| users.iter().find(|(_, u)| u.account_id == id));
        let by_email = author
            .email
            .as_deref()
            .and_then(|email| users.iter().find(|(e, _)| e.eq_ignore_ascii_case(email)));
        Ok(by_id.or(by_email).map(|(_, user)| user.clone()))
    }

    async fn find_worklog(
        &self,
        issue_key: &str,
        idempotency_key: &str,
    ) -> Result<Option<String>, ApiError> {
        if !self.has_issue(issue_key) {
            return Err(not_found());
        }
        Ok(self
            .worklogs
            .lock()
            .unwrap()
            .iter()
            .find(|w| w.entry.issue_key == issue_key && w.entry.idempotency_key == idempotency_key)
            .map(|w| w.id.clone()))
    }

    async fn create_worklog(&self, entry: &WorkLogEntry) -> Result<String, ApiError> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        let injected = self
            .create_errors
            .lock()
            .unwrap()
            .get_mut(&entry.issue_key)
            .and_then(|errors| errors.pop_front());
        if let Some(err) = injected {
            return Err(err);
        }
        if !self.has_issue(&entry.issue_key) {
            return Err(not_found());
        }
        let id = self.insert_worklog(entry.clone());
        if self.lose_next_response.swap(false, Ordering::SeqCst) {
            return Err(ApiError::Timeout);
        }
        Ok(id)
    }
}

pub struct FakePlatform {
    pending: Mutex<Vec<TimeRecord>>,
    tags: Mutex<Vec<Tag>>,
    acks: Mutex<Vec<(String, Acknowledgement)>>,
    upsert_errors: Mutex<HashMap<String, VecDeque<ApiError>>>,
    ack_errors: Mutex<VecDeque<ApiError>>,
    fetch_errors: Mutex<VecDeque<ApiError>>,
}

impl FakePlatform {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            tags: Mutex::new(Vec::new()),
            acks: Mutex::new(Vec::new()),
            upsert_errors: Mutex::new(HashMap::new()),
            ack_errors: Mutex::new(VecDeque::new()),
            fetch_errors: Mutex::new(VecDeque::new()),
        }
    }

    /// Queue posted time. Records stay queued until acknowledged.
    pub fn post(&self, record: TimeRecord) {
        self.pending.lock().unwrap().push(record);
    }

    pub fn pending(&self) -> Vec<String> {
        self.pending.lock().unwrap().iter().map(|r| r.id.clone()).collect()
    }

    /// Every upsert received, in order.
    pub fn tags(&self) -> Vec<Tag> {
        self.tags.lock().unwrap().clone()
    }

    pub fn tag_names(&self) -> Vec<String> {
        self.tags().into_iter().map(|t| t.name).collect()
    }

    pub fn acks(&self) -> Vec<(String, Acknowledgement)> {
        self.acks.lock().unwrap().clone()
    }

    pub fn ack_for(&self, record_id: &str) -> Option<Acknowledgement> {
        self.acks()
            .into_iter()
            .rev()
            .find(|(id, _)| id == record_id)
            .map(|(_, ack)| ack)
    }

    pub fn fail_next_upsert(&self, tag_name: &str, err: ApiError) {
        self.upsert_errors
            .lock()
            .unwrap()
            .entry(tag_name.to_string())
            .or_default()
            .push_back(err);
    }

    pub fn fail_next_ack(&self, err: ApiError) {
        self.ack_errors.lock().unwrap().push_back(err);
    }

    pub fn fail_next_fetch(&self, err: ApiError) {
        self.fetch_errors.lock().unwrap().push_back(err);
    }
}

#[async_trait]
impl Platform for FakePlatform {
    fn name(&self) -> &str {
        "fake-platform"
    }

    async fn verify_access(&self) -> Result<(), ApiError> {
        Ok(())
    }

    async fn fetch_posted_time(&self, limit: u32) -> Result<Vec<TimeRecord>, ApiError> {
        if let Some(err) = self.fetch_errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        Ok(self
            .pending
            .lock()
            .unwrap()
            .iter()
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn upsert_tag(&self, tag: &Tag) -> Result<(), ApiError> {
        let injected = self
            .upsert_errors
            .lock()
            .unwrap()
            .get_mut(&tag.name)
            .and_then(|errors| errors.pop_front());
        if let Some(err) = injected {
            return Err(err);
        }
        self.tags.lock().unwrap().push(tag.clone());
        Ok(())
    }

    async fn acknowledge(&self, record_id: &str, ack: &Acknowledgement) -> Result<(), ApiError> {
        if let Some(err) = self.ack_errors.lock().unwrap().pop_front() {
            return Err(err);
        }
        self.acks
            .lock()
            .unwrap()
            .push((record_id.to_string(), ack.clone()));
        self.pending.lock().unwrap().retain(|r| r.id != record_id);
        Ok(())
    }
}
