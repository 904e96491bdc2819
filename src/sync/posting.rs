use tracing::{debug, info, warn};

use super::discovery::IssueFilter;
use super::retry::{classify, ErrorClass, RetryPolicy, RETRY_LIMIT_EXCEEDED};
use super::SyncContext;
use crate::error::{ApiError, StoreError, SyncError, SyncResult};
use crate::model::issue::IssueKey;
use crate::model::outcome::{Direction, Outcome};
use crate::model::time_record::{PostedTag, TimeRecord};
use crate::model::worklog::{idempotency_key, WorkLogEntry};
use crate::providers::Acknowledgement;
use crate::util::text::{ellipsize, format_duration, normalize_comment};

/// What happened to one record in a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordStatus {
    Processed,
    /// Already terminal from an earlier cycle.
    Skipped,
    /// Transient failure; retried next cycle.
    Retrying(String),
    Failed(String),
}

#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub results: Vec<(String, RecordStatus)>,
    /// Stopped early on shutdown; the remaining records were not touched.
    pub aborted: bool,
}

impl BatchReport {
    pub fn count(&self, pred: impl Fn(&RecordStatus) -> bool) -> usize {
        self.results.iter().filter(|(_, status)| pred(status)).count()
    }
}

/// Result of one attempt at posting a record, before the retry policy applies.
#[derive(Debug)]
enum Attempt {
    Posted { issues: Vec<String>, secs: u64 },
    NothingToPost(String),
    Failed { class: ErrorClass, reason: String },
}

impl Attempt {
    fn permanent(reason: impl Into<String>) -> Self {
        Attempt::Failed {
            class: ErrorClass::Permanent,
            reason: reason.into(),
        }
    }
}

/// Post `records` in order, one ledger outcome per record.
///
/// Per-record failures land in the ledger; only cycle-level failures (store
/// errors, rejected credentials) are returned as `Err`.
pub async fn post_batch(
    ctx: &SyncContext,
    records: &[TimeRecord],
    policy: &RetryPolicy,
) -> SyncResult<BatchReport> {
    let mut report = BatchReport::default();
    for record in records {
        if ctx.is_cancelled() {
            report.aborted = true;
            break;
        }
        let status = post_record(ctx, record, policy).await?;
        report.results.push((record.id.clone(), status));
    }
    Ok(report)
}

pub async fn post_record(
    ctx: &SyncContext,
    record: &TimeRecord,
    policy: &RetryPolicy,
) -> SyncResult<RecordStatus> {
    let prior = ctx.store.outcome(&record.id, Direction::Posting)?;
    if let Some(prior) = prior.as_ref().filter(|p| p.outcome.is_terminal()) {
        if !prior.acknowledged {
            acknowledge(ctx, &record.id, prior.outcome, prior.reason.as_deref()).await?;
        }
        debug!(record_id = %record.id, outcome = %prior.outcome, "already handled, skipping");
        return Ok(RecordStatus::Skipped);
    }
    let attempt = prior.map_or(0, |p| p.attempt_count) + 1;

    let (outcome, reason) = match attempt_post(ctx, record, attempt).await? {
        Attempt::Posted { issues, secs } => {
            info!(
                record_id = %record.id,
                issues = %ellipsize(&issues),
                duration = %format_duration(secs),
                "posted time"
            );
            (Outcome::Processed, None)
        }
        Attempt::NothingToPost(reason) => {
            info!(record_id = %record.id, %reason, "nothing to post");
            (Outcome::Processed, Some(reason))
        }
        Attempt::Failed { class, reason } => {
            let outcome = policy.decide(class, attempt);
            let reason = if class != ErrorClass::Permanent && outcome.is_terminal() {
                format!("{RETRY_LIMIT_EXCEEDED}: {reason}")
            } else {
                reason
            };
            warn!(
                record_id = %record.id,
                attempt,
                max_attempts = policy.max_attempts(),
                %outcome,
                %reason,
                "posting failed"
            );
            (outcome, Some(reason))
        }
    };

    let payload = if outcome.is_terminal() {
        None
    } else {
        Some(serde_json::to_string(record).map_err(StoreError::from)?)
    };
    ctx.store.record_outcome(
        &record.id,
        Direction::Posting,
        outcome,
        reason.as_deref(),
        payload.as_deref(),
    )?;

    if outcome.is_terminal() {
        acknowledge(ctx, &record.id, outcome, reason.as_deref()).await?;
    }
    Ok(match outcome {
        Outcome::Processed => RecordStatus::Processed,
        Outcome::TransientFailure => RecordStatus::Retrying(reason.unwrap_or_default()),
        Outcome::PermanentFailure => RecordStatus::Failed(reason.unwrap_or_default()),
    })
}

async fn attempt_post(ctx: &SyncContext, record: &TimeRecord, attempt: u32) -> SyncResult<Attempt> {
    let config = &ctx.config;
    if let Some(expected) = config.platform.caller_key.as_deref() {
        if record.caller_key.as_deref() != Some(expected) {
            return Ok(Attempt::permanent("invalid caller key in posted time"));
        }
    }

    let filter = IssueFilter::from_config(&config.discovery);
    let tags = relevant_tags(record, &config.tag_upsert_path(), &filter);
    if tags.is_empty() {
        return Ok(Attempt::NothingToPost("no Jira tags, nothing to post".into()));
    }
    if record.time_rows.is_empty() {
        return Ok(Attempt::permanent("cannot post time with no time rows"));
    }
    let Some(started) = record.activity_start() else {
        return Ok(Attempt::permanent("time rows carry an invalid activity hour"));
    };
    let secs = record.per_tag_duration_secs();
    if secs == 0 {
        return Ok(Attempt::NothingToPost("zero duration, nothing to post".into()));
    }

    let user = match ctx.call(ctx.tracker.find_user(&record.user)).await {
        Ok(Some(user)) => user,
        Ok(None) => {
            let who = record.user.email.as_deref().unwrap_or(&record.user.name);
            return Ok(Attempt::permanent(format!("user does not exist: {who}")));
        }
        Err(err) => return api_failure(err),
    };

    let mut targets = Vec::with_capacity(tags.len());
    let mut unknown = Vec::new();
    for tag in &tags {
        match ctx.store.lookup_mapping(&tag.name)? {
            Some(issue_key) => targets.push((*tag, issue_key)),
            None => unknown.push(tag.name.clone()),
        }
    }
    if !unknown.is_empty() {
        let class = if attempt <= config.posting.unknown_tag_grace_attempts {
            ErrorClass::Transient
        } else {
            ErrorClass::Permanent
        };
        return Ok(Attempt::Failed {
            class,
            reason: format!("unknown tag {}", ellipsize(&unknown)),
        });
    }

    let comment = build_comment(record, config.posting.include_activity_rows);
    let mut issues = Vec::with_capacity(targets.len());
    for (tag, issue_key) in targets {
        let key = idempotency_key(&record.id, &tag.name);
        if ctx.store.find_worklog(&key)?.is_some() {
            debug!(record_id = %record.id, issue = %issue_key, "work log already in ledger");
            issues.push(issue_key);
            continue;
        }

        let existing = match ctx.call(ctx.tracker.find_worklog(&issue_key, &key)).await {
            Ok(existing) => existing,
            Err(err) => return issue_failure(ctx, &tag.name, &issue_key, err),
        };
        let worklog_id = match existing {
            Some(id) => {
                info!(
                    record_id = %record.id,
                    issue = %issue_key,
                    worklog = %id,
                    "work log already exists"
                );
                id
            }
            None => {
                let entry = WorkLogEntry {
                    issue_key: issue_key.clone(),
                    time_spent_secs: secs,
                    comment: comment.clone(),
                    author: user.display_name.clone(),
                    started,
                    idempotency_key: key.clone(),
                };
                match ctx.call(ctx.tracker.create_worklog(&entry)).await {
                    Ok(id) => id,
                    Err(err) => return issue_failure(ctx, &tag.name, &issue_key, err),
                }
            }
        };
        ctx.store.record_worklog(&key, &record.id, &issue_key, &worklog_id)?;
        issues.push(issue_key);
    }
    Ok(Attempt::Posted { issues, secs })
}

fn api_failure(err: ApiError) -> SyncResult<Attempt> {
    match classify(&err) {
        ErrorClass::Fatal => Err(SyncError::Unauthorized {
            system: "tracker",
            source: err,
        }),
        class => Ok(Attempt::Failed {
            class,
            reason: err.to_string(),
        }),
    }
}

/// A missing issue drops its mapping so a later discovery can re-validate it.
fn issue_failure(
    ctx: &SyncContext,
    tag_id: &str,
    issue_key: &str,
    err: ApiError,
) -> SyncResult<Attempt> {
    if err.is_not_found() {
        if ctx.store.remove_mapping(tag_id)? {
            warn!(tag = tag_id, issue = issue_key, "issue no longer exists, mapping removed");
        }
        return Ok(Attempt::permanent(format!("issue {issue_key} not found")));
    }
    api_failure(err)
}

/// Tags posted under the upsert path whose names are issue keys in allowed projects.
///
/// Tags created before paths carried the name sit at the upsert path with its
/// slashes stripped, `Jira` for `/Jira/`.
pub fn relevant_tags<'a>(
    record: &'a TimeRecord,
    upsert_path: &str,
    filter: &IssueFilter,
) -> Vec<&'a PostedTag> {
    let legacy = upsert_path.trim_matches('/');
    record
        .tags
        .iter()
        .filter(|tag| tag.path == format!("{upsert_path}{}", tag.name) || tag.path == legacy)
        .filter(|tag| {
            IssueKey::from_tag_name(&tag.name)
                .map_or(false, |key| filter.allows_project(&key.project_key))
        })
        .collect()
}

/// Work log comment: the narrative without emoji, plus activity rows when enabled.
pub fn build_comment(record: &TimeRecord, include_activity_rows: bool) -> String {
    let mut lines = Vec::new();
    let narrative = normalize_comment(&record.description);
    if !narrative.is_empty() {
        lines.push(narrative);
    }
    if include_activity_rows {
        for row in &record.time_rows {
            let activity = normalize_comment(&row.activity);
            lines.push(format!(
                "{:02}:00 {} ({})",
                row.activity_hour % 100,
                if activity.is_empty() { "Activity" } else { activity.as_str() },
                format_duration(row.duration_secs)
            ));
        }
    }
    lines.join("\n")
}

/// Report a terminal outcome to the platform and flag it acknowledged.
///
/// Returns whether the platform confirmed. An unconfirmed ack is re-sent next cycle.
pub async fn acknowledge(
    ctx: &SyncContext,
    record_id: &str,
    outcome: Outcome,
    reason: Option<&str>,
) -> SyncResult<bool> {
    let ack = match outcome {
        Outcome::Processed => Acknowledgement::success(reason.unwrap_or("posted")),
        _ => Acknowledgement::failure(reason.unwrap_or("posting failed")),
    };
    match ctx.call(ctx.platform.acknowledge(record_id, &ack)).await {
        Ok(()) => {
            ctx.store.mark_acknowledged(record_id, Direction::Posting)?;
            debug!(record_id, success = ack.is_success(), "acknowledged");
            Ok(true)
        }
        Err(err) if classify(&err) == ErrorClass::Fatal => Err(SyncError::Unauthorized {
            system: "platform",
            source: err,
        }),
        Err(err) => {
            warn!(record_id, error = %err, "acknowledgement not delivered, will resend");
            Ok(false)
        }
    }
}
