use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::retry::{classify, ErrorClass};
use super::SyncContext;
use crate::config::DiscoveryConfig;
use crate::error::{ApiError, SyncError, SyncResult};
use crate::model::issue::Issue;
use crate::model::tag::Tag;
use crate::providers::{IssueOrder, IssueQuery};
use crate::util::text::ellipsize;

/// Marker holding the offset of the next tag refresh batch.
pub const REFRESH_OFFSET_MARKER: &str = "refresh-offset";

const FORTNIGHT_MINUTES: u64 = 14 * 24 * 60;
const MIN_REFRESH_BATCH: u64 = 10;

/// Project allow-list and status exclusions applied to every issue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IssueFilter {
    project_keys: Vec<String>,
    excluded_statuses: Vec<String>,
}

impl IssueFilter {
    pub fn new(project_keys: Vec<String>, excluded_statuses: Vec<String>) -> Self {
        Self {
            project_keys,
            excluded_statuses,
        }
    }

    pub fn from_config(config: &DiscoveryConfig) -> Self {
        Self::new(config.project_keys.clone(), config.excluded_statuses.clone())
    }

    /// An empty allow-list admits every project.
    pub fn allows_project(&self, project_key: &str) -> bool {
        self.project_keys.is_empty() || self.project_keys.iter().any(|k| k == project_key)
    }

    pub fn allows(&self, issue: &Issue) -> bool {
        if !self.allows_project(&issue.project_key) {
            return false;
        }
        let Some(status) = issue.status.as_deref() else {
            return true;
        };
        !self
            .excluded_statuses
            .iter()
            .any(|excluded| excluded.eq_ignore_ascii_case(status))
    }

    pub fn query(
        &self,
        since: Option<DateTime<Utc>>,
        order: IssueOrder,
        start_at: u32,
        max_results: u32,
    ) -> IssueQuery {
        IssueQuery {
            updated_since: since,
            project_keys: self.project_keys.clone(),
            excluded_statuses: self.excluded_statuses.clone(),
            order,
            start_at,
            max_results,
        }
    }
}

/// The tag for `issue`, or `None` when the filter rejects it.
pub fn issue_to_tag(issue: &Issue, filter: &IssueFilter, path: &str) -> Option<Tag> {
    filter.allows(issue).then(|| Tag::from_issue(issue, path))
}

/// Refresh batch size that revisits every known tag about once a fortnight.
pub fn tag_refresh_batch_size(tag_count: u64, interval_minutes: u64, max_batch: u32) -> u32 {
    let cycles_per_fortnight = (FORTNIGHT_MINUTES / interval_minutes.max(1)).max(1);
    let size = (tag_count / cycles_per_fortnight).max(MIN_REFRESH_BATCH);
    size.min(u64::from(max_batch)) as u32
}

/// One page of discovery candidates.
#[derive(Debug, Clone)]
pub struct DiscoveredPage {
    pub candidates: Vec<(Issue, Tag)>,
    /// Issues on the page rejected by the filter.
    pub filtered: Vec<Issue>,
    /// Latest update time seen on the page, filtered issues included.
    pub max_updated: Option<DateTime<Utc>>,
    pub next_start: u32,
    pub is_last: bool,
}

/// Fetch the page of issues updated at or after `since` starting at `start_at`.
pub async fn discover(
    ctx: &SyncContext,
    since: Option<DateTime<Utc>>,
    start_at: u32,
) -> Result<DiscoveredPage, ApiError> {
    let filter = IssueFilter::from_config(&ctx.config.discovery);
    let path = ctx.config.tag_upsert_path();
    let query = filter.query(
        since,
        IssueOrder::Updated,
        start_at,
        ctx.config.discovery.batch_size,
    );
    let page = ctx.call(ctx.tracker.search_issues(&query)).await?;

    let max_updated = page.issues.iter().map(|issue| issue.updated).max();
    let is_last = page.is_last();
    let next_start = start_at + page.issues.len() as u32;
    let mut candidates = Vec::with_capacity(page.issues.len());
    let mut filtered = Vec::new();
    for issue in page.issues {
        match issue_to_tag(&issue, &filter, &path) {
            Some(tag) => candidates.push((issue, tag)),
            None => {
                debug!(issue = %issue.key, "issue rejected by discovery filter");
                filtered.push(issue);
            }
        }
    }
    Ok(DiscoveredPage {
        candidates,
        filtered,
        max_updated,
        next_start,
        is_last,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagSync {
    Created,
    Updated,
    Unchanged,
    Failed { class: ErrorClass, reason: String },
}

/// Push `tag` to the platform when it is new or its fingerprint changed, then
/// record the mapping. `force` pushes even an unchanged tag.
pub async fn sync_tag(ctx: &SyncContext, tag: &Tag, force: bool) -> SyncResult<TagSync> {
    let fingerprint = tag.fingerprint();
    let existing = ctx.store.mapping(tag.id())?;
    if !force {
        if let Some(mapping) = &existing {
            if mapping.fingerprint == fingerprint {
                return Ok(TagSync::Unchanged);
            }
        }
    }

    if let Err(err) = ctx.call(ctx.platform.upsert_tag(tag)).await {
        return match classify(&err) {
            ErrorClass::Fatal => Err(SyncError::Unauthorized {
                system: "platform",
                source: err,
            }),
            class => Ok(TagSync::Failed {
                class,
                reason: err.to_string(),
            }),
        };
    }

    ctx.store.upsert_mapping(tag.id(), &tag.name, &fingerprint)?;
    Ok(match existing {
        None => TagSync::Created,
        Some(_) => TagSync::Updated,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub refreshed: usize,
    pub failed: usize,
    /// Offset the next refresh batch starts from.
    pub next_offset: i64,
}

/// Re-push one batch of known tags so renamed or missed ones converge.
///
/// Walks every in-filter issue by creation order; an empty batch starts over.
pub async fn refresh(ctx: &SyncContext) -> SyncResult<RefreshReport> {
    let discovery = &ctx.config.discovery;
    let batch_size = tag_refresh_batch_size(
        ctx.store.mapping_count()?,
        discovery.interval_minutes,
        discovery.batch_size,
    );
    let offset = ctx.store.get_marker(REFRESH_OFFSET_MARKER)?.unwrap_or(0);
    let filter = IssueFilter::from_config(discovery);
    let path = ctx.config.tag_upsert_path();
    let query = filter.query(
        None,
        IssueOrder::Created,
        u32::try_from(offset).unwrap_or(0),
        batch_size,
    );

    let mut report = RefreshReport {
        next_offset: offset,
        ..Default::default()
    };
    let page = match ctx.call(ctx.tracker.search_issues(&query)).await {
        Ok(page) => page,
        Err(err) if classify(&err) == ErrorClass::Fatal => {
            return Err(SyncError::Unauthorized {
                system: "tracker",
                source: err,
            })
        }
        Err(err) => {
            warn!(error = %err, offset, "tag refresh fetch failed");
            return Ok(report);
        }
    };

    if page.issues.is_empty() {
        ctx.store.set_marker(REFRESH_OFFSET_MARKER, 0)?;
        report.next_offset = 0;
        debug!("tag refresh reached the end, starting over");
        return Ok(report);
    }

    let mut refreshed = Vec::new();
    for issue in &page.issues {
        if ctx.is_cancelled() {
            break;
        }
        let Some(tag) = issue_to_tag(issue, &filter, &path) else {
            continue;
        };
        match sync_tag(ctx, &tag, true).await? {
            TagSync::Failed { reason, .. } => {
                warn!(issue = %issue.key, %reason, "tag refresh failed");
                report.failed += 1;
            }
            _ => refreshed.push(issue.key.clone()),
        }
    }

    report.refreshed = refreshed.len();
    report.next_offset = offset + page.issues.len() as i64;
    ctx.store.set_marker(REFRESH_OFFSET_MARKER, report.next_offset)?;
    if !refreshed.is_empty() {
        info!(tags = %ellipsize(&refreshed), "refreshed tags");
    }
    Ok(report)
}
