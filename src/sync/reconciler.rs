use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::discovery::{self, RefreshReport, TagSync};
use super::posting::{self, RecordStatus};
use super::retry::{classify, ErrorClass, RetryPolicy};
use super::SyncContext;
use crate::config::AppConfig;
use crate::error::{ApiError, SyncError, SyncResult};
use crate::model::outcome::{Direction, Outcome};
use crate::model::time_record::TimeRecord;
use crate::providers::{Platform, Tracker};
use crate::store::IdentityStore;
use crate::util::text::ellipsize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CyclePhase {
    Idle,
    Fetching,
    Processing,
    Committing,
}

impl CyclePhase {
    /// `Committing -> Fetching` continues a paged cycle with its next page.
    pub fn can_move_to(self, next: CyclePhase) -> bool {
        use CyclePhase::*;
        matches!(
            (self, next),
            (Idle, Fetching)
                | (Fetching, Processing)
                | (Processing, Committing)
                | (Committing, Idle)
                | (Committing, Fetching)
        )
    }
}

struct Cycle {
    direction: Direction,
    phase: CyclePhase,
}

impl Cycle {
    fn start(direction: Direction) -> Self {
        Self {
            direction,
            phase: CyclePhase::Idle,
        }
    }

    fn enter(&mut self, next: CyclePhase) -> SyncResult<()> {
        if !self.phase.can_move_to(next) {
            return Err(SyncError::InvalidTransition {
                from: self.phase,
                to: next,
            });
        }
        debug!(direction = %self.direction, from = ?self.phase, to = ?next, "cycle phase");
        self.phase = next;
        Ok(())
    }

    /// Drop back to idle without committing.
    fn abort(&mut self) {
        debug!(direction = %self.direction, from = ?self.phase, "cycle aborted");
        self.phase = CyclePhase::Idle;
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleSummary {
    pub direction: Direction,
    pub processed: usize,
    pub failed: usize,
    pub retried: usize,
    pub skipped: usize,
    /// Cursor after the cycle, in milliseconds since the epoch.
    pub cursor: Option<i64>,
    pub aborted: bool,
}

impl CycleSummary {
    fn new(direction: Direction) -> Self {
        Self {
            direction,
            processed: 0,
            failed: 0,
            retried: 0,
            skipped: 0,
            cursor: None,
            aborted: false,
        }
    }
}

impl fmt::Display for CycleSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} processed, {} failed, {} retried, {} skipped",
            self.direction, self.processed, self.failed, self.retried, self.skipped
        )?;
        if self.aborted {
            write!(f, " (aborted)")?;
        }
        Ok(())
    }
}

/// Drives discovery and posting cycles against one store.
pub struct Reconciler {
    ctx: SyncContext,
    policy: RetryPolicy,
}

impl Reconciler {
    pub fn new(
        tracker: Arc<dyn Tracker>,
        platform: Arc<dyn Platform>,
        store: IdentityStore,
        config: AppConfig,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let policy = RetryPolicy::new(config.posting.max_attempts);
        Self {
            ctx: SyncContext::new(tracker, platform, store, config, shutdown),
            policy,
        }
    }

    #[cfg(test)]
    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    pub fn config(&self) -> &AppConfig {
        &self.ctx.config
    }

    /// Check the store and both systems' credentials.
    pub async fn verify_access(&self) -> SyncResult<()> {
        self.ctx.store.ping()?;
        let tracker = self.ctx.tracker.name();
        if let Err(err) = self.ctx.call(self.ctx.tracker.verify_access()).await {
            error!(provider = tracker, error = %err, "access check failed");
            return Err(fetch_error("tracker", err));
        }
        let platform = self.ctx.platform.name();
        if let Err(err) = self.ctx.call(self.ctx.platform.verify_access()).await {
            error!(provider = platform, error = %err, "access check failed");
            return Err(fetch_error("platform", err));
        }
        debug!(tracker, platform, "access verified");
        Ok(())
    }

    /// Push new and changed issues to the platform as tags, page by page.
    ///
    /// Pages are keyed by update time: each page is fetched again from the
    /// newest update time seen so far, so an issue edited mid-cycle cannot shift
    /// an unseen one out of the window. Issue versions already handled in this
    /// cycle are skipped. The cursor advances once per page to the page's latest
    /// update time. After a transient push failure it stays at that issue's
    /// update time so the issue is fetched again next cycle.
    pub async fn run_discovery_cycle(&self) -> SyncResult<CycleSummary> {
        let direction = Direction::Discovery;
        let store = &self.ctx.store;
        let mut cycle = Cycle::start(direction);
        let mut summary = CycleSummary::new(direction);

        summary.cursor = store.get_cursor(direction)?;
        let mut since = summary.cursor.and_then(DateTime::from_timestamp_millis);
        let mut start_at = 0;
        let mut pinned: Option<DateTime<Utc>> = None;
        let mut seen: HashMap<String, DateTime<Utc>> = HashMap::new();

        loop {
            cycle.enter(CyclePhase::Fetching)?;
            let page = discovery::discover(&self.ctx, since, start_at)
                .await
                .map_err(|err| fetch_error("tracker", err))?;

            cycle.enter(CyclePhase::Processing)?;
            for issue in &page.filtered {
                if seen.insert(issue.key.clone(), issue.updated) != Some(issue.updated) {
                    summary.skipped += 1;
                }
            }
            let mut pushed = Vec::new();
            for (issue, tag) in &page.candidates {
                if self.ctx.is_cancelled() {
                    summary.aborted = true;
                    break;
                }
                if seen.insert(issue.key.clone(), issue.updated) == Some(issue.updated) {
                    continue;
                }
                match discovery::sync_tag(&self.ctx, tag, false).await? {
                    TagSync::Created | TagSync::Updated => {
                        summary.processed += 1;
                        pushed.push(tag.name.clone());
                        let previously_failed = store
                            .outcome(tag.id(), direction)?
                            .is_some_and(|o| o.outcome != Outcome::Processed);
                        if previously_failed {
                            store.record_outcome(tag.id(), direction, Outcome::Processed, None, None)?;
                        }
                    }
                    TagSync::Unchanged => summary.skipped += 1,
                    TagSync::Failed {
                        class: ErrorClass::Transient,
                        reason,
                    } => {
                        summary.retried += 1;
                        pinned.get_or_insert(issue.updated);
                        warn!(issue = %issue.key, %reason, "tag push failed, will retry");
                    }
                    TagSync::Failed { reason, .. } => {
                        summary.failed += 1;
                        store.record_outcome(
                            tag.id(),
                            direction,
                            Outcome::PermanentFailure,
                            Some(&reason),
                            None,
                        )?;
                        warn!(issue = %issue.key, %reason, "tag push rejected");
                    }
                }
            }
            if !pushed.is_empty() {
                info!(tags = %ellipsize(&pushed), "pushed tags");
            }
            if summary.aborted {
                cycle.abort();
                info!(%summary, "discovery cycle stopped on shutdown");
                return Ok(summary);
            }

            cycle.enter(CyclePhase::Committing)?;
            if let Some(cursor) = self.commit_cursor(direction, pinned.or(page.max_updated))? {
                summary.cursor = Some(cursor);
            }
            if page.is_last {
                break;
            }
            match page.max_updated {
                Some(max) if since.map_or(true, |s| max > s) => {
                    since = Some(max);
                    start_at = 0;
                }
                // a full page of ties at `since`; only an offset moves past it
                _ => start_at = page.next_start,
            }
        }

        cycle.enter(CyclePhase::Idle)?;
        info!(%summary, "discovery cycle finished");
        Ok(summary)
    }

    /// One tag refresh batch. Run after discovery.
    pub async fn run_tag_refresh(&self) -> SyncResult<RefreshReport> {
        discovery::refresh(&self.ctx).await
    }

    /// Post a batch of time records as work logs.
    ///
    /// With `batch = None` the records are fetched from the platform. Either
    /// way, records left for retry by earlier cycles are processed first.
    pub async fn run_posting_cycle(
        &self,
        batch: Option<Vec<TimeRecord>>,
    ) -> SyncResult<CycleSummary> {
        let direction = Direction::Posting;
        let mut cycle = Cycle::start(direction);
        let mut summary = CycleSummary::new(direction);
        summary.cursor = self.ctx.store.get_cursor(direction)?;

        cycle.enter(CyclePhase::Fetching)?;
        let resent = self.resend_acknowledgements().await?;
        let records = self.gather_posting_batch(batch).await?;
        debug!(records = records.len(), resent, "posting batch ready");

        cycle.enter(CyclePhase::Processing)?;
        let report = posting::post_batch(&self.ctx, &records, &self.policy).await?;
        summary.processed = report.count(|s| matches!(s, RecordStatus::Processed));
        summary.failed = report.count(|s| matches!(s, RecordStatus::Failed(_)));
        summary.retried = report.count(|s| matches!(s, RecordStatus::Retrying(_)));
        summary.skipped = report.count(|s| matches!(s, RecordStatus::Skipped));
        if report.aborted {
            summary.aborted = true;
            cycle.abort();
            info!(%summary, "posting cycle stopped on shutdown");
            return Ok(summary);
        }

        cycle.enter(CyclePhase::Committing)?;
        let latest = records.iter().map(|r| r.posted_at).max();
        if let Some(cursor) = self.commit_cursor(direction, latest)? {
            summary.cursor = Some(cursor);
        }

        cycle.enter(CyclePhase::Idle)?;
        if !records.is_empty() {
            info!(%summary, "posting cycle finished");
        }
        Ok(summary)
    }

    async fn resend_acknowledgements(&self) -> SyncResult<usize> {
        let mut resent = 0;
        for record in self.ctx.store.unacknowledged(Direction::Posting)? {
            if self.ctx.is_cancelled() {
                break;
            }
            let delivered = posting::acknowledge(
                &self.ctx,
                &record.record_id,
                record.outcome,
                record.reason.as_deref(),
            )
            .await?;
            if delivered {
                resent += 1;
            }
        }
        if resent > 0 {
            info!(resent, "re-sent lost acknowledgements");
        }
        Ok(resent)
    }

    /// Stored retries first, then new records, deduplicated by record id.
    async fn gather_posting_batch(
        &self,
        batch: Option<Vec<TimeRecord>>,
    ) -> SyncResult<Vec<TimeRecord>> {
        let limit = self.ctx.config.posting.batch_size;
        let mut records = Vec::new();
        for (record_id, payload) in self.ctx.store.pending_retries(Direction::Posting, limit)? {
            match serde_json::from_str::<TimeRecord>(&payload) {
                Ok(record) => records.push(record),
                Err(err) => {
                    let reason = format!("unreadable retry payload: {err}");
                    warn!(%record_id, %reason, "giving up on stored retry");
                    self.ctx.store.record_outcome(
                        &record_id,
                        Direction::Posting,
                        Outcome::PermanentFailure,
                        Some(&reason),
                        None,
                    )?;
                    posting::acknowledge(
                        &self.ctx,
                        &record_id,
                        Outcome::PermanentFailure,
                        Some(&reason),
                    )
                    .await?;
                }
            }
        }

        let incoming = match batch {
            Some(batch) => batch,
            None => self
                .ctx
                .call(self.ctx.platform.fetch_posted_time(limit))
                .await
                .map_err(|err| fetch_error("platform", err))?,
        };
        let mut seen: HashSet<String> = records.iter().map(|r| r.id.clone()).collect();
        records.extend(incoming.into_iter().filter(|r| seen.insert(r.id.clone())));
        Ok(records)
    }

    /// Advance the cursor to `target` unless it is already there or beyond.
    fn commit_cursor(
        &self,
        direction: Direction,
        target: Option<DateTime<Utc>>,
    ) -> SyncResult<Option<i64>> {
        let Some(target) = target else {
            return Ok(None);
        };
        let value = target.timestamp_millis();
        let current = self.ctx.store.get_cursor(direction)?;
        if current.is_some_and(|c| c >= value) {
            return Ok(current);
        }
        self.ctx.store.advance_cursor(direction, value)?;
        Ok(Some(value))
    }
}

fn fetch_error(system: &'static str, source: ApiError) -> SyncError {
    match classify(&source) {
        ErrorClass::Fatal => SyncError::Unauthorized { system, source },
        _ => SyncError::Fetch { system, source },
    }
}
