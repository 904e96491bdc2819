//! Identity store: the connector's only durable state.
//!
//! Holds the tag ↔ issue mapping, a monotonic cursor per sync direction, the
//! per-record outcome ledger, and a ledger of work logs already confirmed on
//! the tracker. Every mutation runs in its own transaction and the connection
//! lock is never held across an `.await`.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::StoreError;
use crate::model::outcome::{Direction, Outcome, OutcomeRecord};

type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mapping {
    pub tag_id: String,
    pub issue_key: String,
    pub fingerprint: String,
}

#[derive(Clone)]
pub struct IdentityStore {
    conn: Arc<Mutex<Connection>>,
}

impl IdentityStore {
    /// Open (creating if needed) the store at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Self::from_connection(Arc::new(Mutex::new(conn)))
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Arc::new(Mutex::new(Connection::open_in_memory()?)))
    }

    /// Wrap an existing connection handle, creating the schema if it is missing.
    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> Result<Self> {
        let store = Self { conn };
        store.with_conn(|conn| init_schema(conn))?;
        Ok(store)
    }

    fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> Result<T>) -> Result<T> {
        let mut guard = self.conn.lock().map_err(|_| StoreError::Poisoned)?;
        f(&mut guard)
    }

    pub fn ping(&self) -> Result<()> {
        self.with_conn(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
    }

    // === Identity mapping ===

    pub fn lookup_mapping(&self, tag_id: &str) -> Result<Option<String>> {
        Ok(self.mapping(tag_id)?.map(|m| m.issue_key))
    }

    pub fn mapping(&self, tag_id: &str) -> Result<Option<Mapping>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT platform_tag_id, tracker_issue_key, fingerprint
                     FROM identity_mapping WHERE platform_tag_id = ?1",
                    [tag_id],
                    |row| {
                        Ok(Mapping {
                            tag_id: row.get(0)?,
                            issue_key: row.get(1)?,
                            fingerprint: row.get(2)?,
                        })
                    },
                )
                .optional()?)
        })
    }

    /// Create or overwrite the mapping for `tag_id`.
    ///
    /// Mapping an issue that already belongs to a different tag is an integrity violation.
    pub fn upsert_mapping(&self, tag_id: &str, issue_key: &str, fingerprint: &str) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let existing: Option<String> = tx
                .query_row(
                    "SELECT platform_tag_id FROM identity_mapping
                     WHERE tracker_issue_key = ?1 AND platform_tag_id != ?2",
                    params![issue_key, tag_id],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(existing) = existing {
                return Err(StoreError::MappingConflict {
                    issue_key: issue_key.to_string(),
                    existing,
                    tag_id: tag_id.to_string(),
                });
            }
            tx.execute(
                r#"
                INSERT INTO identity_mapping(platform_tag_id, tracker_issue_key, fingerprint, updated_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(platform_tag_id) DO UPDATE SET
                  tracker_issue_key=excluded.tracker_issue_key,
                  fingerprint=excluded.fingerprint,
                  updated_at=excluded.updated_at
                "#,
                params![tag_id, issue_key, fingerprint, now()],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    /// Drop a mapping whose issue the tracker no longer knows. Returns whether one existed.
    pub fn remove_mapping(&self, tag_id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let removed = conn.execute(
                "DELETE FROM identity_mapping WHERE platform_tag_id = ?1",
                [tag_id],
            )?;
            Ok(removed > 0)
        })
    }

    pub fn mapping_count(&self) -> Result<u64> {
        self.with_conn(|conn| {
            Ok(conn.query_row("SELECT COUNT(*) FROM identity_mapping", [], |row| {
                row.get::<_, i64>(0)
            })? as u64)
        })
    }

    // === Cursors ===

    pub fn get_cursor(&self, direction: Direction) -> Result<Option<i64>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT cursor_value FROM sync_cursor WHERE direction = ?1",
                    [direction.as_str()],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    /// Move the cursor forward. Equal values are a no-op; smaller values are rejected.
    pub fn advance_cursor(&self, direction: Direction, value: i64) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            let current: Option<i64> = tx
                .query_row(
                    "SELECT cursor_value FROM sync_cursor WHERE direction = ?1",
                    [direction.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(current) = current {
                if value < current {
                    return Err(StoreError::CursorRegression {
                        direction,
                        current,
                        attempted: value,
                    });
                }
            }
            tx.execute(
                r#"
                INSERT INTO sync_cursor(direction, cursor_value, updated_at)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(direction) DO UPDATE SET
                  cursor_value=excluded.cursor_value,
                  updated_at=excluded.updated_at
                "#,
                params![direction.as_str(), value, now()],
            )?;
            tx.commit()?;
            Ok(())
        })
    }

    // === Outcome ledger ===

    /// Record one attempt's outcome for `record_id`.
    ///
    /// Bumps the attempt count and clears the acknowledged flag. `payload` is
    /// kept only for transient failures, which are retried from it.
    pub fn record_outcome(
        &self,
        record_id: &str,
        direction: Direction,
        outcome: Outcome,
        reason: Option<&str>,
        payload: Option<&str>,
    ) -> Result<OutcomeRecord> {
        let payload = if outcome.is_terminal() { None } else { payload };
        self.with_conn(|conn| {
            let tx = conn.transaction()?;
            tx.execute(
                r#"
                INSERT INTO record_outcome(record_id, direction, outcome, reason, attempt_count, acknowledged, payload, updated_at)
                VALUES (?1, ?2, ?3, ?4, 1, 0, ?5, ?6)
                ON CONFLICT(record_id, direction) DO UPDATE SET
                  outcome=excluded.outcome,
                  reason=excluded.reason,
                  attempt_count=record_outcome.attempt_count + 1,
                  acknowledged=0,
                  payload=COALESCE(excluded.payload, CASE WHEN excluded.outcome = 'transient_failure' THEN record_outcome.payload END),
                  updated_at=excluded.updated_at
                "#,
                params![
                    record_id,
                    direction.as_str(),
                    outcome.as_str(),
                    reason,
                    payload,
                    now()
                ],
            )?;
            let record = tx.query_row(
                &format!("{SELECT_OUTCOME} WHERE record_id = ?1 AND direction = ?2"),
                params![record_id, direction.as_str()],
                row_to_outcome,
            )?;
            tx.commit()?;
            Ok(record)
        })
    }

    pub fn outcome(&self, record_id: &str, direction: Direction) -> Result<Option<OutcomeRecord>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    &format!("{SELECT_OUTCOME} WHERE record_id = ?1 AND direction = ?2"),
                    params![record_id, direction.as_str()],
                    row_to_outcome,
                )
                .optional()?)
        })
    }

    pub fn mark_acknowledged(&self, record_id: &str, direction: Direction) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "UPDATE record_outcome SET acknowledged = 1
                 WHERE record_id = ?1 AND direction = ?2 AND outcome != 'transient_failure'",
                params![record_id, direction.as_str()],
            )?;
            Ok(())
        })
    }

    /// Terminal outcomes the platform has not confirmed yet, oldest first.
    pub fn unacknowledged(&self, direction: Direction) -> Result<Vec<OutcomeRecord>> {
        self.query_outcomes(
            &format!(
                "{SELECT_OUTCOME} WHERE direction = ?1 AND acknowledged = 0
                 AND outcome != 'transient_failure' ORDER BY updated_at, record_id"
            ),
            direction,
            None,
        )
    }

    /// `(record_id, payload)` of transiently failed records, oldest first.
    pub fn pending_retries(
        &self,
        direction: Direction,
        limit: u32,
    ) -> Result<Vec<(String, String)>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT record_id, payload FROM record_outcome
                 WHERE direction = ?1 AND outcome = 'transient_failure' AND payload IS NOT NULL
                 ORDER BY updated_at, record_id LIMIT ?2",
            )?;
            let payloads = stmt
                .query_map(params![direction.as_str(), limit], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?
                .collect::<std::result::Result<Vec<(String, String)>, _>>()?;
            Ok(payloads)
        })
    }

    /// Permanently failed records, newest first, for operator visibility.
    pub fn failures(&self, direction: Direction, limit: u32) -> Result<Vec<OutcomeRecord>> {
        self.query_outcomes(
            &format!(
                "{SELECT_OUTCOME} WHERE direction = ?1 AND outcome = 'permanent_failure'
                 ORDER BY updated_at DESC, record_id LIMIT ?2"
            ),
            direction,
            Some(limit),
        )
    }

    fn query_outcomes(
        &self,
        sql: &str,
        direction: Direction,
        limit: Option<u32>,
    ) -> Result<Vec<OutcomeRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(sql)?;
            let rows = match limit {
                Some(limit) => stmt
                    .query_map(params![direction.as_str(), limit], row_to_outcome)?
                    .collect::<std::result::Result<Vec<_>, _>>()?,
                None => stmt
                    .query_map(params![direction.as_str()], row_to_outcome)?
                    .collect::<std::result::Result<Vec<_>, _>>()?,
            };
            Ok(rows)
        })
    }

    // === Work log ledger ===

    pub fn find_worklog(&self, idempotency_key: &str) -> Result<Option<String>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT worklog_id FROM worklog_ledger WHERE idempotency_key = ?1",
                    [idempotency_key],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    pub fn record_worklog(
        &self,
        idempotency_key: &str,
        record_id: &str,
        issue_key: &str,
        worklog_id: &str,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT OR IGNORE INTO worklog_ledger(idempotency_key, record_id, tracker_issue_key, worklog_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![idempotency_key, record_id, issue_key, worklog_id, now()],
            )?;
            Ok(())
        })
    }

    // === Markers ===

    pub fn get_marker(&self, name: &str) -> Result<Option<i64>> {
        self.with_conn(|conn| {
            Ok(conn
                .query_row(
                    "SELECT value FROM sync_marker WHERE name = ?1",
                    [name],
                    |row| row.get(0),
                )
                .optional()?)
        })
    }

    pub fn set_marker(&self, name: &str, value: i64) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sync_marker(name, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(name) DO UPDATE SET value=excluded.value, updated_at=excluded.updated_at",
                params![name, value, now()],
            )?;
            Ok(())
        })
    }
}

const SELECT_OUTCOME: &str = "SELECT record_id, direction, outcome, reason, attempt_count, acknowledged, updated_at FROM record_outcome";

fn row_to_outcome(row: &Row<'_>) -> rusqlite::Result<OutcomeRecord> {
    let direction: String = row.get(1)?;
    let outcome: String = row.get(2)?;
    Ok(OutcomeRecord {
        record_id: row.get(0)?,
        direction: direction.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, e.into())
        })?,
        outcome: outcome.parse().map_err(|e: String| {
            rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, e.into())
        })?,
        reason: row.get(3)?,
        attempt_count: row.get(4)?,
        acknowledged: row.get(5)?,
        updated_at: row.get(6)?,
    })
}

fn now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS identity_mapping (
            platform_tag_id TEXT PRIMARY KEY,
            tracker_issue_key TEXT NOT NULL,
            fingerprint TEXT NOT NULL DEFAULT '',
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_identity_mapping_issue
            ON identity_mapping(tracker_issue_key);

        CREATE TABLE IF NOT EXISTS sync_cursor (
            direction TEXT PRIMARY KEY,
            cursor_value INTEGER NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS record_outcome (
            record_id TEXT NOT NULL,
            direction TEXT NOT NULL,
            outcome TEXT NOT NULL,
            reason TEXT,
            attempt_count INTEGER NOT NULL DEFAULT 0,
            acknowledged INTEGER NOT NULL DEFAULT 0,
            payload TEXT,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (record_id, direction)
        );

        CREATE INDEX IF NOT EXISTS idx_record_outcome_state
            ON record_outcome(direction, outcome, acknowledged);

        CREATE TABLE IF NOT EXISTS worklog_ledger (
            idempotency_key TEXT PRIMARY KEY,
            record_id TEXT NOT NULL,
            tracker_issue_key TEXT NOT NULL,
            worklog_id TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sync_marker (
            name TEXT PRIMARY KEY,
            value INTEGER NOT NULL,
            updated_at TEXT NOT NULL
        );
        "#,
    )?;
    Ok(())
}
