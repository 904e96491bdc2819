use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A work log to be created on a tracker issue from one (time record, tag) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkLogEntry {
    pub issue_key: String,
    pub time_spent_secs: u64,
    pub comment: String,
    /// Tracker user the time belongs to.
    pub author: String,
    pub started: DateTime<Utc>,
    pub idempotency_key: String,
}

/// Deterministic key for a (record, tag) pair so replays collapse onto one work log.
pub fn idempotency_key(record_id: &str, tag_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(record_id.as_bytes());
    hasher.update([0]);
    hasher.update(tag_id.as_bytes());
    format!("{:x}", hasher.finalize())[..32].to_string()
}
