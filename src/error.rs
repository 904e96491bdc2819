use thiserror::Error;

use crate::model::outcome::Direction;

const MAX_ERROR_BODY_CHARS: usize = 500;

/// Failure of a single tracker or platform call.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("unexpected response: {0}")]
    Decode(String),
}

impl ApiError {
    pub fn status(status: reqwest::StatusCode, body: impl Into<String>) -> Self {
        let mut body = body.into();
        if let Some((cut, _)) = body.char_indices().nth(MAX_ERROR_BODY_CHARS) {
            body.truncate(cut);
        }
        ApiError::Status {
            status: status.as_u16(),
            body,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::Status { status: 404, .. })
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Timeout
        } else if err.is_decode() {
            ApiError::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            ApiError::status(status, err.to_string())
        } else {
            ApiError::Network(err.to_string())
        }
    }
}

/// Identity store failures. Integrity violations abort the enclosing cycle.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("payload encoding error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("store connection lock poisoned")]
    Poisoned,

    #[error("{direction} cursor regression rejected: current {current}, attempted {attempted}")]
    CursorRegression {
        direction: Direction,
        current: i64,
        attempted: i64,
    },

    #[error("issue {issue_key} is already mapped to tag {existing}, refusing to map it to {tag_id}")]
    MappingConflict {
        issue_key: String,
        existing: String,
        tag_id: String,
    },
}

impl StoreError {
    pub fn is_integrity_violation(&self) -> bool {
        matches!(
            self,
            StoreError::CursorRegression { .. } | StoreError::MappingConflict { .. }
        )
    }
}

/// Cycle-level failures. Returned to the scheduler; per-item failures never end up here.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{system} rejected our credentials: {source}")]
    Unauthorized {
        system: &'static str,
        source: ApiError,
    },

    #[error("failed to fetch from {system}: {source}")]
    Fetch {
        system: &'static str,
        source: ApiError,
    },

    #[error("invalid cycle transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: crate::sync::reconciler::CyclePhase,
        to: crate::sync::reconciler::CyclePhase,
    },
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;

impl SyncError {
    /// A rejected cursor regression or conflicting mapping inside the store.
    pub fn is_integrity_violation(&self) -> bool {
        matches!(self, SyncError::Store(err) if err.is_integrity_violation())
    }
}
