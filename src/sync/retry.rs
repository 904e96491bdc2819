use crate::error::ApiError;
use crate::model::outcome::Outcome;

pub const RETRY_LIMIT_EXCEEDED: &str = "retry limit exceeded";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retried on the next cycle.
    Transient,
    /// Recorded and never retried.
    Permanent,
    /// Credentials rejected; the whole cycle stops.
    Fatal,
}

pub fn classify(err: &ApiError) -> ErrorClass {
    match err {
        ApiError::Timeout | ApiError::Network(_) => ErrorClass::Transient,
        ApiError::Decode(_) => ErrorClass::Permanent,
        ApiError::Status { status, .. } => match *status {
            401 => ErrorClass::Fatal,
            408 | 409 | 423 | 429 => ErrorClass::Transient,
            500..=599 => ErrorClass::Transient,
            _ => ErrorClass::Permanent,
        },
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Ledger outcome for a failure on attempt number `attempt` (1-based).
    ///
    /// A transient failure on the last allowed attempt is escalated to permanent.
    pub fn decide(&self, class: ErrorClass, attempt: u32) -> Outcome {
        match class {
            ErrorClass::Permanent => Outcome::PermanentFailure,
            ErrorClass::Transient | ErrorClass::Fatal if attempt >= self.max_attempts => {
                Outcome::PermanentFailure
            }
            ErrorClass::Transient | ErrorClass::Fatal => Outcome::TransientFailure,
        }
    }
}
