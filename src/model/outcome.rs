use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Sync direction. Each direction owns its own cursor and ledger rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Tracker issues to platform tags.
    Discovery,
    /// Platform time records to tracker work logs.
    Posting,
}

impl Direction {
    pub const ALL: [Direction; 2] = [Direction::Discovery, Direction::Posting];

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Discovery => "discovery",
            Direction::Posting => "posting",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Direction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "discovery" => Ok(Direction::Discovery),
            "posting" => Ok(Direction::Posting),
            other => Err(format!("unknown direction '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Processed,
    TransientFailure,
    PermanentFailure,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Processed => "processed",
            Outcome::TransientFailure => "transient_failure",
            Outcome::PermanentFailure => "permanent_failure",
        }
    }

    /// Terminal outcomes are acknowledged to the platform and never retried.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Outcome::TransientFailure)
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Outcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "processed" => Ok(Outcome::Processed),
            "transient_failure" => Ok(Outcome::TransientFailure),
            "permanent_failure" => Ok(Outcome::PermanentFailure),
            other => Err(format!("unknown outcome '{other}'")),
        }
    }
}

/// A row of the outcome ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutcomeRecord {
    pub record_id: String,
    pub direction: Direction,
    pub outcome: Outcome,
    pub reason: Option<String>,
    pub attempt_count: u32,
    pub acknowledged: bool,
    pub updated_at: String,
}
