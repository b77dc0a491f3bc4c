//! Evaluation criteria and job records.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Job status
// ---------------------------------------------------------------------------

/// Lifecycle state of an evaluation job.
///
/// Once a job reaches a terminal state it never returns to a non-terminal one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl JobStatus {
    /// All statuses accepted by the store's CHECK constraint.
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::InProgress,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    /// Whether no further transition can occur.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl Default for JobStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown job status '{}'", s))
    }
}

// ---------------------------------------------------------------------------
// Stored timestamps
// ---------------------------------------------------------------------------

/// A timestamp column as read from the store.
///
/// Values written by this service are RFC 3339; values written by SQLite
/// defaults use `YYYY-MM-DD HH:MM:SS`. Anything else is kept verbatim so that
/// readers can still render it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Timestamp {
    Parsed(DateTime<Utc>),
    Raw(String),
}

impl Timestamp {
    /// Interpret a stored column value.
    pub fn parse(raw: &str) -> Self {
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Timestamp::Parsed(dt.with_timezone(&Utc));
        }
        for format in ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"] {
            if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
                return Timestamp::Parsed(naive.and_utc());
            }
        }
        Timestamp::Raw(raw.to_string())
    }

    /// The parsed instant, if the stored value was well formed.
    pub fn as_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            Timestamp::Parsed(dt) => Some(*dt),
            Timestamp::Raw(_) => None,
        }
    }

    /// ISO-8601 rendering, falling back to the stored text.
    pub fn to_iso_string(&self) -> String {
        match self {
            Timestamp::Parsed(dt) => dt.to_rfc3339(),
            Timestamp::Raw(raw) => raw.clone(),
        }
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Timestamp::Parsed(dt)
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A versioned YAML criteria document for one agent.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationCriteria {
    pub id: String,
    pub agent_name: String,
    pub version: i64,
    pub criteria_yaml: String,
    pub created_at: Option<Timestamp>,
}

/// One evaluation of an agent output against a criteria document.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationJob {
    pub id: String,
    /// Id of the [`EvaluationCriteria`] this job evaluates against.
    pub evaluation_id: String,
    pub agent_name: String,
    pub version: i64,
    pub prompt: String,
    /// The agent output under evaluation.
    pub output: Option<String>,
    pub status: JobStatus,
    pub results: Option<Value>,
    pub error_message: Option<String>,
    pub created_at: Option<Timestamp>,
    pub updated_at: Option<Timestamp>,
    pub completed_at: Option<Timestamp>,
}

/// Insert payload for a new evaluation job.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewJob {
    /// Explicit id; a UUID is generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    pub evaluation_id: String,
    pub agent_name: String,
    pub version: i64,
    pub prompt: String,
    #[serde(default)]
    pub output: Option<String>,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default)]
    pub results: Option<Value>,
}

impl NewJob {
    /// A pending job for the given criteria row.
    pub fn for_criteria(criteria: &EvaluationCriteria, prompt: impl Into<String>) -> Self {
        Self {
            id: None,
            evaluation_id: criteria.id.clone(),
            agent_name: criteria.agent_name.clone(),
            version: criteria.version,
            prompt: prompt.into(),
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_results(mut self, results: Value) -> Self {
        self.results = Some(results);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::InProgress.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
    }

    #[test]
    fn test_status_string_forms() {
        for status in JobStatus::ALL {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert_eq!(
            serde_json::to_value(JobStatus::InProgress).unwrap(),
            serde_json::json!("in_progress")
        );
        assert!("done".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_timestamp_parsing() {
        let rfc = Timestamp::parse("2024-05-01T12:30:00+00:00");
        assert!(rfc.as_datetime().is_some());

        let sqlite_default = Timestamp::parse("2024-05-01 12:30:00");
        assert_eq!(sqlite_default.as_datetime(), rfc.as_datetime());

        let garbage = Timestamp::parse("yesterday-ish");
        assert!(garbage.as_datetime().is_none());
        assert_eq!(garbage.to_iso_string(), "yesterday-ish");
    }
}
