//! Error types for the evaluation service.

use thiserror::Error;

/// Errors surfaced by the long-polling core.
///
/// The display strings are the exact messages returned to HTTP clients, so
/// none of the variants carry internal detail in their message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PollError {
    /// A global or per-client connection cap was reached.
    #[error("Connection limit exceeded")]
    AdmissionDenied,

    /// The caller exceeded its request budget for the current window.
    #[error("Rate limit exceeded")]
    RateLimited,

    /// The job never existed, vanished mid-poll, or could not be confirmed.
    #[error("Evaluation job not found")]
    NotFound,

    /// Anything else. The payload is for server-side logs only.
    #[error("Internal server error")]
    Internal(String),
}

/// Errors from the relational job store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite error.
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// A JSON column could not be encoded or decoded.
    #[error("Database serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored value violated the schema's expectations.
    #[error("Invalid stored value: {message}")]
    InvalidData { message: String },

    /// The worker thread running the query panicked or was cancelled.
    #[error("Database task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// The addressed row does not exist.
    #[error("Record not found: {id}")]
    NotFound { id: String },
}

impl StoreError {
    /// Failures that are not a plain query error, such as a panicked query task.
    pub fn is_unexpected(&self) -> bool {
        matches!(self, StoreError::Join(_))
    }
}

/// Errors from LLM completion calls.
#[derive(Debug, Error)]
pub enum LlmError {
    /// No API key configured.
    #[error("OpenAI API key not set. Set the OPENAI_API_KEY environment variable.")]
    MissingApiKey,

    /// Transport-level failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The API answered with a non-success status.
    #[error("OpenAI API error ({status}): {body}")]
    Status { status: u16, body: String },

    /// The response body did not have the expected shape.
    #[error("Failed to parse OpenAI response: {0}")]
    Parse(String),

    /// Every retry attempt failed.
    #[error("OpenAI API call failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

/// Errors from evaluating a job against its criteria.
#[derive(Debug, Error)]
pub enum EvaluationError {
    /// The criteria document is not valid YAML of the expected shape.
    #[error("Invalid criteria document: {0}")]
    Criteria(#[from] serde_yaml::Error),

    /// The criteria document contains no criteria.
    #[error("Criteria document defines no criteria")]
    EmptyCriteria,

    /// An LLM call failed.
    #[error(transparent)]
    Llm(#[from] LlmError),
}

/// Errors from handing a job to the background processor.
#[derive(Debug, Error)]
pub enum EnqueueError {
    /// The worker pool has shut down.
    #[error("task queue is closed")]
    Closed,
}

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("OPENAI_API_KEY is not configured. Set the OPENAI_API_KEY environment variable.")]
    MissingApiKey,
}
