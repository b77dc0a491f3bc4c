//! Relational storage for evaluation criteria and jobs.
//!
//! The long-polling core only depends on [`JobReader`]; the background
//! processor and the HTTP layer use the wider [`JobStore`].

pub mod sqlite;

use async_trait::async_trait;
use serde_json::Value;

use crate::errors::StoreError;
use crate::models::{EvaluationCriteria, EvaluationJob, NewJob};

pub use sqlite::SqliteJobStore;

/// Read access to the current state of a job.
///
/// Implementations must return the latest committed write on every call;
/// no caching is allowed in front of this trait.
#[async_trait]
pub trait JobReader: Send + Sync {
    async fn read(&self, id: &str) -> Result<Option<EvaluationJob>, StoreError>;
}

/// Full job and criteria persistence.
#[async_trait]
pub trait JobStore: JobReader {
    async fn insert_criteria(
        &self,
        agent_name: &str,
        version: i64,
        criteria_yaml: &str,
    ) -> Result<EvaluationCriteria, StoreError>;

    async fn load_criteria(&self, id: &str) -> Result<Option<EvaluationCriteria>, StoreError>;

    async fn insert_job(&self, job: NewJob) -> Result<EvaluationJob, StoreError>;

    async fn mark_in_progress(&self, id: &str) -> Result<(), StoreError>;

    /// Record a successful evaluation and stamp `completed_at`.
    async fn mark_completed(&self, id: &str, results: Value) -> Result<(), StoreError>;

    async fn mark_failed(&self, id: &str, error_message: &str) -> Result<(), StoreError>;

    /// Trivial round trip used by the health endpoint.
    async fn ping(&self) -> Result<(), StoreError>;
}
