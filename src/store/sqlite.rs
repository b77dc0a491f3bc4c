//! SQLite-backed job store.
//!
//! rusqlite is synchronous, so every query runs on tokio's blocking pool.
//! A single connection is shared behind a mutex; this keeps `:memory:`
//! databases visible to every caller for the life of the process.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;

use super::{JobReader, JobStore};
use crate::errors::StoreError;
use crate::models::{EvaluationCriteria, EvaluationJob, JobStatus, NewJob, Timestamp};

/// Longest error message persisted on a failed job.
pub const MAX_ERROR_MESSAGE_LEN: usize = 4000;

const JOB_COLUMNS: &str = "id, evaluation_id, agent_name, version, prompt, output, status, \
                           results, error_message, created_at, updated_at, completed_at";

/// SQLite storage for evaluation criteria and jobs.
#[derive(Clone)]
pub struct SqliteJobStore {
    conn: Arc<Mutex<Connection>>,
    echo: bool,
}

impl std::fmt::Debug for SqliteJobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteJobStore")
            .field("echo", &self.echo)
            .finish_non_exhaustive()
    }
}

impl SqliteJobStore {
    /// Open (or create) the database named by `database_url` and migrate it.
    ///
    /// Accepts a bare path, `:memory:`, or a `sqlite://` URL.
    pub fn open(database_url: &str) -> Result<Self, StoreError> {
        Self::open_with_echo(database_url, false)
    }

    /// Like [`SqliteJobStore::open`], logging every statement when `echo` is set.
    pub fn open_with_echo(database_url: &str, echo: bool) -> Result<Self, StoreError> {
        let location = strip_scheme(database_url);
        let conn = if location.is_empty() || location == ":memory:" {
            Connection::open_in_memory()?
        } else {
            if let Some(parent) = Path::new(location).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| StoreError::InvalidData {
                        message: format!("cannot create database directory: {}", e),
                    })?;
                }
            }
            Connection::open(location)?
        };

        migrate(&conn)?;
        tracing::debug!("Opened SQLite job store at {}", location_label(location));

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            echo,
        })
    }

    /// Remove a job. Used by maintenance paths and tests.
    pub async fn delete_job(&self, id: &str) -> Result<bool, StoreError> {
        let id = id.to_string();
        let echo = self.echo;
        self.run(move |conn| {
            let sql = "DELETE FROM evaluation_job WHERE id = ?1";
            log_sql(echo, sql);
            Ok(conn.execute(sql, params![id])? > 0)
        })
        .await
    }

    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock();
            f(&guard)
        })
        .await?
    }

    async fn update_status(
        &self,
        id: &str,
        status: JobStatus,
        results: Option<Value>,
        error_message: Option<String>,
        completed: bool,
    ) -> Result<(), StoreError> {
        let id = id.to_string();
        let echo = self.echo;
        let results = results.map(|v| serde_json::to_string(&v)).transpose()?;

        self.run(move |conn| {
            let now = Utc::now().to_rfc3339();
            let completed_at = completed.then(|| now.clone());
            let sql = "UPDATE evaluation_job
                       SET status = ?2,
                           results = COALESCE(?3, results),
                           error_message = COALESCE(?4, error_message),
                           completed_at = COALESCE(?5, completed_at),
                           updated_at = ?6
                       WHERE id = ?1";
            log_sql(echo, sql);
            let changed = conn.execute(
                sql,
                params![id, status.as_str(), results, error_message, completed_at, now],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound { id });
            }
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl JobReader for SqliteJobStore {
    async fn read(&self, id: &str) -> Result<Option<EvaluationJob>, StoreError> {
        let id = id.to_string();
        let echo = self.echo;
        self.run(move |conn| {
            let sql = format!("SELECT {} FROM evaluation_job WHERE id = ?1", JOB_COLUMNS);
            log_sql(echo, &sql);
            let row = conn
                .query_row(&sql, params![id], JobRow::from_row)
                .optional()?;
            row.map(JobRow::into_job).transpose()
        })
        .await
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn insert_criteria(
        &self,
        agent_name: &str,
        version: i64,
        criteria_yaml: &str,
    ) -> Result<EvaluationCriteria, StoreError> {
        let criteria = EvaluationCriteria {
            id: uuid::Uuid::new_v4().to_string(),
            agent_name: agent_name.to_string(),
            version,
            criteria_yaml: criteria_yaml.to_string(),
            created_at: Some(Timestamp::from(Utc::now())),
        };
        let echo = self.echo;
        let row = criteria.clone();

        self.run(move |conn| {
            let sql = "INSERT INTO evaluation_criteria (id, agent_name, version, criteria_yaml, created_at)
                       VALUES (?1, ?2, ?3, ?4, ?5)";
            log_sql(echo, sql);
            conn.execute(
                sql,
                params![
                    row.id,
                    row.agent_name,
                    row.version,
                    row.criteria_yaml,
                    row.created_at.as_ref().map(Timestamp::to_iso_string),
                ],
            )?;
            Ok(())
        })
        .await?;

        Ok(criteria)
    }

    async fn load_criteria(&self, id: &str) -> Result<Option<EvaluationCriteria>, StoreError> {
        let id = id.to_string();
        let echo = self.echo;
        self.run(move |conn| {
            let sql = "SELECT id, agent_name, version, criteria_yaml, created_at
                       FROM evaluation_criteria WHERE id = ?1";
            log_sql(echo, sql);
            let criteria = conn
                .query_row(sql, params![id], |row| {
                    let created_at: Option<String> = row.get(4)?;
                    Ok(EvaluationCriteria {
                        id: row.get(0)?,
                        agent_name: row.get(1)?,
                        version: row.get(2)?,
                        criteria_yaml: row.get(3)?,
                        created_at: created_at.as_deref().map(Timestamp::parse),
                    })
                })
                .optional()?;
            Ok(criteria)
        })
        .await
    }

    async fn insert_job(&self, job: NewJob) -> Result<EvaluationJob, StoreError> {
        let id = job
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let results = job.results.as_ref().map(serde_json::to_string).transpose()?;
        let echo = self.echo;
        let insert_id = id.clone();

        self.run(move |conn| {
            let now = Utc::now().to_rfc3339();
            let sql = "INSERT INTO evaluation_job
                       (id, evaluation_id, agent_name, version, prompt, output, status, results,
                        created_at, updated_at)
                       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)";
            log_sql(echo, sql);
            conn.execute(
                sql,
                params![
                    insert_id,
                    job.evaluation_id,
                    job.agent_name,
                    job.version,
                    job.prompt,
                    job.output,
                    job.status.as_str(),
                    results,
                    now,
                ],
            )?;
            Ok(())
        })
        .await?;

        self.read(&id)
            .await?
            .ok_or(StoreError::NotFound { id })
    }

    async fn mark_in_progress(&self, id: &str) -> Result<(), StoreError> {
        self.update_status(id, JobStatus::InProgress, None, None, false)
            .await
    }

    async fn mark_completed(&self, id: &str, results: Value) -> Result<(), StoreError> {
        self.update_status(id, JobStatus::Completed, Some(results), None, true)
            .await
    }

    async fn mark_failed(&self, id: &str, error_message: &str) -> Result<(), StoreError> {
        let message = truncate(error_message, MAX_ERROR_MESSAGE_LEN);
        self.update_status(id, JobStatus::Failed, None, Some(message), false)
            .await
    }

    async fn ping(&self) -> Result<(), StoreError> {
        self.run(|conn| {
            conn.query_row("SELECT 1", [], |row| row.get::<_, i64>(0))?;
            Ok(())
        })
        .await
    }
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

fn migrate(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;

         CREATE TABLE IF NOT EXISTS evaluation_criteria (
             id TEXT PRIMARY KEY NOT NULL,
             agent_name TEXT NOT NULL,
             version INTEGER NOT NULL,
             criteria_yaml TEXT NOT NULL,
             created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
             CONSTRAINT uq_criteria_agent_version UNIQUE (agent_name, version)
         );

         CREATE INDEX IF NOT EXISTS ix_evaluation_criteria_agent_name
             ON evaluation_criteria (agent_name);

         CREATE TABLE IF NOT EXISTS evaluation_job (
             id TEXT PRIMARY KEY NOT NULL,
             evaluation_id TEXT NOT NULL
                 REFERENCES evaluation_criteria (id) ON DELETE CASCADE,
             agent_name TEXT NOT NULL,
             version INTEGER NOT NULL,
             prompt TEXT NOT NULL,
             output TEXT,
             status TEXT NOT NULL DEFAULT 'pending'
                 CONSTRAINT ck_evaluation_job_status
                 CHECK (status IN ('pending', 'in_progress', 'completed', 'failed')),
             results TEXT,
             error_message TEXT,
             created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
             updated_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
             completed_at TEXT
         );

         CREATE INDEX IF NOT EXISTS ix_evaluation_job_evaluation_id
             ON evaluation_job (evaluation_id);
         CREATE INDEX IF NOT EXISTS ix_evaluation_job_agent_version
             ON evaluation_job (agent_name, version);
         CREATE INDEX IF NOT EXISTS ix_evaluation_job_status
             ON evaluation_job (status);",
    )?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

struct JobRow {
    id: String,
    evaluation_id: String,
    agent_name: String,
    version: i64,
    prompt: String,
    output: Option<String>,
    status: String,
    results: Option<String>,
    error_message: Option<String>,
    created_at: Option<String>,
    updated_at: Option<String>,
    completed_at: Option<String>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            evaluation_id: row.get(1)?,
            agent_name: row.get(2)?,
            version: row.get(3)?,
            prompt: row.get(4)?,
            output: row.get(5)?,
            status: row.get(6)?,
            results: row.get(7)?,
            error_message: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
            completed_at: row.get(11)?,
        })
    }

    fn into_job(self) -> Result<EvaluationJob, StoreError> {
        let status = self
            .status
            .parse::<JobStatus>()
            .map_err(|message| StoreError::InvalidData { message })?;
        let results = self
            .results
            .as_deref()
            .map(serde_json::from_str::<Value>)
            .transpose()?;

        Ok(EvaluationJob {
            id: self.id,
            evaluation_id: self.evaluation_id,
            agent_name: self.agent_name,
            version: self.version,
            prompt: self.prompt,
            output: self.output,
            status,
            results,
            error_message: self.error_message,
            created_at: self.created_at.as_deref().map(Timestamp::parse),
            updated_at: self.updated_at.as_deref().map(Timestamp::parse),
            completed_at: self.completed_at.as_deref().map(Timestamp::parse),
        })
    }
}

fn strip_scheme(database_url: &str) -> &str {
    database_url
        .strip_prefix("sqlite:///")
        .or_else(|| database_url.strip_prefix("sqlite://"))
        .unwrap_or(database_url)
}

fn location_label(location: &str) -> &str {
    if location.is_empty() {
        ":memory:"
    } else {
        location
    }
}

fn log_sql(echo: bool, sql: &str) {
    if echo {
        tracing::debug!(target: "nta_eval::sql", "{}", sql);
    }
}

fn truncate(message: &str, max_chars: usize) -> String {
    message.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn store_with_criteria() -> (SqliteJobStore, EvaluationCriteria) {
        let store = SqliteJobStore::open(":memory:").unwrap();
        let criteria = store
            .insert_criteria("agent-a", 1, "criteria:\n  - name: x\n    method: score\n")
            .await
            .unwrap();
        (store, criteria)
    }

    #[tokio::test]
    async fn test_insert_and_read_job() {
        let (store, criteria) = store_with_criteria().await;
        let job = store
            .insert_job(NewJob::for_criteria(&criteria, "p").with_output("hello"))
            .await
            .unwrap();

        let read = store.read(&job.id).await.unwrap().unwrap();
        assert_eq!(read.status, JobStatus::Pending);
        assert_eq!(read.output.as_deref(), Some("hello"));
        assert_eq!(read.evaluation_id, criteria.id);
        assert!(read.created_at.unwrap().as_datetime().is_some());
        assert!(read.completed_at.is_none());
    }

    #[tokio::test]
    async fn test_read_missing_returns_none() {
        let store = SqliteJobStore::open("sqlite:///:memory:").unwrap();
        assert!(store.read("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_status_transitions_are_visible_to_next_read() {
        let (store, criteria) = store_with_criteria().await;
        let job = store
            .insert_job(NewJob::for_criteria(&criteria, "p").with_id("job-1"))
            .await
            .unwrap();

        store.mark_in_progress(&job.id).await.unwrap();
        assert_eq!(
            store.read("job-1").await.unwrap().unwrap().status,
            JobStatus::InProgress
        );

        store.mark_completed("job-1", json!({"a": 1})).await.unwrap();
        let done = store.read("job-1").await.unwrap().unwrap();
        assert_eq!(done.status, JobStatus::Completed);
        assert_eq!(done.results, Some(json!({"a": 1})));
        assert!(done.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_failed_message_is_truncated() {
        let (store, criteria) = store_with_criteria().await;
        let job = store
            .insert_job(NewJob::for_criteria(&criteria, "p"))
            .await
            .unwrap();

        let long = "e".repeat(MAX_ERROR_MESSAGE_LEN + 50);
        store.mark_failed(&job.id, &long).await.unwrap();

        let failed = store.read(&job.id).await.unwrap().unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(
            failed.error_message.unwrap().len(),
            MAX_ERROR_MESSAGE_LEN
        );
    }

    #[tokio::test]
    async fn test_update_missing_job_is_not_found() {
        let store = SqliteJobStore::open(":memory:").unwrap();
        let err = store.mark_in_progress("nope").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_duplicate_criteria_version_rejected() {
        let (store, _) = store_with_criteria().await;
        let err = store.insert_criteria("agent-a", 1, "criteria: []").await;
        assert!(matches!(err, Err(StoreError::Sqlite(_))));
    }

    #[tokio::test]
    async fn test_job_requires_existing_criteria() {
        let store = SqliteJobStore::open(":memory:").unwrap();
        let orphan = NewJob {
            evaluation_id: "missing".to_string(),
            agent_name: "a".to_string(),
            version: 1,
            prompt: "p".to_string(),
            ..Default::default()
        };
        assert!(store.insert_job(orphan).await.is_err());
    }

    #[tokio::test]
    async fn test_file_backed_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("eval.db");
        let url = path.to_string_lossy().to_string();

        let job_id = {
            let store = SqliteJobStore::open(&url).unwrap();
            let criteria = store.insert_criteria("agent", 1, "x").await.unwrap();
            store
                .insert_job(NewJob::for_criteria(&criteria, "p"))
                .await
                .unwrap()
                .id
        };

        let reopened = SqliteJobStore::open(&url).unwrap();
        assert!(reopened.read(&job_id).await.unwrap().is_some());
        reopened.ping().await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_job() {
        let (store, criteria) = store_with_criteria().await;
        let job = store
            .insert_job(NewJob::for_criteria(&criteria, "p"))
            .await
            .unwrap();
        assert!(store.delete_job(&job.id).await.unwrap());
        assert!(!store.delete_job(&job.id).await.unwrap());
        assert!(store.read(&job.id).await.unwrap().is_none());
    }

    #[test]
    fn test_strip_scheme() {
        assert_eq!(strip_scheme("sqlite:///:memory:"), ":memory:");
        assert_eq!(strip_scheme("sqlite://data/x.db"), "data/x.db");
        assert_eq!(strip_scheme("/tmp/x.db"), "/tmp/x.db");
    }
}
