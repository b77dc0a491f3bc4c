//! The long-poll loop.
//!
//! A poll holds one admission slot for its whole lifetime and re-reads the
//! job from the store on every iteration until the job reaches a terminal
//! status or the timeout elapses. Each read goes to the store; nothing is
//! cached between iterations, so writes committed by a background worker
//! become visible within one poll interval.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::Value;
use tokio::time::Instant;

use super::connection_manager::ConnectionManager;
use crate::config::PollingSettings;
use crate::errors::{PollError, StoreError};
use crate::models::{EvaluationJob, JobStatus, Timestamp};
use crate::store::JobReader;

// ---------------------------------------------------------------------------
// Outcome
// ---------------------------------------------------------------------------

/// Fields returned once a job reaches a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobResult {
    pub id: String,
    pub status: JobStatus,
    pub results: Option<Value>,
    pub error_message: Option<String>,
    /// ISO-8601 when the stored value parses, the stored text otherwise.
    pub completed_at: Option<String>,
}

impl From<EvaluationJob> for JobResult {
    fn from(job: EvaluationJob) -> Self {
        Self {
            id: job.id,
            status: job.status,
            results: job.results,
            error_message: job.error_message,
            completed_at: job.completed_at.as_ref().map(Timestamp::to_iso_string),
        }
    }
}

/// Result of one long poll that did not fail.
///
/// Serializes to `{"status": "timeout"}` or to the [`JobResult`] fields.
#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Timeout,
    Finished(JobResult),
}

impl PollOutcome {
    pub fn is_timeout(&self) -> bool {
        matches!(self, PollOutcome::Timeout)
    }
}

impl Serialize for PollOutcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PollOutcome::Timeout => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("status", "timeout")?;
                map.end()
            }
            PollOutcome::Finished(result) => result.serialize(serializer),
        }
    }
}

// ---------------------------------------------------------------------------
// Adaptive cadence
// ---------------------------------------------------------------------------

/// Sleep before the next re-read.
///
/// Far from the deadline this is the configured interval; closer in it is a
/// quarter of the remaining budget, never below `floor`.
pub fn adaptive_interval(poll_interval: Duration, floor: Duration, remaining_secs: f64) -> Duration {
    let quarter = if remaining_secs.is_finite() && remaining_secs > 0.0 {
        Duration::from_secs_f64(remaining_secs / 4.0)
    } else {
        Duration::ZERO
    };
    poll_interval.min(floor.max(quarter))
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Long polling for evaluation job results.
#[derive(Clone)]
pub struct LongPollingService {
    reader: Arc<dyn JobReader>,
    connections: Arc<ConnectionManager>,
    settings: PollingSettings,
}

impl std::fmt::Debug for LongPollingService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LongPollingService")
            .field("connections", &self.connections)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl LongPollingService {
    pub fn new(
        reader: Arc<dyn JobReader>,
        connections: Arc<ConnectionManager>,
        settings: PollingSettings,
    ) -> Self {
        Self {
            reader,
            connections,
            settings,
        }
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn settings(&self) -> &PollingSettings {
        &self.settings
    }

    /// Wait until `evaluation_id` is terminal or `timeout_seconds` elapse.
    ///
    /// The timeout is measured from the job's `created_at`, with the loop's
    /// own running time as a second bound. Store failures inside the loop
    /// end the poll as a timeout; a failure on the initial lookup is
    /// reported as not found.
    pub async fn poll_for_results(
        &self,
        evaluation_id: &str,
        timeout_seconds: u64,
        client_ip: &str,
    ) -> Result<PollOutcome, PollError> {
        let _slot = self.connections.admit(client_ip, evaluation_id)?;

        let job = match self.reader.read(evaluation_id).await {
            Ok(Some(job)) => job,
            Ok(None) => return Err(PollError::NotFound),
            Err(e) if e.is_unexpected() => return Err(unexpected(evaluation_id, &e)),
            Err(e) => {
                tracing::error!("Initial lookup of job {} failed: {}", evaluation_id, e);
                return Err(PollError::NotFound);
            }
        };

        let created_at = job
            .created_at
            .as_ref()
            .and_then(Timestamp::as_datetime)
            .unwrap_or_else(Utc::now);
        let timeout = timeout_seconds as f64;
        let loop_started = Instant::now();

        loop {
            let remaining = timeout - seconds_since(created_at);
            if remaining <= 0.0 || loop_started.elapsed().as_secs_f64() > timeout {
                tracing::debug!(
                    "Long poll timeout for {} (remaining={:.3}s)",
                    evaluation_id,
                    remaining
                );
                return Ok(PollOutcome::Timeout);
            }

            let job = match self.reader.read(evaluation_id).await {
                Ok(Some(job)) => job,
                Ok(None) => return Err(PollError::NotFound),
                Err(e) if e.is_unexpected() => return Err(unexpected(evaluation_id, &e)),
                Err(e) => {
                    tracing::error!("Re-reading job {} failed: {}", evaluation_id, e);
                    return Ok(PollOutcome::Timeout);
                }
            };

            if job.status.is_terminal() {
                return Ok(PollOutcome::Finished(JobResult::from(job)));
            }

            let sleep_for = adaptive_interval(
                self.settings.poll_interval,
                self.settings.min_poll_interval,
                remaining,
            );
            tokio::time::sleep(sleep_for).await;
        }
    }
}

fn unexpected(evaluation_id: &str, e: &StoreError) -> PollError {
    tracing::error!("Unexpected store failure while polling {}: {}", evaluation_id, e);
    PollError::Internal(format!("polling {}: {}", evaluation_id, e))
}

fn seconds_since(instant: DateTime<Utc>) -> f64 {
    Utc::now()
        .signed_duration_since(instant)
        .num_milliseconds() as f64
        / 1000.0
}
