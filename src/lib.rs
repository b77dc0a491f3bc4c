//! # nta-eval
//!
//! Evaluates agent outputs against YAML-defined criteria with an LLM, stores
//! job state in SQLite, and lets clients wait for results over HTTP long
//! polling.
//!
//! The long-polling core lives in [`polling`]: a per-client sliding-window
//! [`RateLimiter`], a [`ConnectionManager`] enforcing global and per-client
//! caps on active polls, and the poll loop that re-reads job state until it
//! is terminal or the timeout elapses.

pub mod config;
pub mod errors;
pub mod evaluator;
pub mod models;
pub mod polling;
pub mod server;
pub mod store;
pub mod workers;

pub use config::Config;
pub use errors::{PollError, StoreError};
pub use models::{EvaluationJob, JobStatus};
pub use polling::{ConnectionManager, PollOutcome, PollingFacade, RateLimiter};
pub use store::{JobReader, JobStore, SqliteJobStore};
pub use workers::{TaskEnqueuer, WorkerPool};

/// Crate version reported by the health endpoint.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
