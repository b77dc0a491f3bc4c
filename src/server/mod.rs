//! HTTP server for the evaluation service.
//!
//! # Endpoints
//!
//! - `GET  /health`                          — Liveness and database probe
//! - `POST /api/tasks/dispatch/:job_id`      — Enqueue a job for evaluation
//! - `POST /api/long-poll/:evaluation_id`    — Long-poll a job until it finishes

pub mod middleware;
pub mod routes;

pub use middleware::ClientIdentity;
pub use routes::{app_router, ApiError, AppState};
