//! Axum route handlers for the evaluation service.
//!
//! # Routes
//!
//! - `GET  /health`                          — Liveness and database probe
//! - `POST /api/tasks/dispatch/:job_id`      — Hand a job to the worker pool
//! - `POST /api/long-poll/:evaluation_id`    — Wait for a job to finish (`?timeout=N`)

use std::any::Any;
use std::sync::Arc;

use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::middleware::{rate_limit, ClientIdentity};
use crate::config::Config;
use crate::errors::PollError;
use crate::polling::{PollOutcome, PollingFacade};
use crate::store::JobStore;
use crate::workers::TaskEnqueuer;

/// Shared application state for the HTTP server.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn JobStore>,
    /// Rate limiter, connection admission and poll loop.
    pub polling: Arc<PollingFacade>,
    pub enqueuer: Arc<dyn TaskEnqueuer>,
}

impl AppState {
    pub fn new<S>(config: Config, store: Arc<S>, enqueuer: Arc<dyn TaskEnqueuer>) -> Self
    where
        S: JobStore + 'static,
    {
        let polling = Arc::new(PollingFacade::from_config(store.clone(), &config));
        Self {
            config: Arc::new(config),
            store,
            polling,
            enqueuer,
        }
    }
}

/// Build the axum router with all routes.
pub fn app_router(state: AppState) -> Router {
    let long_poll = Router::new()
        .route("/api/long-poll/:evaluation_id", post(long_poll_handler))
        .route_layer(middleware::from_fn_with_state(state.clone(), rate_limit));

    Router::new()
        .route("/health", get(health_handler))
        .route("/api/tasks/dispatch/:job_id", post(dispatch_handler))
        .merge(long_poll)
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Error responses. Bodies are `{"detail": "<message>"}` and never carry
/// internal error text.
#[derive(Debug)]
pub enum ApiError {
    Poll(PollError),
    InvalidTimeout,
    EnqueueFailed,
}

impl From<PollError> for ApiError {
    fn from(e: PollError) -> Self {
        ApiError::Poll(e)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Poll(PollError::NotFound) => StatusCode::NOT_FOUND,
            ApiError::Poll(PollError::AdmissionDenied | PollError::RateLimited) => {
                StatusCode::TOO_MANY_REQUESTS
            }
            ApiError::Poll(PollError::Internal(_)) | ApiError::EnqueueFailed => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::InvalidTimeout => StatusCode::UNPROCESSABLE_ENTITY,
        }
    }

    fn detail(&self) -> String {
        match self {
            ApiError::Poll(e) => e.to_string(),
            ApiError::InvalidTimeout => "timeout must be a positive integer".to_string(),
            ApiError::EnqueueFailed => "failed to enqueue task".to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::Poll(PollError::Internal(context)) = &self {
            tracing::error!("Unexpected error: {}", context);
        }
        (self.status(), Json(json!({ "detail": self.detail() }))).into_response()
    }
}

/// Turn a handler panic into the generic 500 response.
fn handle_panic(panic: Box<dyn Any + Send + 'static>) -> Response {
    let message = if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic payload".to_string()
    };
    ApiError::from(PollError::Internal(format!("handler panicked: {}", message))).into_response()
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// GET /health — liveness probe plus a database round trip.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let database = match state.store.ping().await {
        Ok(()) => "ok",
        Err(e) => {
            tracing::error!("Database health check failed: {}", e);
            "unavailable"
        }
    };
    let (status, summary) = if database == "ok" {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "degraded")
    };

    (
        status,
        Json(json!({
            "status": summary,
            "version": crate::VERSION,
            "service": "nta-eval",
            "environment": state.config.app_env,
            "database": database,
        })),
    )
}

/// POST /api/tasks/dispatch/:job_id — fire-and-forget evaluation trigger.
async fn dispatch_handler(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.enqueuer.enqueue(&job_id).map_err(|e| {
        tracing::error!("Failed to enqueue job {}: {}", job_id, e);
        ApiError::EnqueueFailed
    })?;

    Ok(Json(json!({ "enqueued": true, "job_id": job_id })))
}

#[derive(Debug, Deserialize)]
struct LongPollQuery {
    timeout: Option<u64>,
}

/// POST /api/long-poll/:evaluation_id — block until the job is terminal or
/// the timeout elapses.
async fn long_poll_handler(
    State(state): State<AppState>,
    Path(evaluation_id): Path<String>,
    query: Result<Query<LongPollQuery>, QueryRejection>,
    Extension(identity): Extension<ClientIdentity>,
) -> Result<Json<PollOutcome>, ApiError> {
    let Query(query) = query.map_err(|e| {
        tracing::debug!("Rejected long-poll query for {}: {}", evaluation_id, e);
        ApiError::InvalidTimeout
    })?;
    if query.timeout == Some(0) {
        return Err(ApiError::InvalidTimeout);
    }

    let outcome = state
        .polling
        .poll(&evaluation_id, query.timeout, &identity.ip)
        .await?;
    Ok(Json(outcome))
}
