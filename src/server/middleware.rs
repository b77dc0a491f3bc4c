//! Caller identity and rate limiting for the long-poll routes.

use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{Extensions, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};

use super::routes::{ApiError, AppState};

/// Header carrying the client chain when running behind a proxy.
pub const FORWARDED_FOR_HEADER: &str = "x-forwarded-for";
/// Header that namespaces the rate-limit key, used to isolate test runs.
pub const TEST_RUN_HEADER: &str = "x-test-run-id";

/// Who is calling, as far as rate limiting and admission are concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientIdentity {
    /// Client address; keys connection admission.
    pub ip: String,
    /// Optional namespace from [`TEST_RUN_HEADER`].
    pub run_id: Option<String>,
}

impl ClientIdentity {
    /// First `x-forwarded-for` entry, else the peer address, else `"unknown"`.
    pub fn from_parts(headers: &HeaderMap, extensions: &Extensions) -> Self {
        let forwarded = headers
            .get(FORWARDED_FOR_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        let ip = forwarded
            .or_else(|| {
                extensions
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(addr)| addr.ip().to_string())
            })
            .unwrap_or_else(|| "unknown".to_string());

        let run_id = headers
            .get(TEST_RUN_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        Self { ip, run_id }
    }

    /// Key counted by the rate limiter: `"<run-id>:<ip>"` or just the ip.
    pub fn rate_limit_key(&self) -> String {
        match &self.run_id {
            Some(run_id) => format!("{}:{}", run_id, self.ip),
            None => self.ip.clone(),
        }
    }
}

/// Reject callers over their request budget; otherwise attach their
/// [`ClientIdentity`] to the request for the handler.
pub async fn rate_limit(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let identity = ClientIdentity::from_parts(request.headers(), request.extensions());

    if let Err(e) = state.polling.check(&identity.rate_limit_key()) {
        tracing::warn!("Rate limit exceeded for {}", identity.rate_limit_key());
        return ApiError::from(e).into_response();
    }

    request.extensions_mut().insert(identity);
    next.run(request).await
}
