//! Process-wide polling coordinator.
//!
//! Built once at startup and shared by every request. The transport layer
//! calls [`PollingFacade::check`] before it calls [`PollingFacade::poll`].

use std::sync::Arc;

use super::connection_manager::ConnectionManager;
use super::rate_limiter::RateLimiter;
use super::service::{LongPollingService, PollOutcome};
use crate::config::Config;
use crate::errors::PollError;
use crate::store::JobReader;

/// Rate limiting plus admission-controlled long polling.
#[derive(Debug)]
pub struct PollingFacade {
    limiter: RateLimiter,
    service: LongPollingService,
}

impl PollingFacade {
    pub fn new(limiter: RateLimiter, service: LongPollingService) -> Self {
        Self { limiter, service }
    }

    /// Wire the limiter, connection manager and poll loop from configuration.
    pub fn from_config(reader: Arc<dyn JobReader>, config: &Config) -> Self {
        let settings = config.polling_settings();
        let connections = Arc::new(ConnectionManager::from_settings(&settings));
        Self::new(
            RateLimiter::new(config.rate_limit_settings()),
            LongPollingService::new(reader, connections, settings),
        )
    }

    /// Count one request against `rate_key`'s window.
    pub fn check(&self, rate_key: &str) -> Result<(), PollError> {
        if self.limiter.check(rate_key) {
            Ok(())
        } else {
            Err(PollError::RateLimited)
        }
    }

    /// Long-poll `evaluation_id` on behalf of `client_ip`.
    ///
    /// `timeout` falls back to the configured default when absent or zero.
    pub async fn poll(
        &self,
        evaluation_id: &str,
        timeout: Option<u64>,
        client_ip: &str,
    ) -> Result<PollOutcome, PollError> {
        let timeout = self.resolve_timeout(timeout);
        self.service
            .poll_for_results(evaluation_id, timeout, client_ip)
            .await
    }

    pub fn resolve_timeout(&self, timeout: Option<u64>) -> u64 {
        timeout
            .filter(|t| *t > 0)
            .unwrap_or(self.service.settings().default_timeout)
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        self.service.connections()
    }
}
