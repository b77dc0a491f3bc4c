//! Long-polling coordination core.
//!
//! - [`rate_limiter`]: per-key sliding-window request counting
//! - [`connection_manager`]: global and per-client caps on active polls
//! - [`service`]: the poll loop that re-reads job state until done or timed out
//! - [`facade`]: the rate limiter and poll loop composed behind one handle

pub mod connection_manager;
pub mod facade;
pub mod rate_limiter;
pub mod service;

pub use connection_manager::{ConnectionGuard, ConnectionKey, ConnectionManager};
pub use facade::PollingFacade;
pub use rate_limiter::RateLimiter;
pub use service::{adaptive_interval, JobResult, LongPollingService, PollOutcome};
