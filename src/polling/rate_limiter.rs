//! Sliding-window request limiter.
//!
//! Each key keeps a time-ordered queue of request instants. On every check
//! the entries that fell out of `now - window` are dropped from the front, so
//! the eligibility boundary moves with every call instead of resetting on
//! fixed bucket edges.
//!
//! Keys are never evicted from the outer map; only their queues drain. Memory
//! therefore grows with the number of distinct keys seen by the process.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tokio::time::Instant;

use crate::config::RateLimitSettings;

/// Per-key sliding-window rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    settings: RateLimitSettings,
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self {
            settings,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> RateLimitSettings {
        self.settings
    }

    /// Record a request for `key` if it fits in the window.
    ///
    /// Returns `false` when the key already used its budget; a denied request
    /// is not recorded.
    pub fn check(&self, key: &str) -> bool {
        self.check_at(key, Instant::now())
    }

    /// [`RateLimiter::check`] against an explicit clock reading.
    pub fn check_at(&self, key: &str, now: Instant) -> bool {
        let mut windows = match self.windows.lock() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::error!("Rate limiter state poisoned; denying request for {}", key);
                return false;
            }
        };

        let window = windows.entry(key.to_string()).or_default();
        if let Some(boundary) = now.checked_sub(self.settings.window) {
            while window.front().is_some_and(|ts| *ts <= boundary) {
                window.pop_front();
            }
        }

        if window.len() >= self.settings.max_requests {
            tracing::warn!(
                "Rate limit exceeded for {} ({} requests in {:?})",
                key,
                window.len(),
                self.settings.window
            );
            return false;
        }

        window.push_back(now);
        true
    }

    /// Requests currently recorded for `key`, without pruning.
    pub fn recorded(&self, key: &str) -> usize {
        self.windows
            .lock()
            .map(|w| w.get(key).map_or(0, VecDeque::len))
            .unwrap_or(0)
    }

    /// Number of distinct keys ever seen.
    pub fn tracked_keys(&self) -> usize {
        self.windows.lock().map(|w| w.len()).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn limiter(window_secs: u64, max_requests: usize) -> RateLimiter {
        RateLimiter::new(RateLimitSettings {
            window: Duration::from_secs(window_secs),
            max_requests,
        })
    }

    #[test]
    fn test_requests_within_limit_pass() {
        let limiter = limiter(60, 3);
        let now = Instant::now();
        assert!(limiter.check_at("127.0.0.1", now));
        assert!(limiter.check_at("127.0.0.1", now));
        assert!(limiter.check_at("127.0.0.1", now));
    }

    #[test]
    fn test_requests_exceeding_limit_are_denied() {
        let limiter = limiter(60, 2);
        let now = Instant::now();
        assert!(limiter.check_at("10.0.0.1", now));
        assert!(limiter.check_at("10.0.0.1", now + Duration::from_secs(1)));
        assert!(!limiter.check_at("10.0.0.1", now + Duration::from_secs(2)));
        // Denied requests are not recorded.
        assert_eq!(limiter.recorded("10.0.0.1"), 2);
    }

    #[test]
    fn test_window_expiry_allows_again() {
        let limiter = limiter(60, 2);
        let start = Instant::now();
        assert!(limiter.check_at("k", start));
        assert!(limiter.check_at("k", start));
        assert!(!limiter.check_at("k", start + Duration::from_secs(30)));

        assert!(limiter.check_at("k", start + Duration::from_secs(61)));
        assert_eq!(limiter.recorded("k"), 1);
    }

    #[test]
    fn test_window_slides_per_request() {
        let limiter = limiter(10, 2);
        let start = Instant::now();
        assert!(limiter.check_at("k", start));
        assert!(limiter.check_at("k", start + Duration::from_secs(6)));
        // The first request has left the window, the second has not.
        assert!(limiter.check_at("k", start + Duration::from_secs(11)));
        assert!(!limiter.check_at("k", start + Duration::from_secs(12)));
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = limiter(60, 1);
        let now = Instant::now();
        assert!(limiter.check_at("run-a:1.1.1.1", now));
        assert!(!limiter.check_at("run-a:1.1.1.1", now));
        assert!(limiter.check_at("run-b:1.1.1.1", now));
        assert_eq!(limiter.tracked_keys(), 2);
    }

    #[test]
    fn test_stale_keys_stay_tracked() {
        let limiter = limiter(1, 5);
        let start = Instant::now();
        assert!(limiter.check_at("old", start));
        assert!(limiter.check_at("new", start + Duration::from_secs(5)));
        assert_eq!(limiter.tracked_keys(), 2);
    }

    #[test]
    fn test_concurrent_checks_never_exceed_budget() {
        let limiter = Arc::new(limiter(60, 50));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || (0..20).filter(|_| limiter.check("shared")).count())
            })
            .collect();

        let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(allowed, 50);
    }
}
