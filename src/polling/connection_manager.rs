//! Admission control for concurrent long-poll sessions.
//!
//! Two independent caps apply to every admission, checked in order: the
//! global number of active sessions, then the number of active sessions for
//! the requesting client. Either one denies with the same
//! [`PollError::AdmissionDenied`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::config::PollingSettings;
use crate::errors::PollError;

/// One active poll session: (client identity, job id).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub client: String,
    pub resource: String,
}

impl ConnectionKey {
    pub fn new(client: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            client: client.into(),
            resource: resource.into(),
        }
    }
}

#[derive(Debug, Default)]
struct AdmissionState {
    /// Active sessions per key. A client may poll the same job more than once.
    sessions: HashMap<ConnectionKey, usize>,
    /// Active sessions per client; entries are dropped when they reach zero.
    per_client: HashMap<String, usize>,
    total: usize,
}

/// Tracks active long-poll sessions per client and globally.
#[derive(Debug)]
pub struct ConnectionManager {
    max_client_connections: usize,
    global_max_connections: usize,
    state: Mutex<AdmissionState>,
}

impl ConnectionManager {
    pub fn new(max_client_connections: usize, global_max_connections: usize) -> Self {
        Self {
            max_client_connections,
            global_max_connections,
            state: Mutex::new(AdmissionState::default()),
        }
    }

    pub fn from_settings(settings: &PollingSettings) -> Self {
        Self::new(
            settings.max_client_connections,
            settings.global_max_connections,
        )
    }

    /// Reserve a slot for `(client, resource)`.
    ///
    /// Fails closed: a poisoned state lock denies admission instead of
    /// surfacing a different error.
    pub fn connect(&self, client: &str, resource: &str) -> Result<(), PollError> {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(_) => {
                tracing::error!("Connection state poisoned; denying {} for {}", resource, client);
                return Err(PollError::AdmissionDenied);
            }
        };

        if state.total >= self.global_max_connections {
            tracing::warn!("Global connection limit exceeded: {}", state.total);
            return Err(PollError::AdmissionDenied);
        }

        let client_active = state.per_client.get(client).copied().unwrap_or(0);
        if client_active >= self.max_client_connections {
            tracing::warn!(
                "Client {} exceeded per-client connection limit: {}",
                client,
                client_active
            );
            return Err(PollError::AdmissionDenied);
        }

        *state
            .sessions
            .entry(ConnectionKey::new(client, resource))
            .or_insert(0) += 1;
        *state.per_client.entry(client.to_string()).or_insert(0) += 1;
        state.total += 1;

        tracing::debug!("Connected {} for client {}", resource, client);
        Ok(())
    }

    /// Release one slot for `(client, resource)`.
    ///
    /// A no-op when no such session is active. Never panics.
    pub fn disconnect(&self, client: &str, resource: &str) {
        let mut state = match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let key = ConnectionKey::new(client, resource);
        let Some(count) = state.sessions.get_mut(&key) else {
            return;
        };
        *count -= 1;
        if *count == 0 {
            state.sessions.remove(&key);
        }

        if let Some(active) = state.per_client.get_mut(client) {
            *active = active.saturating_sub(1);
            if *active == 0 {
                state.per_client.remove(client);
            }
        }
        state.total = state.total.saturating_sub(1);

        tracing::debug!("Disconnected {} for client {}", resource, client);
    }

    /// Reserve a slot and return a guard that releases it when dropped.
    ///
    /// The guard covers every exit path of the caller, including a future
    /// dropped mid-poll because the HTTP client went away.
    pub fn admit(
        self: &Arc<Self>,
        client: &str,
        resource: &str,
    ) -> Result<ConnectionGuard, PollError> {
        self.connect(client, resource)?;
        Ok(ConnectionGuard {
            manager: Arc::clone(self),
            key: Some(ConnectionKey::new(client, resource)),
        })
    }

    /// Total active sessions.
    pub fn active_connections(&self) -> usize {
        self.state.lock().map(|s| s.total).unwrap_or(0)
    }

    /// Active sessions for one client.
    pub fn active_for_client(&self, client: &str) -> usize {
        self.state
            .lock()
            .map(|s| s.per_client.get(client).copied().unwrap_or(0))
            .unwrap_or(0)
    }

    /// Whether any session for `client` is being tracked.
    pub fn has_client(&self, client: &str) -> bool {
        self.state
            .lock()
            .map(|s| s.per_client.contains_key(client))
            .unwrap_or(false)
    }
}

/// Scoped admission; releases its slot exactly once.
#[derive(Debug)]
pub struct ConnectionGuard {
    manager: Arc<ConnectionManager>,
    key: Option<ConnectionKey>,
}

impl ConnectionGuard {
    pub fn key(&self) -> Option<&ConnectionKey> {
        self.key.as_ref()
    }

    /// Release now instead of at drop.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if let Some(key) = self.key.take() {
            self.manager.disconnect(&key.client, &key.resource);
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connect_disconnect() {
        let manager = ConnectionManager::new(5, 1000);
        manager.connect("1.2.3.4", "eval1").unwrap();
        assert_eq!(manager.active_connections(), 1);
        assert_eq!(manager.active_for_client("1.2.3.4"), 1);

        manager.disconnect("1.2.3.4", "eval1");
        assert_eq!(manager.active_connections(), 0);
        assert!(!manager.has_client("1.2.3.4"));
    }

    #[test]
    fn test_global_cap_admits_exactly_g() {
        let manager = ConnectionManager::new(10, 3);
        for i in 0..3 {
            manager.connect(&format!("client-{}", i), "job").unwrap();
        }
        assert_eq!(
            manager.connect("client-9", "job"),
            Err(PollError::AdmissionDenied)
        );
        assert_eq!(manager.active_connections(), 3);
    }

    #[test]
    fn test_per_client_cap_with_global_capacity_left() {
        let manager = ConnectionManager::new(2, 100);
        manager.connect("3.3.3.3", "x").unwrap();
        manager.connect("3.3.3.3", "y").unwrap();
        assert_eq!(
            manager.connect("3.3.3.3", "z"),
            Err(PollError::AdmissionDenied)
        );
        manager.connect("4.4.4.4", "z").unwrap();
    }

    #[test]
    fn test_release_frees_a_slot() {
        let manager = ConnectionManager::new(1, 1);
        manager.connect("1.1.1.1", "a").unwrap();
        assert!(manager.connect("2.2.2.2", "b").is_err());

        manager.disconnect("1.1.1.1", "a");
        manager.connect("3.3.3.3", "x").unwrap();
        assert!(manager.connect("3.3.3.3", "y").is_err());
    }

    #[test]
    fn test_disconnect_unknown_is_noop() {
        let manager = ConnectionManager::new(1, 1);
        manager.disconnect("ghost", "nothing");
        manager.connect("a", "1").unwrap();
        manager.disconnect("a", "other");
        manager.disconnect("b", "1");
        assert_eq!(manager.active_connections(), 1);

        manager.disconnect("a", "1");
        manager.disconnect("a", "1");
        assert_eq!(manager.active_connections(), 0);
    }

    #[test]
    fn test_same_job_twice_counts_twice() {
        let manager = ConnectionManager::new(2, 10);
        manager.connect("c", "job").unwrap();
        manager.connect("c", "job").unwrap();
        assert!(manager.connect("c", "job").is_err());

        manager.disconnect("c", "job");
        assert_eq!(manager.active_for_client("c"), 1);
        manager.disconnect("c", "job");
        assert!(!manager.has_client("c"));
    }

    #[test]
    fn test_concurrent_connects_admit_exactly_global_cap() {
        let manager = Arc::new(ConnectionManager::new(1000, 50));
        let handles: Vec<_> = (0..8)
            .map(|t| {
                let manager = Arc::clone(&manager);
                std::thread::spawn(move || {
                    let client = format!("client-{}", t);
                    (0..20)
                        .map(|i| format!("job-{}", i))
                        .filter(|job| manager.connect(&client, job).is_ok())
                        .map(|job| (client.clone(), job))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let admitted: Vec<(String, String)> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(admitted.len(), 50);
        assert_eq!(manager.active_connections(), 50);

        for (client, job) in &admitted {
            manager.disconnect(client, job);
        }
        assert_eq!(manager.active_connections(), 0);
        for t in 0..8 {
            assert!(!manager.has_client(&format!("client-{}", t)));
        }
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let manager = Arc::new(ConnectionManager::new(1, 10));
        {
            let guard = manager.admit("c", "job").unwrap();
            assert_eq!(guard.key(), Some(&ConnectionKey::new("c", "job")));
            assert!(manager.admit("c", "other").is_err());
        }
        assert_eq!(manager.active_connections(), 0);
        let guard = manager.admit("c", "other").unwrap();
        guard.release();
        assert_eq!(manager.active_connections(), 0);
    }
}
