// =============================================================================
// Matrixon Sync Gateway - Session Registry Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Process-wide map from session key to sync state. Creation is atomic per
//   key: concurrent first requests of one session run the initializer once.
//
// =============================================================================

use std::{sync::Arc, time::Duration};

use dashmap::{mapref::entry::Entry, DashMap};
use matrixon_gateway_core::SessionKey;
use tracing::{debug, info};

mod state;

pub use state::{PollStatus, SyncState};

#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionKey, Arc<SyncState>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Existing session for `key`, or a new one built by `init`.
    ///
    /// The flag is true when this call created the session. `init` runs under
    /// the map's shard lock and must not block.
    pub fn get_or_create<F>(&self, key: SessionKey, init: F) -> (Arc<SyncState>, bool)
    where
        F: FnOnce(&SessionKey) -> SyncState,
    {
        let (state, created) = match self.sessions.entry(key) {
            Entry::Occupied(entry) => (Arc::clone(entry.get()), false),
            Entry::Vacant(entry) => {
                let state = Arc::new(init(entry.key()));
                info!("🆕 Tracking sync session {}", state.key().redacted());
                entry.insert(Arc::clone(&state));
                (state, true)
            }
        };
        state.touch();
        (state, created)
    }

    pub fn get(&self, key: &SessionKey) -> Option<Arc<SyncState>> {
        self.sessions.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Number of sessions currently tracked.
    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    /// Sessions whose client asked for something within `window`.
    pub fn active_within(&self, window: Duration) -> usize {
        self.sessions
            .iter()
            .filter(|entry| entry.value().idle_for() <= window)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn snapshot(&self) -> Vec<Arc<SyncState>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Drops sessions idle for longer than `max_idle` with no poll pending.
    pub(crate) fn evict_idle(&self, max_idle: Duration) -> usize {
        let before = self.sessions.len();
        self.sessions.retain(|key, state| {
            let keep = state.idle_for() <= max_idle || !state.poll_status().is_idle();
            if !keep {
                debug!("🧹 Evicting idle sync session {}", key.redacted());
            }
            keep
        });
        before.saturating_sub(self.sessions.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test_utils::{sample_key, FakeHomeserver},
        upstream::Homeserver,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use test_log::test;

    fn fresh_state(key: &SessionKey) -> SyncState {
        let homeserver: Arc<dyn Homeserver> = Arc::new(FakeHomeserver::new("@alice:example.org"));
        SyncState::new(key.clone(), homeserver, None, Vec::new())
    }

    #[test(tokio::test(flavor = "multi_thread", worker_threads = 4))]
    async fn test_concurrent_first_requests_create_once() {
        let registry = Arc::new(SessionRegistry::new());
        let inits = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..32)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let inits = Arc::clone(&inits);
                tokio::spawn(async move {
                    let (_, created) = registry.get_or_create(sample_key("@alice:example.org"), |key| {
                        inits.fetch_add(1, Ordering::SeqCst);
                        fresh_state(key)
                    });
                    created
                })
            })
            .collect();

        let mut created = 0;
        for task in tasks {
            if task.await.unwrap() {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(inits.load(Ordering::SeqCst), 1);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_distinct_credentials_get_distinct_sessions() {
        let registry = SessionRegistry::new();
        let first = sample_key("@alice:example.org");
        let mut second = first.clone();
        second.credential = "another_token".into();

        let (a, _) = registry.get_or_create(first.clone(), fresh_state);
        let (b, created) = registry.get_or_create(second, fresh_state);
        assert!(created);
        assert!(!Arc::ptr_eq(&a, &b));
        assert!(Arc::ptr_eq(&a, &registry.get(&first).unwrap()));
    }

    #[test]
    fn test_evict_idle_keeps_busy_sessions() {
        let registry = SessionRegistry::new();
        let (state, _) = registry.get_or_create(sample_key("@alice:example.org"), fresh_state);
        assert!(state.try_begin_poll(PollStatus::InFlight {
            since: std::time::Instant::now()
        }));
        assert_eq!(registry.evict_idle(Duration::ZERO), 0);

        state.finish_poll();
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(registry.evict_idle(Duration::ZERO), 1);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_active_sessions_exclude_idle_ones() {
        let registry = SessionRegistry::new();
        registry.get_or_create(sample_key("@alice:example.org"), fresh_state);
        let (bob, _) = registry.get_or_create(sample_key("@bob:example.org"), fresh_state);
        std::thread::sleep(Duration::from_millis(20));
        bob.touch();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.active_within(Duration::from_secs(60)), 2);
        assert_eq!(registry.active_within(Duration::from_millis(10)), 1);
    }
}
