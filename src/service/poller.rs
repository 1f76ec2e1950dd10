// =============================================================================
// Matrixon Sync Gateway - Upstream Poller Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Runs the session's upstream `/sync` long-poll as a detached task. At most
//   one poll per session is scheduled or in flight; the task that performed
//   the poll stages its result and then releases the slot.
//
// =============================================================================

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use matrixon_gateway_core::{utils::redact_token, ErrorEnvelope, GatewayError, Result, SyncResponse};
use tracing::{debug, info, instrument, warn};
use url::form_urlencoded;

use crate::service::sessions::{PollStatus, SyncState};

pub struct UpstreamPoller {
    upstream_timeout: Duration,
}

impl UpstreamPoller {
    pub fn new(upstream_timeout: Duration) -> Self {
        Self { upstream_timeout }
    }

    /// Starts a poll now unless one is already scheduled or running.
    pub fn arm(self: &Arc<Self>, state: &Arc<SyncState>) -> bool {
        if !state.try_begin_poll(PollStatus::InFlight {
            since: Instant::now(),
        }) {
            return false;
        }
        self.spawn(state, None);
        true
    }

    /// Starts a poll after `delay` unless one is already scheduled or running.
    pub fn arm_delayed(self: &Arc<Self>, state: &Arc<SyncState>, delay: Duration) -> bool {
        if !state.try_begin_poll(PollStatus::Scheduled {
            since: Instant::now(),
        }) {
            return false;
        }
        self.spawn(state, Some(delay));
        true
    }

    fn spawn(self: &Arc<Self>, state: &Arc<SyncState>, delay: Option<Duration>) {
        let poller = Arc::clone(self);
        let state = Arc::clone(state);
        tokio::spawn(async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
                state.mark_poll_in_flight();
            }
            poller.run(&state).await;
        });
    }

    /// One poll with a single retry on network failure. The outcome is staged
    /// on the session before the slot is released.
    #[instrument(level = "debug", skip(self, state), fields(session = %state.key().redacted()))]
    async fn run(&self, state: &SyncState) {
        let start = Instant::now();
        let mut outcome = self.poll_once(state).await;
        if let Err(e) = &outcome {
            if e.is_transient() {
                warn!("⚠️ Upstream sync failed, retrying once: {}", e);
                outcome = self.poll_once(state).await;
            }
        }

        match outcome {
            Ok(()) => debug!("✅ Upstream sync staged in {:?}", start.elapsed()),
            Err(e) => {
                if e.is_auth() {
                    info!(
                        "🔒 Homeserver rejected credential {}: {}",
                        redact_token(&state.key().credential),
                        e
                    );
                } else {
                    warn!("⚠️ Upstream sync failed after {:?}: {}", start.elapsed(), e);
                }
                state.record_failure(e);
            }
        }
        state.finish_poll();
    }

    /// Sends one upstream `/sync` and stages the reply.
    pub async fn poll_once(&self, state: &SyncState) -> Result<()> {
        let query = self.upstream_query(state);
        let reply = state.homeserver().sync(&query).await?;
        if !reply.is_success() {
            return Err(GatewayError::from_upstream(reply.status, &reply.body));
        }
        // Some homeservers answer 200 with an error body.
        if ErrorEnvelope::from_body(&reply.body).is_some() {
            return Err(GatewayError::from_upstream(502, &reply.body));
        }

        let fragment: SyncResponse = serde_json::from_slice(&reply.body)?;
        let next_batch = fragment
            .next_batch
            .clone()
            .filter(|cursor| !cursor.is_empty())
            .ok_or_else(|| GatewayError::Internal("Upstream sync reply has no next_batch".to_owned()))?;

        state.set_next_batch(next_batch);
        state.mark_caught_up();
        state.enqueue(fragment);
        Ok(())
    }

    /// Client parameters plus the session cursor and the upstream timeout.
    pub fn upstream_query(&self, state: &SyncState) -> String {
        let mut query = form_urlencoded::Serializer::new(String::new());
        for (key, value) in state.upstream_params() {
            query.append_pair(key, value);
        }
        if let Some(since) = state.next_batch() {
            query.append_pair("since", &since);
        }
        query.append_pair("timeout", &self.upstream_timeout.as_millis().to_string());
        query.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test_utils::{sample_key, FakeHomeserver},
        upstream::Homeserver,
    };
    use test_log::test;

    fn session(homeserver: Arc<FakeHomeserver>, since: Option<&str>) -> Arc<SyncState> {
        let homeserver: Arc<dyn Homeserver> = homeserver;
        Arc::new(SyncState::new(
            sample_key("@alice:example.org"),
            homeserver,
            since.map(str::to_owned),
            vec![("filter".into(), "{\"room\":{}}".into())],
        ))
    }

    async fn wait_idle(state: &SyncState) {
        let mut poll = state.subscribe_poll();
        tokio::time::timeout(Duration::from_secs(5), poll.wait_for(|s| s.is_idle()))
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn test_query_carries_filter_cursor_and_timeout() {
        let poller = UpstreamPoller::new(Duration::from_secs(30));
        let state = session(Arc::new(FakeHomeserver::new("@alice:example.org")), Some("s1"));
        assert_eq!(
            poller.upstream_query(&state),
            "filter=%7B%22room%22%3A%7B%7D%7D&since=s1&timeout=30000"
        );
    }

    #[test(tokio::test)]
    async fn test_only_one_poll_in_flight() {
        let homeserver = Arc::new(
            FakeHomeserver::new("@alice:example.org")
                .with_sync_reply(Duration::from_millis(100), 200, r#"{"next_batch":"s2"}"#),
        );
        let state = session(Arc::clone(&homeserver), Some("s1"));
        let poller = Arc::new(UpstreamPoller::new(Duration::from_secs(30)));

        assert!(poller.arm(&state));
        assert!(!poller.arm(&state));
        assert!(!poller.arm_delayed(&state, Duration::ZERO));
        wait_idle(&state).await;

        assert_eq!(homeserver.sync_calls(), 1);
        assert_eq!(homeserver.max_concurrent_syncs(), 1);
        assert_eq!(state.next_batch().as_deref(), Some("s2"));
        assert_eq!(state.dequeue().unwrap().next_batch.as_deref(), Some("s2"));
        assert!(!state.is_initial_sync());
    }

    #[test(tokio::test)]
    async fn test_rejected_token_is_recorded() {
        let homeserver = Arc::new(FakeHomeserver::new("@alice:example.org").with_sync_reply(
            Duration::ZERO,
            401,
            r#"{"errcode":"M_UNKNOWN_TOKEN","error":"Token revoked"}"#,
        ));
        let state = session(homeserver, Some("s1"));
        let poller = Arc::new(UpstreamPoller::new(Duration::from_secs(30)));

        assert!(poller.arm(&state));
        wait_idle(&state).await;
        assert!(matches!(state.take_failure(), Some(GatewayError::TokenRejected { .. })));
        assert!(state.dequeue().is_none());
    }

    #[test(tokio::test)]
    async fn test_transient_failure_is_retried_once() {
        let homeserver = Arc::new(
            FakeHomeserver::new("@alice:example.org")
                .with_sync_failure(GatewayError::TransientNetwork("connection reset".into()))
                .with_sync_reply(Duration::ZERO, 200, r#"{"next_batch":"s9"}"#),
        );
        let state = session(Arc::clone(&homeserver), Some("s1"));
        let poller = Arc::new(UpstreamPoller::new(Duration::from_secs(30)));

        assert!(poller.arm(&state));
        wait_idle(&state).await;
        assert_eq!(homeserver.sync_calls(), 2);
        assert!(state.take_failure().is_none());
        assert_eq!(state.next_batch().as_deref(), Some("s9"));
    }

    #[test(tokio::test)]
    async fn test_delayed_poll_waits() {
        let homeserver = Arc::new(
            FakeHomeserver::new("@alice:example.org")
                .with_sync_reply(Duration::ZERO, 200, r#"{"next_batch":"s2"}"#),
        );
        let state = session(Arc::clone(&homeserver), None);
        let poller = Arc::new(UpstreamPoller::new(Duration::from_secs(30)));

        assert!(poller.arm_delayed(&state, Duration::from_millis(150)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(state.poll_status().label(), "scheduled");
        assert_eq!(homeserver.sync_calls(), 0);

        wait_idle(&state).await;
        assert_eq!(homeserver.sync_calls(), 1);
        assert!(!state.is_initial_sync());
    }
}
