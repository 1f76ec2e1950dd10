// =============================================================================
// Matrixon Sync Gateway - Response Emitter Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Answers one client `/sync` request from a session: a staged fragment if
//   there is one, otherwise whatever arrives within the wait budget, otherwise
//   a heartbeat fragment carrying gateway status as presence.
//
// =============================================================================

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use matrixon_gateway_core::{
    is_empty_cursor,
    utils::{format_bytes, format_duration},
    Result, Rooms, SyncEvent, SyncResponse, PLACEHOLDER_CURSOR,
};
use sysinfo::System;
use tokio::time::timeout_at;
use tracing::{debug, instrument};

use crate::{
    config::SyncConfig,
    service::{
        poller::UpstreamPoller,
        sessions::{SessionRegistry, SyncState},
    },
};

/// How long a request may wait for a fragment.
///
/// Requests in the initial phase are capped so preloaded rooms flow out
/// quickly. Above the load-shed threshold waits shrink in proportion to the
/// number of active sessions, but never below the configured floor (or the
/// request itself, if that is smaller).
pub fn wait_budget(
    requested: Duration,
    active_sessions: usize,
    initial_phase: bool,
    config: &SyncConfig,
) -> Duration {
    let mut budget = requested.min(Duration::from_millis(config.max_wait_ms));
    if initial_phase {
        budget = budget.min(Duration::from_millis(config.initial_sync_wait_ms));
    }

    let threshold = config.load_shed_threshold.max(1);
    if active_sessions > threshold {
        let floor = requested.min(Duration::from_millis(config.min_wait_ms));
        let scaled = budget.mul_f64(threshold as f64 / active_sessions as f64);
        budget = scaled.max(floor).min(budget.max(floor));
    }
    budget
}

/// Resident memory of this process in bytes, 0 if unknown.
pub fn process_memory() -> u64 {
    let Ok(pid) = sysinfo::get_current_pid() else {
        return 0;
    };
    let mut system = System::new();
    system.refresh_process(pid);
    system.process(pid).map(|process| process.memory()).unwrap_or(0)
}

pub struct ResponseEmitter {
    poller: Arc<UpstreamPoller>,
    sessions: Arc<SessionRegistry>,
    config: SyncConfig,
}

impl ResponseEmitter {
    pub fn new(poller: Arc<UpstreamPoller>, sessions: Arc<SessionRegistry>, config: SyncConfig) -> Self {
        Self {
            poller,
            sessions,
            config,
        }
    }

    /// Budget for a request on `state` with the client's `timeout`.
    pub fn budget_for(&self, state: &SyncState, requested: Option<Duration>) -> Duration {
        let requested =
            requested.unwrap_or_else(|| Duration::from_millis(self.config.default_timeout_ms));
        wait_budget(
            requested,
            self.sessions
                .active_within(Duration::from_millis(self.config.active_window_ms)),
            state.is_initial_sync(),
            &self.config,
        )
    }

    /// Produces the response for one client request.
    ///
    /// A failure recorded by the poller is returned instead of a fragment.
    /// The returned fragment always carries a cursor.
    #[instrument(level = "debug", skip(self, state), fields(session = %state.key().redacted()))]
    pub async fn emit(
        &self,
        state: &Arc<SyncState>,
        requested: Option<Duration>,
        since: Option<&str>,
    ) -> Result<SyncResponse> {
        let start = Instant::now();
        state.touch();
        let budget = self.budget_for(state, requested);
        let deadline = tokio::time::Instant::now() + budget;

        let mut enqueued = state.subscribe_enqueued();
        let mut poll = state.subscribe_poll();

        let fragment = loop {
            if let Some(error) = state.take_failure() {
                return Err(error);
            }
            if let Some(fragment) = state.dequeue() {
                // Keep the upstream stream moving for the next request.
                self.poller.arm(state);
                break fragment;
            }
            if state.poll_status().is_idle() {
                self.poller.arm(state);
            }

            enqueued.borrow_and_update();
            poll.borrow_and_update();
            // Re-check after marking both channels seen so no wakeup is lost.
            if state.queue_len() > 0 || state.poll_status().is_idle() {
                continue;
            }

            let woke = timeout_at(deadline, async {
                tokio::select! {
                    changed = enqueued.changed() => changed.is_ok(),
                    changed = poll.changed() => changed.is_ok(),
                }
            })
            .await;

            match woke {
                Ok(true) => continue,
                _ => break self.heartbeat(state, start.elapsed()),
            }
        };

        debug!("📤 Emitting fragment after {:?} (budget {:?})", start.elapsed(), budget);
        Ok(finalize_cursor(fragment, since))
    }

    /// Fragment sent when nothing arrived in time.
    fn heartbeat(&self, state: &SyncState, waited: Duration) -> SyncResponse {
        let status = state.poll_status();
        let polling_for = status
            .since()
            .map(|since| format_duration(since.elapsed()))
            .unwrap_or_else(|| "-".to_owned());
        let text = format!(
            "M={} TE={} W={} S={} QL={}",
            format_bytes(process_memory()),
            polling_for,
            format_duration(waited),
            status.label(),
            state.queue_len()
        );

        let mut fragment = SyncResponse {
            rooms: Some(Rooms::default()),
            ..Default::default()
        };
        fragment.push_presence(SyncEvent::presence_status(&state.key().user_id, text));
        fragment
    }
}

/// The fragment's own cursor, else the client's, else the placeholder.
pub fn finalize_cursor(mut fragment: SyncResponse, since: Option<&str>) -> SyncResponse {
    let cursor = fragment
        .next_batch
        .take()
        .filter(|cursor| !cursor.is_empty())
        .or_else(|| since.filter(|s| !is_empty_cursor(Some(s))).map(str::to_owned))
        .unwrap_or_else(|| PLACEHOLDER_CURSOR.to_owned());
    fragment.next_batch = Some(cursor);
    fragment
}
