// =============================================================================
// Matrixon Sync Gateway - Sync State Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Per-session state: the FIFO of staged fragments, the upstream cursor and
//   the in-flight marker of the upstream long-poll. Producers (preload and the
//   poller) and the consumer (the emitter) only meet through this type.
//
// =============================================================================

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::{Duration, Instant},
};

use matrixon_gateway_core::{GatewayError, SessionKey, SyncResponse};
use tokio::{sync::watch, task::JoinHandle};

use crate::upstream::Homeserver;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Where the session's upstream long-poll is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStatus {
    /// Nothing scheduled or running
    Idle,
    /// Armed, waiting out the initial delay
    Scheduled { since: Instant },
    /// Request sent upstream
    InFlight { since: Instant },
}

impl PollStatus {
    pub fn is_idle(self) -> bool {
        matches!(self, Self::Idle)
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Scheduled { .. } => "scheduled",
            Self::InFlight { .. } => "polling",
        }
    }

    pub fn since(self) -> Option<Instant> {
        match self {
            Self::Idle => None,
            Self::Scheduled { since } | Self::InFlight { since } => Some(since),
        }
    }
}

/// State shared by every request of one sync session.
pub struct SyncState {
    key: SessionKey,
    homeserver: Arc<dyn Homeserver>,
    /// Client query parameters forwarded on upstream polls (filter, presence, ...)
    upstream_params: Vec<(String, String)>,
    queue: Mutex<VecDeque<SyncResponse>>,
    /// Bumped after every enqueue
    enqueued: watch::Sender<u64>,
    poll: watch::Sender<PollStatus>,
    next_batch: Mutex<Option<String>>,
    initial_sync: AtomicBool,
    failure: Mutex<Option<GatewayError>>,
    last_seen: Mutex<Instant>,
    preload: Mutex<Option<JoinHandle<()>>>,
    created_at: Instant,
}

impl SyncState {
    /// `since` is the client's cursor; `None` starts an initial sync.
    pub fn new(
        key: SessionKey,
        homeserver: Arc<dyn Homeserver>,
        since: Option<String>,
        upstream_params: Vec<(String, String)>,
    ) -> Self {
        let now = Instant::now();
        Self {
            key,
            homeserver,
            upstream_params,
            queue: Mutex::new(VecDeque::new()),
            enqueued: watch::channel(0).0,
            poll: watch::channel(PollStatus::Idle).0,
            initial_sync: AtomicBool::new(since.is_none()),
            next_batch: Mutex::new(since),
            failure: Mutex::new(None),
            last_seen: Mutex::new(now),
            preload: Mutex::new(None),
            created_at: now,
        }
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn homeserver(&self) -> &Arc<dyn Homeserver> {
        &self.homeserver
    }

    pub fn upstream_params(&self) -> &[(String, String)] {
        &self.upstream_params
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Appends a fragment and wakes waiting emitters.
    pub fn enqueue(&self, fragment: SyncResponse) {
        lock(&self.queue).push_back(fragment);
        self.enqueued.send_modify(|count| *count += 1);
    }

    /// Oldest staged fragment.
    pub fn dequeue(&self) -> Option<SyncResponse> {
        lock(&self.queue).pop_front()
    }

    pub fn queue_len(&self) -> usize {
        lock(&self.queue).len()
    }

    pub fn subscribe_enqueued(&self) -> watch::Receiver<u64> {
        self.enqueued.subscribe()
    }

    pub fn subscribe_poll(&self) -> watch::Receiver<PollStatus> {
        self.poll.subscribe()
    }

    pub fn poll_status(&self) -> PollStatus {
        *self.poll.borrow()
    }

    /// Claims the poll slot. Only one caller wins while a poll is scheduled or
    /// in flight.
    pub fn try_begin_poll(&self, status: PollStatus) -> bool {
        self.poll.send_if_modified(|current| {
            if current.is_idle() && !status.is_idle() {
                *current = status;
                true
            } else {
                false
            }
        })
    }

    /// Scheduled poll is about to hit the network.
    pub fn mark_poll_in_flight(&self) {
        self.poll.send_if_modified(|current| match *current {
            PollStatus::Scheduled { .. } => {
                *current = PollStatus::InFlight {
                    since: Instant::now(),
                };
                true
            }
            _ => false,
        });
    }

    /// Releases the poll slot. Called by the poll task once its result is staged.
    pub fn finish_poll(&self) {
        self.poll.send_replace(PollStatus::Idle);
    }

    pub fn next_batch(&self) -> Option<String> {
        lock(&self.next_batch).clone()
    }

    pub fn set_next_batch(&self, next_batch: String) {
        *lock(&self.next_batch) = Some(next_batch);
    }

    /// True until the first upstream poll result is staged.
    pub fn is_initial_sync(&self) -> bool {
        self.initial_sync.load(Ordering::Acquire)
    }

    pub fn mark_caught_up(&self) {
        self.initial_sync.store(false, Ordering::Release);
    }

    /// Stores a poll failure for the next client request.
    pub fn record_failure(&self, error: GatewayError) {
        *lock(&self.failure) = Some(error);
    }

    pub fn take_failure(&self) -> Option<GatewayError> {
        lock(&self.failure).take()
    }

    pub fn touch(&self) {
        *lock(&self.last_seen) = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        lock(&self.last_seen).elapsed()
    }

    pub fn set_preload_task(&self, task: JoinHandle<()>) {
        *lock(&self.preload) = Some(task);
    }

    /// `None` when the session never preloaded.
    pub fn preload_finished(&self) -> Option<bool> {
        lock(&self.preload).as_ref().map(JoinHandle::is_finished)
    }
}
