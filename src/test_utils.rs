// =============================================================================
// Matrixon Sync Gateway - Test Utils Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Scriptable in-memory homeserver and connector used by unit and
//   integration tests. Every call is counted so tests can assert on upstream
//   traffic.
//
// =============================================================================

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use matrixon_gateway_core::{
    utils::server_name_of, ErrorEnvelope, GatewayError, MessagesResponse, Result, SessionKey,
    SyncEvent, WhoAmI,
};
use serde_json::json;

use crate::upstream::{Direction, Homeserver, HomeserverConnector, UpstreamReply};

/// Session key for `user` on its own server with a fixed device and token.
pub fn sample_key(user: &str) -> SessionKey {
    let whoami = sample_whoami(user);
    let server = whoami.user_id.server_name().to_string();
    SessionKey::new(&whoami, server, "secret_token")
}

pub fn sample_whoami(user: &str) -> WhoAmI {
    WhoAmI {
        user_id: user.try_into().expect("test user id must be valid"),
        device_id: Some("DEVICE".into()),
        is_guest: false,
    }
}

/// `m.room.member` state event.
pub fn member_event(user: &str, membership: &str) -> SyncEvent {
    SyncEvent {
        kind: "m.room.member".to_owned(),
        state_key: Some(user.to_owned()),
        sender: Some(user.to_owned()),
        content: json!({ "membership": membership }),
        extra: BTreeMap::new(),
    }
}

enum ScriptedSync {
    Reply {
        delay: Duration,
        status: u16,
        body: String,
    },
    Failure(GatewayError),
}

/// Homeserver fake. `/sync` answers come from a script; once the script is
/// exhausted a poll never completes.
pub struct FakeHomeserver {
    whoami: WhoAmI,
    server_name: String,
    rooms: Vec<String>,
    states: HashMap<String, Vec<SyncEvent>>,
    messages: HashMap<String, MessagesResponse>,
    direct: HashSet<String>,
    failing: HashSet<String>,
    sync_script: Mutex<VecDeque<ScriptedSync>>,
    sync_queries: Mutex<Vec<String>>,
    state_requests: Mutex<Vec<String>>,
    sync_calls: AtomicUsize,
    syncs_in_flight: AtomicUsize,
    max_syncs_in_flight: AtomicUsize,
}

impl FakeHomeserver {
    pub fn new(user: &str) -> Self {
        let whoami = sample_whoami(user);
        Self {
            server_name: whoami.user_id.server_name().to_string(),
            whoami,
            rooms: Vec::new(),
            states: HashMap::new(),
            messages: HashMap::new(),
            direct: HashSet::new(),
            failing: HashSet::new(),
            sync_script: Mutex::new(VecDeque::new()),
            sync_queries: Mutex::new(Vec::new()),
            state_requests: Mutex::new(Vec::new()),
            sync_calls: AtomicUsize::new(0),
            syncs_in_flight: AtomicUsize::new(0),
            max_syncs_in_flight: AtomicUsize::new(0),
        }
    }

    /// Joined room with the given state.
    pub fn with_room(mut self, room_id: &str, state: Vec<SyncEvent>) -> Self {
        self.rooms.push(room_id.to_owned());
        self.states.insert(room_id.to_owned(), state);
        self
    }

    pub fn with_direct_room(mut self, room_id: &str) -> Self {
        self.direct.insert(room_id.to_owned());
        self
    }

    /// Room whose state and messages requests fail.
    pub fn with_failing_room(mut self, room_id: &str) -> Self {
        self.failing.insert(room_id.to_owned());
        self
    }

    /// Messages page, `event_ids` newest first as backward pagination returns them.
    pub fn with_messages(mut self, room_id: &str, event_ids: &[&str], end: Option<&str>) -> Self {
        let chunk = event_ids
            .iter()
            .map(|event_id| SyncEvent {
                kind: "m.room.message".to_owned(),
                state_key: None,
                sender: Some(self.whoami.user_id.to_string()),
                content: json!({ "msgtype": "m.text", "body": event_id }),
                extra: BTreeMap::from([("event_id".to_owned(), json!(event_id))]),
            })
            .collect();
        self.messages.insert(
            room_id.to_owned(),
            MessagesResponse {
                chunk,
                start: Some("t_start".to_owned()),
                end: end.map(str::to_owned),
                state: Vec::new(),
            },
        );
        self
    }

    /// Queues a `/sync` answer.
    pub fn with_sync_reply(self, delay: Duration, status: u16, body: &str) -> Self {
        self.push_sync(ScriptedSync::Reply {
            delay,
            status,
            body: body.to_owned(),
        });
        self
    }

    /// Queues a `/sync` failure.
    pub fn with_sync_failure(self, error: GatewayError) -> Self {
        self.push_sync(ScriptedSync::Failure(error));
        self
    }

    fn push_sync(&self, entry: ScriptedSync) {
        self.sync_script.lock().unwrap_or_else(PoisonError::into_inner).push_back(entry);
    }

    pub fn sync_calls(&self) -> usize {
        self.sync_calls.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_syncs(&self) -> usize {
        self.max_syncs_in_flight.load(Ordering::SeqCst)
    }

    pub fn sync_queries(&self) -> Vec<String> {
        self.sync_queries.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Rooms whose state was requested, in request order.
    pub fn state_requests(&self) -> Vec<String> {
        self.state_requests.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn not_found(room_id: &str) -> GatewayError {
        GatewayError::UpstreamProtocol {
            status: 404,
            envelope: ErrorEnvelope::new("M_NOT_FOUND", format!("Unknown room {}", room_id)),
        }
    }

    fn forbidden(room_id: &str) -> GatewayError {
        GatewayError::UpstreamProtocol {
            status: 403,
            envelope: ErrorEnvelope::new("M_FORBIDDEN", format!("Not allowed in {}", room_id)),
        }
    }
}

#[async_trait]
impl Homeserver for FakeHomeserver {
    fn server_name(&self) -> &str {
        &self.server_name
    }

    fn whoami(&self) -> &WhoAmI {
        &self.whoami
    }

    async fn sync(&self, query: &str) -> Result<UpstreamReply> {
        self.sync_calls.fetch_add(1, Ordering::SeqCst);
        self.sync_queries.lock().unwrap_or_else(PoisonError::into_inner).push(query.to_owned());
        let in_flight = self.syncs_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_syncs_in_flight.fetch_max(in_flight, Ordering::SeqCst);

        let next = self.sync_script.lock().unwrap_or_else(PoisonError::into_inner).pop_front();
        let outcome = match next {
            Some(ScriptedSync::Reply {
                delay,
                status,
                body,
            }) => {
                tokio::time::sleep(delay).await;
                Ok(UpstreamReply {
                    status,
                    content_type: Some("application/json".to_owned()),
                    body: body.into_bytes(),
                })
            }
            Some(ScriptedSync::Failure(error)) => Err(error),
            None => std::future::pending().await,
        };

        self.syncs_in_flight.fetch_sub(1, Ordering::SeqCst);
        outcome
    }

    async fn joined_rooms(&self) -> Result<Vec<String>> {
        Ok(self.rooms.clone())
    }

    async fn direct_rooms(&self) -> Result<HashSet<String>> {
        Ok(self.direct.clone())
    }

    async fn room_state(&self, room_id: &str) -> Result<Vec<SyncEvent>> {
        self.state_requests.lock().unwrap_or_else(PoisonError::into_inner).push(room_id.to_owned());
        if self.failing.contains(room_id) {
            return Err(Self::forbidden(room_id));
        }
        self.states
            .get(room_id)
            .cloned()
            .ok_or_else(|| Self::not_found(room_id))
    }

    async fn room_messages(
        &self,
        room_id: &str,
        _limit: u32,
        _dir: Direction,
    ) -> Result<MessagesResponse> {
        if self.failing.contains(room_id) {
            return Err(Self::forbidden(room_id));
        }
        Ok(self.messages.get(room_id).cloned().unwrap_or_default())
    }
}

struct FakeAccount {
    homeserver: Arc<FakeHomeserver>,
    whoami_delay: Duration,
}

/// Connector fake keyed by (server, token).
#[derive(Default)]
pub struct FakeConnector {
    accounts: HashMap<(String, String), FakeAccount>,
    discovery_delays: HashMap<String, Duration>,
    connect_failures: Mutex<VecDeque<GatewayError>>,
    whoami_calls: AtomicUsize,
    connect_calls: AtomicUsize,
    prepare_calls: AtomicUsize,
    forgotten: Mutex<Vec<String>>,
}

impl FakeConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// `token` belongs to `user` on `server`; whoami answers after `delay`.
    pub fn with_account(self, server: &str, token: &str, user: &str, delay: Duration) -> Self {
        self.with_homeserver_delayed(server, token, Arc::new(FakeHomeserver::new(user)), delay)
    }

    /// `token` opens `homeserver` on the server of its user.
    pub fn with_homeserver(self, token: &str, homeserver: Arc<FakeHomeserver>) -> Self {
        let server = server_name_of(homeserver.whoami.user_id.as_str())
            .unwrap_or_default()
            .to_owned();
        self.with_homeserver_delayed(&server, token, homeserver, Duration::ZERO)
    }

    fn with_homeserver_delayed(
        mut self,
        server: &str,
        token: &str,
        homeserver: Arc<FakeHomeserver>,
        whoami_delay: Duration,
    ) -> Self {
        self.accounts.insert(
            (server.to_owned(), token.to_owned()),
            FakeAccount {
                homeserver,
                whoami_delay,
            },
        );
        self
    }

    /// Preparing `server` takes `delay`, like a slow `.well-known` lookup.
    pub fn with_discovery_delay(mut self, server: &str, delay: Duration) -> Self {
        self.discovery_delays.insert(server.to_owned(), delay);
        self
    }

    /// The next `connect` fails with `error`.
    pub fn with_connect_failure(self, error: GatewayError) -> Self {
        self.connect_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(error);
        self
    }

    pub fn whoami_calls(&self) -> usize {
        self.whoami_calls.load(Ordering::SeqCst)
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn prepare_calls(&self) -> usize {
        self.prepare_calls.load(Ordering::SeqCst)
    }

    pub fn forgotten(&self) -> Vec<String> {
        self.forgotten.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn account(&self, server: &str, token: &str) -> Result<&FakeAccount> {
        self.accounts
            .get(&(server.to_owned(), token.to_owned()))
            .ok_or_else(|| GatewayError::TokenRejected {
                error: "Unknown access token".to_owned(),
                soft_logout: false,
            })
    }
}

#[async_trait]
impl HomeserverConnector for FakeConnector {
    async fn prepare(&self, server: &str) -> Result<()> {
        self.prepare_calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.discovery_delays.get(server) {
            tokio::time::sleep(*delay).await;
        }
        Ok(())
    }

    async fn whoami(&self, server: &str, credential: &str) -> Result<WhoAmI> {
        self.whoami_calls.fetch_add(1, Ordering::SeqCst);
        let account = self.account(server, credential)?;
        tokio::time::sleep(account.whoami_delay).await;
        Ok(account.homeserver.whoami.clone())
    }

    async fn connect(&self, server: &str, credential: &str) -> Result<Arc<dyn Homeserver>> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let failure = self
            .connect_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        if let Some(error) = failure {
            return Err(error);
        }
        let homeserver: Arc<dyn Homeserver> = self.account(server, credential)?.homeserver.clone();
        Ok(homeserver)
    }

    fn forget(&self, credential: &str) {
        self.forgotten.lock().unwrap_or_else(PoisonError::into_inner).push(credential.to_owned());
    }
}
