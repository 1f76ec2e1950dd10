// =============================================================================
// Matrixon Sync Gateway - Services Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Service container. Owns the identity resolver, session registry, room
//   info cache, preload engine, poller and emitter, and runs the `/sync`
//   flow on top of them.
//
// =============================================================================

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use matrixon_gateway_core::{
    is_empty_cursor, utils::redact_token, GatewayError, Result, SessionKey, SyncResponse,
};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use url::form_urlencoded;

use crate::{config::Config, upstream::{HomeserverConnector, UpstreamReply}};

pub mod emitter;
pub mod identity;
pub mod poller;
pub mod preload;
pub mod room_info;
pub mod sessions;

use emitter::ResponseEmitter;
use identity::IdentityResolver;
use poller::UpstreamPoller;
use preload::PreloadEngine;
use room_info::RoomInfoCache;
use sessions::{SessionRegistry, SyncState};

// Parameters that only make sense on the client's own request.
const NOT_FORWARDED: [&str; 4] = ["access_token", "since", "timeout", "full_state"];

/// A client `/sync` request, parsed.
#[derive(Debug, Clone, Default)]
pub struct SyncRequest {
    pub credential: Option<String>,
    /// Raw client cursor
    pub since: Option<String>,
    /// Client `timeout`, if sent
    pub timeout: Option<Duration>,
    /// Parameters carried over to upstream polls
    pub forwarded: Vec<(String, String)>,
    /// Query relayed in passthrough mode
    pub passthrough_query: String,
}

impl SyncRequest {
    pub fn parse(credential: Option<String>, raw_query: Option<&str>) -> Result<Self> {
        let mut request = Self {
            credential,
            ..Default::default()
        };
        let mut passthrough = form_urlencoded::Serializer::new(String::new());

        for (key, value) in form_urlencoded::parse(raw_query.unwrap_or_default().as_bytes()) {
            match key.as_ref() {
                "access_token" => continue,
                "since" => {
                    if value != "null" {
                        passthrough.append_pair(&key, &value);
                    }
                    request.since = Some(value.into_owned());
                    continue;
                }
                "timeout" => {
                    let millis: u64 = value.parse().map_err(|_| {
                        GatewayError::BadRequest(format!("Invalid timeout: {}", value))
                    })?;
                    request.timeout = Some(Duration::from_millis(millis));
                }
                _ => {}
            }
            passthrough.append_pair(&key, &value);
            if !NOT_FORWARDED.contains(&key.as_ref()) {
                request.forwarded.push((key.into_owned(), value.into_owned()));
            }
        }

        request.passthrough_query = passthrough.finish();
        Ok(request)
    }
}

/// What the `/sync` handler sends back.
#[derive(Debug)]
pub enum SyncOutcome {
    Fragment(SyncResponse),
    /// Fast initial sync is off, upstream reply relayed verbatim
    Passthrough(UpstreamReply),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub expired_rooms: usize,
    pub evicted_sessions: usize,
    pub pruned_connections: usize,
}

/// Per-session view for the debug endpoint.
#[derive(Debug, Serialize)]
pub struct SessionDebug {
    pub session: String,
    pub initial_sync: bool,
    pub next_batch: Option<String>,
    pub queue_len: usize,
    pub poll: &'static str,
    pub idle_ms: u128,
    pub age_ms: u128,
    pub preload_finished: Option<bool>,
}

/**
 * Central service container for the sync gateway.
 *
 * # Service Architecture
 * - `identity`: credential to user resolution with the persistent token map
 * - `sessions`: one `SyncState` per (user, device, homeserver, credential)
 * - `room_info`: shared room state snapshots with size-scaled expiry
 * - `preload`: fast initial sync fan-out
 * - `poller`: the single upstream long-poll of each session
 * - `emitter`: answers client requests within their wait budget
 */
pub struct Services {
    pub config: Arc<Config>,
    pub connector: Arc<dyn HomeserverConnector>,
    pub identity: IdentityResolver,
    pub sessions: Arc<SessionRegistry>,
    pub room_info: Arc<RoomInfoCache>,
    pub preload: Arc<PreloadEngine>,
    pub poller: Arc<UpstreamPoller>,
    pub emitter: ResponseEmitter,
    pub started_at: Instant,
}

impl Services {
    #[instrument(level = "info", skip_all, fields(auth_homeservers = config.auth_homeservers.len()))]
    pub fn build(config: Config, connector: Arc<dyn HomeserverConnector>) -> Arc<Self> {
        let start = Instant::now();
        info!("🔧 Building gateway services");

        let config = Arc::new(config);
        let sessions = Arc::new(SessionRegistry::new());
        let room_info = Arc::new(RoomInfoCache::new(&config.room_info_cache));
        let poller = Arc::new(UpstreamPoller::new(config.upstream_timeout()));

        let services = Arc::new(Self {
            identity: IdentityResolver::new(&config, Arc::clone(&connector)),
            preload: Arc::new(PreloadEngine::new(&config, Arc::clone(&room_info))),
            emitter: ResponseEmitter::new(
                Arc::clone(&poller),
                Arc::clone(&sessions),
                config.sync.clone(),
            ),
            connector,
            sessions,
            room_info,
            poller,
            config,
            started_at: Instant::now(),
        });

        info!("✅ Gateway services ready in {:?}", start.elapsed());
        services
    }

    /// Serves a client `/sync`, retrying once on network failure and
    /// forgetting credentials the homeserver rejected.
    pub async fn handle_sync(&self, request: &SyncRequest) -> Result<SyncOutcome> {
        let mut outcome = self.sync(request).await;
        if let Err(e) = &outcome {
            if e.is_transient() {
                warn!("⚠️ Sync failed with a network error, retrying once: {}", e);
                outcome = self.sync(request).await;
            }
        }

        if let Err(GatewayError::TokenRejected { .. }) = &outcome {
            if let Some(credential) = request.credential.as_deref() {
                if let Err(e) = self.identity.forget(credential.trim()).await {
                    error!("❌ Could not record rejected credential: {}", e);
                }
            }
        }
        outcome
    }

    /// One attempt at a client `/sync`.
    #[instrument(level = "debug", skip_all)]
    pub async fn sync(&self, request: &SyncRequest) -> Result<SyncOutcome> {
        let identity = self.identity.resolve(request.credential.as_deref()).await?;
        let credential = request
            .credential
            .as_deref()
            .map(str::trim)
            .ok_or(GatewayError::MissingCredential)?;
        let homeserver = self
            .connector
            .connect(identity.server_name(), credential)
            .await?;

        if !self.config.fast_initial_sync.enabled {
            debug!("➡️ Relaying /sync for {}", identity.user_id);
            let reply = homeserver.sync(&request.passthrough_query).await?;
            return Ok(SyncOutcome::Passthrough(reply));
        }

        let key = SessionKey::new(homeserver.whoami(), homeserver.server_name(), credential);
        let since = request
            .since
            .clone()
            .filter(|since| !is_empty_cursor(Some(since)));
        let (state, created) = self.sessions.get_or_create(key, |key| {
            SyncState::new(
                key.clone(),
                Arc::clone(&homeserver),
                since.clone(),
                request.forwarded.clone(),
            )
        });

        if created && since.is_none() {
            info!(
                "🚀 Fast initial sync for {} ({})",
                identity.user_id,
                redact_token(credential)
            );
            self.preload.spawn(&state);
            self.poller
                .arm_delayed(&state, self.config.initial_poll_delay());
        }

        let fragment = self
            .emitter
            .emit(&state, request.timeout, since.as_deref())
            .await?;
        Ok(SyncOutcome::Fragment(fragment))
    }

    /// Drops expired room info, idle sessions and unused upstream handles.
    pub fn sweep(&self) -> SweepReport {
        let idle_ttl = self.config.session_idle_ttl();
        SweepReport {
            expired_rooms: self.room_info.purge_expired(),
            evicted_sessions: idle_ttl
                .map(|ttl| self.sessions.evict_idle(ttl))
                .unwrap_or(0),
            pruned_connections: idle_ttl
                .map(|ttl| self.connector.prune_idle(ttl))
                .unwrap_or(0),
        }
    }

    /// Runs `sweep` every `sync.sweep_interval_s` until aborted.
    pub fn spawn_maintenance(self: &Arc<Self>) -> JoinHandle<()> {
        let services = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(services.config.sweep_interval());
            // The first tick fires immediately.
            interval.tick().await;
            loop {
                interval.tick().await;
                let report = services.sweep();
                if report != SweepReport::default() {
                    info!(
                        "🧹 Swept {} expired rooms, {} idle sessions and {} upstream handles ({} sessions left)",
                        report.expired_rooms,
                        report.evicted_sessions,
                        report.pruned_connections,
                        services.sessions.len()
                    );
                }
            }
        })
    }

    pub fn session_debug(&self) -> Vec<SessionDebug> {
        let mut sessions: Vec<_> = self
            .sessions
            .snapshot()
            .into_iter()
            .map(|state| SessionDebug {
                session: state.key().redacted(),
                initial_sync: state.is_initial_sync(),
                next_batch: state.next_batch(),
                queue_len: state.queue_len(),
                poll: state.poll_status().label(),
                idle_ms: state.idle_for().as_millis(),
                age_ms: state.age().as_millis(),
                preload_finished: state.preload_finished(),
            })
            .collect();
        sessions.sort_by(|a, b| a.session.cmp(&b.session));
        sessions
    }
}
