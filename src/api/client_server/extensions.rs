// =============================================================================
// Matrixon Sync Gateway - Gateway Extension Endpoints
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Gateway specific endpoints under `/_matrix/client/unstable/io.matrixon.gateway`
//   plus the health check.
//
// =============================================================================

use std::{collections::BTreeMap, sync::Arc, time::Instant};

use axum::{extract::State, Json};
use chrono::{DateTime, Utc};
use matrixon_gateway_core::{GatewayError, UserIdentity};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{info, instrument, warn};

use crate::{
    api::{auth::AccessToken, error::ApiResult},
    clap::version,
    config::Config,
    service::{room_info::RoomInfoEntry, SessionDebug},
    Services,
};

#[derive(Debug, Serialize)]
pub struct RoomInfoView {
    pub room_id: String,
    pub expires_at: DateTime<Utc>,
    pub ttl_remaining_ms: i64,
    pub state_count: usize,
    pub member_counts: BTreeMap<String, usize>,
}

impl RoomInfoView {
    fn new(entry: &RoomInfoEntry, now: DateTime<Utc>) -> Self {
        Self {
            room_id: entry.room_id.clone(),
            expires_at: entry.expires_at,
            ttl_remaining_ms: (entry.expires_at - now).num_milliseconds().max(0),
            state_count: entry.state_count,
            member_counts: entry.member_counts.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct DebugSnapshot {
    pub uptime_s: u64,
    pub known_credentials: usize,
    pub cached_rooms: usize,
    pub sessions: Vec<SessionDebug>,
}

/// # `GET /_matrix/client/health`
pub async fn health_route() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": version(),
    }))
}

/// # `GET /_matrix/client/unstable/io.matrixon.gateway/joined_rooms_with_info`
///
/// State snapshot of every room the caller has joined.
#[instrument(level = "debug", skip_all)]
pub async fn joined_rooms_with_info_route(
    State(services): State<Arc<Services>>,
    token: AccessToken,
) -> ApiResult<Json<Value>> {
    let start = Instant::now();
    let token = token.into_inner();
    let identity = services.identity.resolve(token.as_deref()).await?;
    let credential = token.as_deref().map(str::trim).unwrap_or_default();
    let homeserver = services
        .connector
        .connect(identity.server_name(), credential)
        .await?;

    let entries = services
        .room_info
        .joined_rooms_with_info(
            homeserver.as_ref(),
            services.config.fast_initial_sync.preload_concurrency,
        )
        .await?;

    let rooms: BTreeMap<_, _> = entries
        .iter()
        .map(|entry| (entry.room_id.clone(), entry.as_ref()))
        .collect();
    info!(
        "✅ Collected info for {} joined rooms of {} in {:?}",
        rooms.len(),
        identity.user_id,
        start.elapsed()
    );
    Ok(Json(json!({ "rooms": rooms })))
}

/// # `GET /_matrix/client/unstable/io.matrixon.gateway/room_info_cache`
///
/// Admins only. Cached rooms, longest remaining lifetime first.
pub async fn room_info_cache_route(
    State(services): State<Arc<Services>>,
    token: AccessToken,
) -> ApiResult<Json<Value>> {
    require_admin(&services, token).await?;

    let now = Utc::now();
    let mut rooms: Vec<_> = services
        .room_info
        .snapshot()
        .iter()
        .map(|entry| RoomInfoView::new(entry, now))
        .collect();
    rooms.sort_by(|a, b| b.expires_at.cmp(&a.expires_at));
    Ok(Json(json!({ "count": rooms.len(), "rooms": rooms })))
}

/// # `GET /_matrix/client/unstable/io.matrixon.gateway/debug`
///
/// Admins only.
pub async fn debug_route(
    State(services): State<Arc<Services>>,
    token: AccessToken,
) -> ApiResult<Json<DebugSnapshot>> {
    require_admin(&services, token).await?;

    Ok(Json(DebugSnapshot {
        uptime_s: services.started_at.elapsed().as_secs(),
        known_credentials: services.identity.known_credentials(),
        cached_rooms: services.room_info.len(),
        sessions: services.session_debug(),
    }))
}

/// # `GET /_matrix/client/unstable/io.matrixon.gateway/proxy_config`
///
/// Admins only. The running configuration, secrets masked.
pub async fn proxy_config_route(
    State(services): State<Arc<Services>>,
    token: AccessToken,
) -> ApiResult<Json<Config>> {
    let identity = require_admin(&services, token).await?;
    info!("📋 Configuration requested by {}", identity.user_id);
    Ok(Json(services.config.redacted()))
}

async fn require_admin(services: &Services, token: AccessToken) -> ApiResult<UserIdentity> {
    let identity = services.identity.resolve(token.0.as_deref()).await?;
    if !services.config.is_admin(identity.user_id.as_str()) {
        warn!("⚠️ {} is not an admin", identity.user_id);
        return Err(GatewayError::Forbidden("You are not an admin".to_owned()).into());
    }
    Ok(identity)
}
