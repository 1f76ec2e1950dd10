// =============================================================================
// Matrixon Sync Gateway - API Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Router of the gateway. Handlers share the `Services` container through
//   axum state.
//
// =============================================================================

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode, Uri},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde_json::json;
use tracing::warn;

use crate::Services;

pub mod auth;
pub mod client_server;
pub mod error;

const EXTENSION_PREFIX: &str = "/_matrix/client/unstable/io.matrixon.gateway";

pub fn routes(services: Arc<Services>) -> Router {
    Router::new()
        .route("/_matrix/client/r0/sync", get(client_server::sync_events_route))
        .route("/_matrix/client/v3/sync", get(client_server::sync_events_route))
        .route("/_matrix/client/health", get(client_server::health_route))
        .route(
            &format!("{EXTENSION_PREFIX}/joined_rooms_with_info"),
            get(client_server::joined_rooms_with_info_route),
        )
        .route(
            &format!("{EXTENSION_PREFIX}/room_info_cache"),
            get(client_server::room_info_cache_route),
        )
        .route(
            &format!("{EXTENSION_PREFIX}/debug"),
            get(client_server::debug_route),
        )
        .route(
            &format!("{EXTENSION_PREFIX}/proxy_config"),
            get(client_server::proxy_config_route),
        )
        .fallback(not_found)
        .with_state(services)
}

/// Rewrites axum's bare 405 into a Matrix error.
pub async fn unrecognized_method(
    req: Request<Body>,
    next: Next,
) -> std::result::Result<Response, StatusCode> {
    let method = req.method().clone();
    let uri = req.uri().clone();
    let inner = next.run(req).await;
    if inner.status() == StatusCode::METHOD_NOT_ALLOWED {
        warn!("Method not allowed: {method} {uri}");
        return Ok(unrecognized(StatusCode::METHOD_NOT_ALLOWED));
    }
    Ok(inner)
}

async fn not_found(uri: Uri) -> impl IntoResponse {
    warn!("Not found: {uri}");
    unrecognized(StatusCode::NOT_FOUND)
}

fn unrecognized(status: StatusCode) -> Response {
    (
        status,
        Json(json!({
            "errcode": "M_UNRECOGNIZED",
            "error": "Unrecognized request"
        })),
    )
        .into_response()
}
