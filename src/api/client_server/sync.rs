// =============================================================================
// Matrixon Sync Gateway - Sync Endpoint
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   `GET /_matrix/client/{r0,v3}/sync`. Fast initial sync fragments are
//   returned as JSON; in passthrough mode the upstream reply is relayed as is.
//
// =============================================================================

use std::{sync::Arc, time::Instant};

use axum::{
    body::Body,
    extract::{RawQuery, State},
    http::{header::CONTENT_TYPE, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use matrixon_gateway_core::GatewayError;
use tracing::{debug, instrument};

use crate::{
    api::{auth::AccessToken, error::ApiResult},
    service::{SyncOutcome, SyncRequest},
    upstream::UpstreamReply,
    Services,
};

/// # `GET /_matrix/client/r0/sync`
///
/// Synchronize the client's state with the latest state on the homeserver.
///
/// - First request of a session (no `since`): rooms are preloaded and handed
///   out as they arrive, ordered by estimated size
/// - Later requests wait for the session's upstream long-poll for at most
///   the wait budget, else answer with a heartbeat fragment
#[instrument(level = "debug", skip_all)]
pub async fn sync_events_route(
    State(services): State<Arc<Services>>,
    token: AccessToken,
    RawQuery(query): RawQuery,
) -> ApiResult<Response> {
    let start = Instant::now();
    let request = SyncRequest::parse(token.into_inner(), query.as_deref())?;

    let response = match services.handle_sync(&request).await? {
        SyncOutcome::Fragment(fragment) => {
            debug!(
                "✅ Sync answered with {} rooms in {:?}",
                fragment.joined_room_ids().count(),
                start.elapsed()
            );
            Json(fragment).into_response()
        }
        SyncOutcome::Passthrough(reply) => relay(reply)?,
    };
    Ok(response)
}

fn relay(reply: UpstreamReply) -> Result<Response, GatewayError> {
    let status = StatusCode::from_u16(reply.status)
        .map_err(|e| GatewayError::Internal(format!("Upstream sent invalid status: {}", e)))?;
    let mut builder = Response::builder().status(status);
    if let Some(content_type) = &reply.content_type {
        builder = builder.header(CONTENT_TYPE, content_type);
    }
    builder
        .body(Body::from(reply.body))
        .map_err(|e| GatewayError::Internal(format!("Failed to build relayed response: {}", e)))
}
