// =============================================================================
// Matrixon Sync Gateway - API Error Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Turns `GatewayError` into the Matrix error envelope at the HTTP boundary.
//
// =============================================================================

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use matrixon_gateway_core::GatewayError;
use tracing::{error, info};

/// Error returned by handlers.
#[derive(Debug)]
pub struct ErrorResponse(pub GatewayError);

impl From<GatewayError> for ErrorResponse {
    fn from(error: GatewayError) -> Self {
        Self(error)
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::BAD_GATEWAY);

        match &self.0 {
            GatewayError::Config(_) | GatewayError::Internal(_) => {
                error!("❌ Request failed: {}", self.0)
            }
            e if e.is_auth() => info!("🔒 Rejected request: {}", e),
            e => info!("⚠️ Request failed with {}: {}", status, e),
        }

        (status, Json(self.0.to_envelope(cfg!(debug_assertions)))).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ErrorResponse>;

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use matrixon_gateway_core::ErrorEnvelope;
    use serde_json::Value;

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_missing_token_maps_to_401() {
        let response = ErrorResponse(GatewayError::MissingCredential).into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["errcode"], "M_MISSING_TOKEN");
    }

    #[tokio::test]
    async fn test_upstream_error_is_passed_through() {
        let response = ErrorResponse(GatewayError::UpstreamProtocol {
            status: 429,
            envelope: ErrorEnvelope {
                errcode: "M_LIMIT_EXCEEDED".into(),
                error: "Too many requests".into(),
                soft_logout: None,
                retry_after_ms: Some(2000),
            },
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let body = body_json(response).await;
        assert_eq!(body["errcode"], "M_LIMIT_EXCEEDED");
        assert_eq!(body["retry_after_ms"], 2000);
        assert!(body.get("soft_logout").is_none());
    }

    #[tokio::test]
    async fn test_soft_logout_is_preserved() {
        let response = ErrorResponse(GatewayError::TokenRejected {
            error: "Token expired".into(),
            soft_logout: true,
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        let body = body_json(response).await;
        assert_eq!(body["errcode"], "M_UNKNOWN_TOKEN");
        assert_eq!(body["soft_logout"], true);
    }
}
