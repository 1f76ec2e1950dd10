//! Error types for the sync gateway
//!
//! Every failure the gateway can hand back to a client is a [`GatewayError`].
//! Each variant knows its Matrix `errcode` and HTTP status, and renders into the
//! standard Matrix error envelope `{"errcode": ..., "error": ...}`. Errors that
//! came from an upstream homeserver keep that server's envelope so clients see
//! exactly what the homeserver said.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result alias used across the gateway.
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Standard Matrix error body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// Machine readable code such as `M_UNKNOWN_TOKEN`
    pub errcode: String,
    /// Human readable description
    #[serde(default)]
    pub error: String,
    /// Set by homeservers when the client may re-authenticate without losing data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soft_logout: Option<bool>,
    /// Rate limit hint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ErrorEnvelope {
    pub fn new(errcode: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            errcode: errcode.into(),
            error: error.into(),
            soft_logout: None,
            retry_after_ms: None,
        }
    }

    /// Parses a Matrix error body. Returns `None` if the body has no `errcode`.
    pub fn from_body(body: &[u8]) -> Option<Self> {
        serde_json::from_slice::<Self>(body)
            .ok()
            .filter(|envelope| !envelope.errcode.is_empty())
    }
}

/// Everything that can go wrong while serving a client request.
#[derive(Debug, Clone, Error)]
pub enum GatewayError {
    #[error("Missing access token")]
    MissingCredential,

    #[error("Token not found on any configured homeservers: {}", .candidates.join(", "))]
    UnknownCredential { candidates: Vec<String> },

    #[error("Access token rejected by homeserver: {error}")]
    TokenRejected { error: String, soft_logout: bool },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Upstream error {status}: {}: {}", .envelope.errcode, .envelope.error)]
    UpstreamProtocol { status: u16, envelope: ErrorEnvelope },

    #[error("Network error: {0}")]
    TransientNetwork(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Classifies a non-success reply from an upstream homeserver.
    ///
    /// `M_UNKNOWN_TOKEN` becomes [`GatewayError::TokenRejected`]; any other
    /// Matrix error keeps its envelope. Bodies that are not Matrix errors get a
    /// synthesized `M_UNKNOWN` envelope carrying the status.
    pub fn from_upstream(status: u16, body: &[u8]) -> Self {
        match ErrorEnvelope::from_body(body) {
            Some(envelope) if envelope.errcode == "M_UNKNOWN_TOKEN" => Self::TokenRejected {
                error: envelope.error,
                soft_logout: envelope.soft_logout.unwrap_or(false),
            },
            Some(envelope) => Self::UpstreamProtocol { status, envelope },
            None => Self::UpstreamProtocol {
                status,
                envelope: ErrorEnvelope::new(
                    "M_UNKNOWN",
                    format!("Upstream homeserver returned HTTP {}", status),
                ),
            },
        }
    }

    /// Matrix error code for this error.
    pub fn errcode(&self) -> &str {
        match self {
            Self::MissingCredential => "M_MISSING_TOKEN",
            Self::UnknownCredential { .. } | Self::TokenRejected { .. } => "M_UNKNOWN_TOKEN",
            Self::Forbidden(_) => "M_FORBIDDEN",
            Self::BadRequest(_) => "M_INVALID_PARAM",
            Self::UpstreamProtocol { envelope, .. } => &envelope.errcode,
            Self::TransientNetwork(_) | Self::Config(_) | Self::Internal(_) => "M_UNKNOWN",
        }
    }

    /// HTTP status the error maps to.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::MissingCredential | Self::UnknownCredential { .. } | Self::TokenRejected { .. } => 401,
            Self::Forbidden(_) => 403,
            Self::BadRequest(_) => 400,
            Self::UpstreamProtocol { status, .. } => *status,
            Self::TransientNetwork(_) => 502,
            Self::Config(_) | Self::Internal(_) => 500,
        }
    }

    /// Renders the client facing envelope.
    ///
    /// Internal details are only included when `expose_internal` is set.
    pub fn to_envelope(&self, expose_internal: bool) -> ErrorEnvelope {
        match self {
            Self::UpstreamProtocol { envelope, .. } => envelope.clone(),
            Self::TokenRejected { error, soft_logout } => ErrorEnvelope {
                errcode: "M_UNKNOWN_TOKEN".to_owned(),
                error: error.clone(),
                soft_logout: Some(*soft_logout),
                retry_after_ms: None,
            },
            Self::Config(_) | Self::Internal(_) if !expose_internal => {
                ErrorEnvelope::new("M_UNKNOWN", "Internal server error")
            }
            other => ErrorEnvelope::new(other.errcode(), other.to_string()),
        }
    }

    /// True for failures that mean the credential is unusable.
    pub fn is_auth(&self) -> bool {
        matches!(
            self,
            Self::MissingCredential | Self::UnknownCredential { .. } | Self::TokenRejected { .. }
        )
    }

    /// True for failures worth a single retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::TransientNetwork(_))
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        Self::Internal(format!("Invalid JSON: {}", err))
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(format!("I/O error: {}", err))
    }
}

impl From<tokio::time::error::Elapsed> for GatewayError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Self::TransientNetwork("Upstream request timed out".to_owned())
    }
}
