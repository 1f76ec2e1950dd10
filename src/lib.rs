// =============================================================================
// Matrixon Sync Gateway - Library Crate
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Sync gateway for Matrix homeservers. Resolves access tokens across the
//   configured homeservers, keeps one upstream long-poll per session and
//   serves a fast initial sync from preloaded rooms.
//
// =============================================================================

pub mod api;
pub mod clap;
pub mod config;
pub mod service;
#[cfg(any(test, feature = "testing"))]
pub mod test_utils;
pub mod upstream;

// Re-export common types
pub use ruma;
pub use tokio;
pub use tracing;

// Re-export workspace crates
pub use matrixon_gateway_core as core;

pub use config::Config;
pub use matrixon_gateway_core::{GatewayError, Result};
pub use service::Services;
