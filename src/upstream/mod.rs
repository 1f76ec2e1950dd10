// =============================================================================
// Matrixon Sync Gateway - Upstream Homeserver Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   The seam between the gateway and real homeservers. `HomeserverConnector`
//   turns a (server, credential) pair into an authenticated `Homeserver`
//   handle; everything above this module only talks to these two traits.
//
// =============================================================================

use std::{collections::HashSet, sync::Arc, time::Duration};

use async_trait::async_trait;
use matrixon_gateway_core::{MessagesResponse, Result, SyncEvent, WhoAmI};

pub mod http;

pub use http::HttpConnector;

/// Raw upstream `/sync` reply, relayed as-is in passthrough mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamReply {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl UpstreamReply {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Pagination direction for room messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Backward,
    Forward,
}

impl Direction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Backward => "b",
            Self::Forward => "f",
        }
    }
}

/// A homeserver client bound to one user's credential.
#[async_trait]
pub trait Homeserver: Send + Sync {
    /// Server name the handle was opened for
    fn server_name(&self) -> &str;

    /// Owner of the credential
    fn whoami(&self) -> &WhoAmI;

    /// `GET /sync` with an already encoded query string. Non-2xx replies are
    /// returned, not turned into errors, so they can be relayed.
    async fn sync(&self, query: &str) -> Result<UpstreamReply>;

    async fn joined_rooms(&self) -> Result<Vec<String>>;

    /// Room ids listed in the user's `m.direct` account data. No data is an
    /// empty set, not an error.
    async fn direct_rooms(&self) -> Result<HashSet<String>>;

    async fn room_state(&self, room_id: &str) -> Result<Vec<SyncEvent>>;

    async fn room_messages(
        &self,
        room_id: &str,
        limit: u32,
        dir: Direction,
    ) -> Result<MessagesResponse>;
}

/// Opens authenticated homeserver handles.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait HomeserverConnector: Send + Sync {
    /// Readies `server` for `whoami` calls, e.g. by resolving its base URL.
    /// Not covered by the per-candidate lookup timeout.
    async fn prepare(&self, _server: &str) -> Result<()> {
        Ok(())
    }

    /// Asks `server` who owns `credential`.
    async fn whoami(&self, server: &str, credential: &str) -> Result<WhoAmI>;

    /// Authenticated handle for `server`, reused across calls with the same
    /// credential.
    async fn connect(&self, server: &str, credential: &str) -> Result<Arc<dyn Homeserver>>;

    /// Drops anything cached for a credential the homeserver rejected.
    fn forget(&self, _credential: &str) {}

    /// Drops cached handles not used for `max_idle`, returning how many went.
    fn prune_idle(&self, _max_idle: Duration) -> usize {
        0
    }
}
