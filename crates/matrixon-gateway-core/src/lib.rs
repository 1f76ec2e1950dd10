//! Matrixon Sync Gateway Core Library
//!
//! Author: arkSong <arksong2018@gmail.com>
//! Version: 0.11.0-alpha
//! Date: 2024-12-11
//!
//! Shared building blocks of the sync gateway: the error taxonomy with its
//! Matrix error envelope, the `/sync` wire types that the gateway assembles and
//! relays, session and identity keys, and small formatting helpers.
//!
//! # Examples
//! ```rust
//! use matrixon_gateway_core::{GatewayError, Result};
//!
//! fn check(token: Option<&str>) -> Result<&str> {
//!     token.ok_or(GatewayError::MissingCredential)
//! }
//!
//! assert!(check(None).is_err());
//! ```

pub mod error;
pub mod types;
pub mod utils;

pub use error::{ErrorEnvelope, GatewayError, Result};
pub use types::{
    EventList, JoinedRoom, MessagesResponse, RoomSummary, Rooms, SessionKey, SyncEvent,
    SyncResponse, Timeline, UserIdentity, WhoAmI,
};

/// Cursor handed to clients when no upstream cursor is known yet.
///
/// A client that sends it back is treated exactly like one without a cursor.
pub const PLACEHOLDER_CURSOR: &str = "matrixon_gateway_preload";

/// Returns true when `since` carries no usable upstream position.
pub fn is_empty_cursor(since: Option<&str>) -> bool {
    match since {
        None => true,
        Some(s) => s.is_empty() || s == "null" || s == PLACEHOLDER_CURSOR,
    }
}
