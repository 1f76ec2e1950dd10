//! Preload ordering
//!
//! Rooms are preloaded cheapest-first: direct messages, then rooms on the
//! user's own server, then rooms on known servers by estimated size, and
//! finally rooms on unknown servers.

use std::collections::{HashMap, HashSet};

use matrixon_gateway_core::utils::{localpart_of, server_name_of};

pub const DIRECT_MESSAGE_SCORE: i64 = -1;
pub const OWN_SERVER_SCORE: i64 = 200;
pub const UNKNOWN_SERVER_SCORE: i64 = 5000;

/// One room waiting to be preloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomPreloadJob {
    pub room_id: String,
    /// Lower is fetched first
    pub score: i64,
}

/// Priority of a room, lower first.
pub fn score(
    room_id: &str,
    is_direct: bool,
    own_server: &str,
    weights: &HashMap<String, i64>,
) -> i64 {
    if is_direct {
        return DIRECT_MESSAGE_SCORE;
    }
    match server_name_of(room_id) {
        Some(server) if server == own_server => OWN_SERVER_SCORE,
        Some(server) => match weights.get(server) {
            Some(weight) => weight + localpart_of(room_id).len() as i64,
            None => UNKNOWN_SERVER_SCORE,
        },
        None => UNKNOWN_SERVER_SCORE,
    }
}

/// Scores and orders the rooms. Ties keep their listing order.
pub fn plan(
    rooms: Vec<String>,
    direct: &HashSet<String>,
    own_server: &str,
    weights: &HashMap<String, i64>,
) -> Vec<RoomPreloadJob> {
    let mut jobs: Vec<_> = rooms
        .into_iter()
        .map(|room_id| RoomPreloadJob {
            score: score(&room_id, direct.contains(&room_id), own_server, weights),
            room_id,
        })
        .collect();
    jobs.sort_by_key(|job| job.score);
    jobs
}
