// =============================================================================
// Matrixon Sync Gateway - Room Info Cache Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Process-wide cache of room state snapshots with member counts. Lifetime
//   grows with the size of the room state so large rooms are refetched less
//   often. Expired entries are never served.
//
// =============================================================================

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::{stream, StreamExt, TryStreamExt};
use matrixon_gateway_core::{GatewayError, Result, SyncEvent};
use serde::Serialize;
use tracing::{debug, instrument};

use crate::{config::RoomInfoCacheConfig, upstream::Homeserver};

/// Cached state of one room.
#[derive(Debug, Clone, Serialize)]
pub struct RoomInfoEntry {
    pub room_id: String,
    /// Full state as returned by `/rooms/{roomId}/state`
    pub room_state: Vec<SyncEvent>,
    pub state_count: usize,
    /// Member events counted by membership
    pub member_counts: BTreeMap<String, usize>,
    pub expires_at: DateTime<Utc>,
}

impl RoomInfoEntry {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    pub fn members_with(&self, membership: &str) -> usize {
        self.member_counts.get(membership).copied().unwrap_or(0)
    }
}

pub struct RoomInfoCache {
    entries: DashMap<String, Arc<RoomInfoEntry>>,
    base_ttl: Duration,
    extra_ttl_per_state: Duration,
}

impl RoomInfoCache {
    pub fn new(config: &RoomInfoCacheConfig) -> Self {
        Self {
            entries: DashMap::new(),
            base_ttl: Duration::from_millis(config.base_ttl_ms),
            extra_ttl_per_state: Duration::from_millis(config.extra_ttl_per_state_ms),
        }
    }

    /// Lifetime of a snapshot with `state_count` state events.
    pub fn ttl_for(&self, state_count: usize) -> Duration {
        let count = u32::try_from(state_count).unwrap_or(u32::MAX);
        self.extra_ttl_per_state
            .checked_mul(count)
            .and_then(|extra| self.base_ttl.checked_add(extra))
            .unwrap_or(Duration::MAX)
    }

    /// Stores a fresh snapshot, replacing any previous one.
    pub fn insert(&self, room_id: &str, room_state: Vec<SyncEvent>) -> Arc<RoomInfoEntry> {
        self.insert_at(room_id, room_state, Utc::now())
    }

    pub fn insert_at(
        &self,
        room_id: &str,
        room_state: Vec<SyncEvent>,
        now: DateTime<Utc>,
    ) -> Arc<RoomInfoEntry> {
        let mut member_counts = BTreeMap::new();
        for membership in room_state.iter().filter_map(SyncEvent::membership) {
            *member_counts.entry(membership.to_owned()).or_insert(0) += 1;
        }

        let state_count = room_state.len();
        let ttl = chrono::Duration::from_std(self.ttl_for(state_count))
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let entry = Arc::new(RoomInfoEntry {
            room_id: room_id.to_owned(),
            room_state,
            state_count,
            member_counts,
            expires_at: now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        });

        debug!("💾 Cached {} state events for {} until {}", state_count, room_id, entry.expires_at);
        self.entries.insert(room_id.to_owned(), Arc::clone(&entry));
        entry
    }

    /// Unexpired snapshot of `room_id`.
    pub fn get(&self, room_id: &str) -> Option<Arc<RoomInfoEntry>> {
        self.get_at(room_id, Utc::now())
    }

    pub fn get_at(&self, room_id: &str, now: DateTime<Utc>) -> Option<Arc<RoomInfoEntry>> {
        let entry = self.entries.get(room_id)?.value().clone();
        if entry.is_expired_at(now) {
            self.entries
                .remove_if(room_id, |_, current| current.is_expired_at(now));
            return None;
        }
        Some(entry)
    }

    /// Drops expired snapshots. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired_at(now));
        before.saturating_sub(self.entries.len())
    }

    /// Every unexpired snapshot, for the admin dump.
    pub fn snapshot(&self) -> Vec<Arc<RoomInfoEntry>> {
        let now = Utc::now();
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .filter(|entry| !entry.is_expired_at(now))
            .map(|entry| entry.value().clone())
            .collect();
        entries.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Info for every room the user has joined. Cached rooms are served from
    /// the cache, the rest are fetched `concurrency` at a time and cached.
    #[instrument(level = "debug", skip(self, homeserver))]
    pub async fn joined_rooms_with_info(
        &self,
        homeserver: &dyn Homeserver,
        concurrency: usize,
    ) -> Result<Vec<Arc<RoomInfoEntry>>> {
        let rooms = homeserver.joined_rooms().await?;
        let mut cached = Vec::with_capacity(rooms.len());
        let mut missing = Vec::new();
        for room_id in rooms {
            match self.get(&room_id) {
                Some(entry) => cached.push(entry),
                None => missing.push(room_id),
            }
        }

        let fetched: Vec<Arc<RoomInfoEntry>> = stream::iter(missing)
            .map(|room_id| async move {
                let state = homeserver.room_state(&room_id).await?;
                Ok::<_, GatewayError>(self.insert(&room_id, state))
            })
            .buffer_unordered(concurrency.max(1))
            .try_collect()
            .await?;

        debug!("📊 {} rooms from cache, {} fetched", cached.len(), fetched.len());
        cached.extend(fetched);
        cached.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        Ok(cached)
    }
}
