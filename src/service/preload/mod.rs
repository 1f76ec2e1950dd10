// =============================================================================
// Matrixon Sync Gateway - Preload Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Fast initial sync. For a fresh session every joined room is fetched
//   directly (state plus recent messages), turned into a single-room sync
//   fragment and staged on the session as soon as it is ready. Rooms are
//   started in priority order with bounded concurrency.
//
// =============================================================================

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Instant,
};

use matrixon_gateway_core::{
    utils::format_duration, GatewayError, JoinedRoom, Result, RoomSummary, SyncEvent,
    SyncResponse, Timeline,
};
use tokio::{sync::Semaphore, task::JoinSet};
use tracing::{debug, info, instrument, warn};

use crate::{
    config::Config,
    service::{room_info::RoomInfoCache, sessions::SyncState},
    upstream::Direction,
};

pub mod score;

pub use score::RoomPreloadJob;

const MAX_HEROES: usize = 5;

pub struct PreloadEngine {
    room_info: Arc<RoomInfoCache>,
    weights: HashMap<String, i64>,
    concurrency: usize,
    timeline_limit: u32,
    use_room_info_cache: bool,
}

impl PreloadEngine {
    pub fn new(config: &Config, room_info: Arc<RoomInfoCache>) -> Self {
        Self {
            room_info,
            weights: config.homeserver_weights.clone(),
            concurrency: config.fast_initial_sync.preload_concurrency.max(1),
            timeline_limit: config.fast_initial_sync.timeline_limit,
            use_room_info_cache: config.fast_initial_sync.use_room_info_cache,
        }
    }

    /// Starts a detached preload of `state`. The task outlives the request
    /// that triggered it.
    pub fn spawn(self: &Arc<Self>, state: &Arc<SyncState>) {
        let engine = Arc::clone(self);
        let task_state = Arc::clone(state);
        let task = tokio::spawn(async move {
            if let Err(e) = engine.preload(&task_state).await {
                warn!("⚠️ Preload for {} failed: {}", task_state.key().redacted(), e);
            }
        });
        state.set_preload_task(task);
    }

    /// Preloads every joined room of the session. Returns how many rooms were
    /// staged; rooms that fail are logged and skipped.
    #[instrument(level = "debug", skip(self, state), fields(session = %state.key().redacted()))]
    pub async fn preload(self: &Arc<Self>, state: &Arc<SyncState>) -> Result<usize> {
        let start = Instant::now();
        let homeserver = Arc::clone(state.homeserver());
        let user_id = homeserver.whoami().user_id.clone();

        let rooms = homeserver.joined_rooms().await?;
        let direct = match homeserver.direct_rooms().await {
            Ok(direct) => direct,
            Err(e) => {
                warn!("⚠️ Could not read m.direct for {}, no rooms treated as DMs: {}", user_id, e);
                HashSet::new()
            }
        };

        let jobs = score::plan(rooms, &direct, user_id.server_name().as_str(), &self.weights);
        let total = jobs.len();
        info!("🔧 Preloading {} rooms for {}", total, user_id);

        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        for job in jobs {
            // Acquired before spawning so rooms start in priority order.
            let permit = Arc::clone(&permits)
                .acquire_owned()
                .await
                .map_err(|e| GatewayError::Internal(format!("Preload pool closed: {}", e)))?;
            let engine = Arc::clone(self);
            let state = Arc::clone(state);
            tasks.spawn(async move {
                let _permit = permit;
                match engine.load_room(&state, &job).await {
                    Ok(fragment) => {
                        state.enqueue(fragment);
                        true
                    }
                    Err(e) => {
                        warn!("⚠️ Skipping {} during preload: {}", job.room_id, e);
                        false
                    }
                }
            });
        }

        let mut loaded = 0;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(true) => loaded += 1,
                Ok(false) => {}
                Err(e) => warn!("⚠️ Preload task ended abnormally: {}", e),
            }
        }

        info!(
            "✅ Preloaded {}/{} rooms for {} in {:?}",
            loaded,
            total,
            user_id,
            start.elapsed()
        );
        Ok(loaded)
    }

    /// Builds the sync fragment of one room.
    #[instrument(level = "debug", skip(self, state, job), fields(room = %job.room_id, score = job.score))]
    pub async fn load_room(&self, state: &SyncState, job: &RoomPreloadJob) -> Result<SyncResponse> {
        let start = Instant::now();
        let homeserver = state.homeserver();

        let cached = if self.use_room_info_cache {
            self.room_info.get(&job.room_id)
        } else {
            None
        };
        let room_state = match cached {
            Some(entry) => {
                debug!("💾 Using cached state for {}", job.room_id);
                entry.room_state.clone()
            }
            None => {
                let events = homeserver.room_state(&job.room_id).await?;
                if self.use_room_info_cache {
                    self.room_info.insert(&job.room_id, events.clone());
                }
                events
            }
        };

        let mut messages = homeserver
            .room_messages(&job.room_id, self.timeline_limit, Direction::Backward)
            .await?;
        // Backward pagination is newest first.
        messages.chunk.reverse();

        let user_id = &homeserver.whoami().user_id;
        let summary = summarize(&room_state, user_id.as_str());
        let state_count = room_state.len();
        let timeline_count = messages.chunk.len();

        let room = JoinedRoom {
            state: Some(room_state.into()),
            timeline: Some(Timeline {
                limited: messages.end.is_some(),
                prev_batch: messages.end,
                events: messages.chunk,
            }),
            summary: Some(summary),
            ..Default::default()
        };

        let mut fragment = SyncResponse::with_joined_room(job.room_id.clone(), room);
        fragment.push_presence(SyncEvent::presence_status(
            user_id,
            format!(
                "Preloaded {} ({} state, {} timeline) in {}",
                job.room_id,
                state_count,
                timeline_count,
                format_duration(start.elapsed())
            ),
        ));
        Ok(fragment)
    }
}

/// Member counts and heroes from a room's state.
pub fn summarize(state: &[SyncEvent], own_user: &str) -> RoomSummary {
    let mut summary = RoomSummary {
        heroes: Vec::new(),
        joined_member_count: Some(0),
        invited_member_count: Some(0),
    };
    for event in state {
        let counter = match event.membership() {
            Some("join") => &mut summary.joined_member_count,
            Some("invite") => &mut summary.invited_member_count,
            _ => continue,
        };
        *counter = counter.map(|n| n + 1);

        if let Some(member) = event.state_key.as_deref() {
            if member != own_user && summary.heroes.len() < MAX_HEROES {
                summary.heroes.push(member.to_owned());
            }
        }
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        test_utils::{member_event, sample_key, FakeHomeserver},
        upstream::Homeserver,
    };
    use test_log::test;

    fn engine(concurrency: usize) -> Arc<PreloadEngine> {
        let mut config = Config::with_auth_homeservers(["home.example"]);
        config.fast_initial_sync.preload_concurrency = concurrency;
        let room_info = Arc::new(RoomInfoCache::new(&config.room_info_cache));
        Arc::new(PreloadEngine::new(&config, room_info))
    }

    fn session(homeserver: Arc<FakeHomeserver>) -> Arc<SyncState> {
        let homeserver: Arc<dyn Homeserver> = homeserver;
        Arc::new(SyncState::new(
            sample_key("@alice:home.example"),
            homeserver,
            None,
            Vec::new(),
        ))
    }

    #[test(tokio::test)]
    async fn test_rooms_start_in_priority_order() {
        let homeserver = Arc::new(
            FakeHomeserver::new("@alice:home.example")
                .with_room("!r3:unknown.example", vec![member_event("@alice:home.example", "join")])
                .with_room("!r2:home.example", vec![member_event("@alice:home.example", "join")])
                .with_room("!r1:far.example", vec![member_event("@alice:home.example", "join")])
                .with_direct_room("!r1:far.example"),
        );
        let state = session(Arc::clone(&homeserver));

        let loaded = engine(1).preload(&state).await.unwrap();
        assert_eq!(loaded, 3);
        assert_eq!(
            homeserver.state_requests(),
            vec!["!r1:far.example", "!r2:home.example", "!r3:unknown.example"]
        );

        let staged: Vec<_> = std::iter::from_fn(|| state.dequeue())
            .flat_map(|f| f.joined_room_ids().map(str::to_owned).collect::<Vec<_>>())
            .collect();
        assert_eq!(staged, vec!["!r1:far.example", "!r2:home.example", "!r3:unknown.example"]);
    }

    #[test(tokio::test)]
    async fn test_failing_room_is_skipped() {
        let homeserver = Arc::new(
            FakeHomeserver::new("@alice:home.example")
                .with_room("!ok:home.example", Vec::new())
                .with_room("!broken:home.example", Vec::new())
                .with_failing_room("!broken:home.example"),
        );
        let state = session(homeserver);

        assert_eq!(engine(4).preload(&state).await.unwrap(), 1);
        let fragment = state.dequeue().unwrap();
        assert_eq!(fragment.joined_room_ids().collect::<Vec<_>>(), vec!["!ok:home.example"]);
        assert!(fragment.next_batch.is_none());
        assert!(state.dequeue().is_none());
    }

    #[test(tokio::test)]
    async fn test_fragment_contents() {
        let homeserver = Arc::new(
            FakeHomeserver::new("@alice:home.example")
                .with_room(
                    "!room:home.example",
                    vec![
                        member_event("@alice:home.example", "join"),
                        member_event("@bob:home.example", "join"),
                        member_event("@carol:home.example", "invite"),
                    ],
                )
                .with_messages("!room:home.example", &["$3", "$2", "$1"], Some("t_end")),
        );
        let state = session(homeserver);
        let engine = engine(2);
        let job = RoomPreloadJob {
            room_id: "!room:home.example".into(),
            score: 200,
        };

        let fragment = engine.load_room(&state, &job).await.unwrap();
        let room = &fragment.rooms.as_ref().unwrap().join["!room:home.example"];
        let timeline = room.timeline.as_ref().unwrap();
        let ids: Vec<_> = timeline
            .events
            .iter()
            .map(|e| e.extra["event_id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec!["$1", "$2", "$3"]);
        assert_eq!(timeline.prev_batch.as_deref(), Some("t_end"));

        let summary = room.summary.as_ref().unwrap();
        assert_eq!(summary.joined_member_count, Some(2));
        assert_eq!(summary.invited_member_count, Some(1));
        assert_eq!(summary.heroes, vec!["@bob:home.example", "@carol:home.example"]);
        assert_eq!(fragment.presence.as_ref().unwrap().events[0].kind, "m.presence");
    }

    #[test(tokio::test)]
    async fn test_cached_state_is_reused() {
        let homeserver = Arc::new(
            FakeHomeserver::new("@alice:home.example").with_room("!room:home.example", Vec::new()),
        );
        let state = session(Arc::clone(&homeserver));
        let engine = engine(1);
        let job = RoomPreloadJob {
            room_id: "!room:home.example".into(),
            score: 200,
        };

        engine.load_room(&state, &job).await.unwrap();
        engine.load_room(&state, &job).await.unwrap();
        assert_eq!(homeserver.state_requests().len(), 1);
    }
}
