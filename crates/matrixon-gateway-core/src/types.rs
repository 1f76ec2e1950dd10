//! Wire and key types
//!
//! The gateway builds `/sync` fragments of its own (preloaded rooms,
//! heartbeats) and relays upstream ones. Every structure keeps unknown fields
//! in an `extra` map and serializes them back untouched.

use std::{collections::BTreeMap, fmt};

use ruma::{OwnedDeviceId, OwnedUserId, UserId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// One `/sync` response, or a fragment of one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncResponse {
    /// Cursor for the next request. Preload fragments carry none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_batch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rooms: Option<Rooms>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub presence: Option<EventList>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_data: Option<EventList>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl SyncResponse {
    /// Fragment holding a single joined room.
    pub fn with_joined_room(room_id: impl Into<String>, room: JoinedRoom) -> Self {
        let mut rooms = Rooms::default();
        rooms.join.insert(room_id.into(), room);
        Self {
            rooms: Some(rooms),
            ..Default::default()
        }
    }

    /// Appends a presence event.
    pub fn push_presence(&mut self, event: SyncEvent) {
        self.presence.get_or_insert_with(EventList::default).events.push(event);
    }

    /// Ids of the joined rooms carried by this fragment.
    pub fn joined_room_ids(&self) -> impl Iterator<Item = &str> {
        self.rooms
            .iter()
            .flat_map(|rooms| rooms.join.keys().map(String::as_str))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Rooms {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub join: BTreeMap<String, JoinedRoom>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JoinedRoom {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<EventList>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeline: Option<Timeline>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<RoomSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_data: Option<EventList>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ephemeral: Option<EventList>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventList {
    #[serde(default)]
    pub events: Vec<SyncEvent>,
}

impl From<Vec<SyncEvent>> for EventList {
    fn from(events: Vec<SyncEvent>) -> Self {
        Self { events }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    #[serde(default)]
    pub events: Vec<SyncEvent>,
    #[serde(default)]
    pub limited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prev_batch: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoomSummary {
    #[serde(rename = "m.heroes", default, skip_serializing_if = "Vec::is_empty")]
    pub heroes: Vec<String>,
    #[serde(rename = "m.joined_member_count", default, skip_serializing_if = "Option::is_none")]
    pub joined_member_count: Option<u64>,
    #[serde(rename = "m.invited_member_count", default, skip_serializing_if = "Option::is_none")]
    pub invited_member_count: Option<u64>,
}

/// A client event as it appears in sync and room endpoints.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub content: Value,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl SyncEvent {
    /// Membership of an `m.room.member` state event.
    pub fn membership(&self) -> Option<&str> {
        if self.kind != "m.room.member" {
            return None;
        }
        self.content.get("membership").and_then(Value::as_str)
    }

    /// `m.presence` event used to carry gateway status text to the client.
    pub fn presence_status(user_id: &UserId, status_msg: impl Into<String>) -> Self {
        Self {
            kind: "m.presence".to_owned(),
            state_key: None,
            sender: Some(user_id.to_string()),
            content: json!({
                "presence": "online",
                "currently_active": true,
                "displayname": "Matrixon Gateway",
                "status_msg": status_msg.into(),
            }),
            extra: BTreeMap::new(),
        }
    }
}

/// Body of `GET /rooms/{roomId}/messages`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessagesResponse {
    #[serde(default)]
    pub chunk: Vec<SyncEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub state: Vec<SyncEvent>,
}

/// Body of `GET /account/whoami`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WhoAmI {
    pub user_id: OwnedUserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_id: Option<OwnedDeviceId>,
    #[serde(default)]
    pub is_guest: bool,
}

/// Who a credential belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserIdentity {
    pub user_id: OwnedUserId,
    /// Candidate homeserver that confirmed the credential, if it was looked up
    /// rather than restored from the token map.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
}

impl UserIdentity {
    pub fn new(user_id: OwnedUserId) -> Self {
        Self {
            user_id,
            resolved_by: None,
        }
    }

    /// Server the user lives on; upstream requests go here.
    pub fn server_name(&self) -> &str {
        self.user_id.server_name().as_str()
    }
}

/// Key of one client's sync session.
///
/// Two requests share a session exactly when user, device, homeserver and
/// credential all match.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub user_id: OwnedUserId,
    pub device_id: Option<OwnedDeviceId>,
    pub homeserver: String,
    pub credential: String,
}

impl SessionKey {
    pub fn new(whoami: &WhoAmI, homeserver: impl Into<String>, credential: impl Into<String>) -> Self {
        Self {
            user_id: whoami.user_id.clone(),
            device_id: whoami.device_id.clone(),
            homeserver: homeserver.into(),
            credential: credential.into(),
        }
    }

    /// Same key with the credential shortened, for logs and debug output.
    pub fn redacted(&self) -> String {
        format!(
            "{}/{}/{}:{}",
            self.user_id,
            self.device_id.as_deref().map(|d| d.as_str()).unwrap_or(""),
            self.homeserver,
            crate::utils::redact_token(&self.credential)
        )
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}:{}",
            self.user_id,
            self.device_id.as_deref().map(|d| d.as_str()).unwrap_or(""),
            self.homeserver,
            self.credential
        )
    }
}
