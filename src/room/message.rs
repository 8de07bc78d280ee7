use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use ts_rs::TS;

use super::MemberId;

/// Name of the broadcast event carrying typing latches.
pub const TYPING_EVENT: &str = "typing";

/// Topic a room's presence channel binds to.
pub fn presence_topic(room_id: &super::RoomId) -> String {
    format!("presence:room:{room_id}")
}

/// Metadata attached to the local member's presence record.
#[derive(Debug, Clone, Serialize, Deserialize, TS, PartialEq)]
#[ts(export)]
pub struct PresenceMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,
    /// Last activity, milliseconds since the Unix epoch on the wire.
    #[serde(with = "chrono::serde::ts_milliseconds")]
    #[ts(type = "number")]
    pub at: DateTime<Utc>,
}

impl PresenceMeta {
    pub fn new(nickname: Option<String>) -> Self {
        Self {
            nickname,
            at: Utc::now(),
        }
    }

    /// Same metadata with the activity timestamp moved to now.
    pub fn refreshed(&self) -> Self {
        Self {
            nickname: self.nickname.clone(),
            at: Utc::now(),
        }
    }
}

/// Ephemeral typing latch for one member.
#[derive(Debug, Clone, Serialize, Deserialize, TS, PartialEq, Eq)]
#[ts(export)]
#[serde(rename_all = "camelCase")]
pub struct TypingEvent {
    pub member_id: MemberId,
    pub is_typing: bool,
}

impl TypingEvent {
    pub fn new(member_id: impl Into<MemberId>, is_typing: bool) -> Self {
        Self {
            member_id: member_id.into(),
            is_typing,
        }
    }
}

/// Events a transport delivers on a subscribed topic.
///
/// Payloads stay untyped here: they come from other clients and are parsed
/// (and rejected) by the component that consumes them.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// Full presence state: member key -> list of records, one per connection.
    Sync(Value),
    /// Named ephemeral broadcast.
    Broadcast { event: String, payload: Value },
}
