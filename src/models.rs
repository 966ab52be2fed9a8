use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{broker::RoomId, identity::Identity};

pub const ANONYMOUS: &str = "Anonymous";

/// Author as rendered to clients. An author whose user record is gone is
/// rendered as `{ "name": "Anonymous" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Author {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl Author {
    pub fn anonymous() -> Self {
        Self {
            id: None,
            name: ANONYMOUS.to_owned(),
            avatar: None,
        }
    }
}

impl From<Identity> for Author {
    fn from(Identity { id, name, avatar }: Identity) -> Self {
        Self {
            id: Some(id),
            name,
            avatar,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: Uuid,
    pub room_id: RoomId,
    pub text: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub author: Author,
}

impl ChatMessage {
    /// Stamps a new message with a fresh id and the current time.
    pub fn new(room_id: impl Into<RoomId>, text: impl Into<String>, author: Author) -> Self {
        Self {
            id: Uuid::now_v7(),
            room_id: room_id.into(),
            text: text.into(),
            created_at: now_millis(),
            author,
        }
    }

    /// Creation time as Unix milliseconds, the precision the history store keeps.
    pub fn created_at_millis(&self) -> i64 {
        (self.created_at.unix_timestamp_nanos() / 1_000_000) as i64
    }
}

/// Current UTC time truncated to milliseconds.
fn now_millis() -> OffsetDateTime {
    let now = OffsetDateTime::now_utc();
    now.replace_millisecond(now.millisecond()).unwrap_or(now)
}
