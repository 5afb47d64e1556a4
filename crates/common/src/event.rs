// Room lifecycle events consumed from the room service's event stream.
//
// Field names are kebab-case on the wire; that is the shape the room
// service publishes and is kept verbatim so both sides can evolve against
// one schema.

use serde::{Deserialize, Serialize};

/// A room create/delete/remove-user event.
///
/// Delivery is at-least-once: the consumer acknowledges an event only after
/// handling it, so every handler must tolerate redelivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomEvent {
    #[serde(rename = "event-type")]
    pub event_type: RoomEventKind,
    pub room: RoomRecord,
    /// Present only on remove-user events.
    #[serde(rename = "removed-user-id", default, skip_serializing_if = "Option::is_none")]
    pub removed_user_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoomEventKind {
    Create,
    Delete,
    RemoveUser,
}

/// The room payload carried by every event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomRecord {
    #[serde(rename = "room-id")]
    pub room_id: String,
    #[serde(rename = "user-ids", default)]
    pub user_ids: Vec<i64>,
    #[serde(rename = "question-id")]
    pub question_id: String,
    #[serde(rename = "question-lang-slug")]
    pub question_lang_slug: String,
}
