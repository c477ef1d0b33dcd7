//! Types for the `m.room.create` event.

use serde::{Deserialize, Serialize};

use crate::{OwnedRoomId, OwnedUserId, RoomVersionId};

/// The content of an `m.room.create` event.
///
/// This is the first event in a room and cannot be changed.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RoomCreateEventContent {
    /// The `user_id` of the room creator.
    ///
    /// Absent since room v11, where the creator is the event's `sender`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creator: Option<OwnedUserId>,

    /// Whether users on other servers can join this room.
    #[serde(
        rename = "m.federate",
        default = "crate::serde::default_true",
        skip_serializing_if = "crate::serde::is_true"
    )]
    pub federate: bool,

    /// The version of the room.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_version: Option<RoomVersionId>,

    /// A reference to the room this room replaces, if the previous room was
    /// upgraded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub predecessor: Option<PreviousRoom>,
}

/// A reference to an old room replaced during a room version upgrade.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PreviousRoom {
    /// The ID of the old room.
    pub room_id: OwnedRoomId,
}

#[cfg(test)]
mod tests {
    use super::RoomCreateEventContent;

    #[test]
    fn federate_defaults_to_true() {
        let content: RoomCreateEventContent = serde_json::from_str("{}").unwrap();
        assert!(content.federate);
        assert!(content.creator.is_none());

        let content: RoomCreateEventContent =
            serde_json::from_str(r#"{"m.federate":false,"room_version":"10"}"#).unwrap();
        assert!(!content.federate);
        assert_eq!(content.room_version.unwrap().as_str(), "10");
    }
}
