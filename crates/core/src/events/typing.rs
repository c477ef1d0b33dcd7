//! Types for the `m.typing` EDU.

use serde::{Deserialize, Serialize};

use crate::{OwnedRoomId, OwnedUserId};

/// The content for an `m.typing` EDU.
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct TypingContent {
    /// The room where the user's typing status has been updated.
    pub room_id: OwnedRoomId,

    /// The user ID that has had their typing status changed.
    pub user_id: OwnedUserId,

    /// Whether the user is typing in the room or not.
    pub typing: bool,
}

impl TypingContent {
    /// Creates a new `TypingContent`.
    pub fn new(room_id: OwnedRoomId, user_id: OwnedUserId, typing: bool) -> Self {
        Self {
            room_id,
            user_id,
            typing,
        }
    }
}
