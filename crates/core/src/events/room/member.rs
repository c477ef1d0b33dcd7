//! Types for the `m.room.member` event.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::serde::{CanonicalJsonValue, JsonValue};
use crate::OwnedUserId;

/// The content of an `m.room.member` event.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RoomMemberEventContent {
    /// The membership state of this user.
    pub membership: MembershipState,

    /// The avatar of this user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub avatar_url: Option<String>,

    /// The display name for this user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub displayname: Option<String>,

    /// Flag indicating whether the room containing this event was created
    /// with the intention of being a direct chat.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_direct: Option<bool>,

    /// If this member event is the successor to a third party invitation,
    /// this field contains information about that invitation.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub third_party_invite: Option<ThirdPartyInvite>,

    /// The reason for leaving or joining a room.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Arbitrarily chosen user that was permitted to approve a restricted
    /// join.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub join_authorized_via_users_server: Option<OwnedUserId>,
}

impl RoomMemberEventContent {
    /// Creates a content with the given membership and nothing else set.
    pub fn new(membership: MembershipState) -> Self {
        Self {
            membership,
            avatar_url: None,
            displayname: None,
            is_direct: None,
            third_party_invite: None,
            reason: None,
            join_authorized_via_users_server: None,
        }
    }
}

/// The membership state of a user in a room.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum MembershipState {
    /// The user is banned.
    Ban,

    /// The user has been invited.
    Invite,

    /// The user has joined.
    Join,

    /// The user has requested to join.
    Knock,

    /// The user has left.
    Leave,

    /// A membership state this crate has no special handling for.
    Other(String),
}

impl MembershipState {
    /// The wire form of the membership.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Ban => "ban",
            Self::Invite => "invite",
            Self::Join => "join",
            Self::Knock => "knock",
            Self::Leave => "leave",
            Self::Other(s) => s,
        }
    }
}

impl fmt::Display for MembershipState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for MembershipState {
    fn from(s: &str) -> Self {
        match s {
            "ban" => Self::Ban,
            "invite" => Self::Invite,
            "join" => Self::Join,
            "knock" => Self::Knock,
            "leave" => Self::Leave,
            other => Self::Other(other.to_owned()),
        }
    }
}

impl Serialize for MembershipState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MembershipState {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::from(s.as_str()))
    }
}

/// Information about a third party invitation.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ThirdPartyInvite {
    /// A name which can be displayed to represent the user instead of their
    /// third party identifier.
    pub display_name: String,

    /// A block of content which has been signed, which servers can use to
    /// verify the event.
    pub signed: SignedContent,
}

/// A block of content which has been signed, which servers can use to verify
/// a third party invitation.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SignedContent {
    /// The invited Matrix user ID.
    ///
    /// Must be equal to the user_id property of the event.
    pub mxid: OwnedUserId,

    /// A single signature from the verifying server, in the format specified
    /// by the Signing Events section of the server-server API.
    pub signatures: JsonValue,

    /// The token property of the containing `third_party_invite` object.
    pub token: String,
}

impl SignedContent {
    /// The canonical JSON bytes of this block, as they were signed.
    pub fn canonical_json(&self) -> Result<String, crate::serde::CanonicalJsonError> {
        let mut value: CanonicalJsonValue = serde_json::to_value(self)?.try_into()?;
        if let Some(object) = value.as_object_mut() {
            object.remove("signatures");
        }
        Ok(value.to_string())
    }
}

