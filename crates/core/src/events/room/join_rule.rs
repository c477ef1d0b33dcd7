//! Types for the `m.room.join_rules` event.

use serde::{
    de::{Deserializer, Error},
    Deserialize, Serialize,
};

use crate::serde::{from_raw_json_value, RawJsonValue};
use crate::OwnedRoomId;

/// The content of an `m.room.join_rules` event.
///
/// Describes how users are allowed to join the room.
#[derive(Clone, Debug, Serialize)]
pub struct RoomJoinRulesEventContent {
    /// The type of rules used for users wishing to join this room.
    #[serde(flatten)]
    pub join_rule: JoinRule,
}

impl RoomJoinRulesEventContent {
    /// Creates a new `RoomJoinRulesEventContent` with the given rule.
    pub fn new(join_rule: JoinRule) -> Self {
        Self { join_rule }
    }
}

impl<'de> Deserialize<'de> for RoomJoinRulesEventContent {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let join_rule = JoinRule::deserialize(deserializer)?;
        Ok(RoomJoinRulesEventContent { join_rule })
    }
}

/// The rule used for users wishing to join this room.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
#[serde(tag = "join_rule", rename_all = "snake_case")]
#[non_exhaustive]
pub enum JoinRule {
    /// A user who wishes to join the room must first receive an invite from
    /// someone already in the room.
    Invite,

    /// Users can join the room if they are invited, or they can request an
    /// invite.
    Knock,

    /// Reserved without implementation, not implemented by the Matrix spec.
    Private,

    /// Users can join the room if they are members of a room named in the
    /// `allow` rules.
    Restricted(Restricted),

    /// Users can join the room if they are members of a room named in the
    /// `allow` rules, or they can request an invite.
    KnockRestricted(Restricted),

    /// Anyone can join the room without any prior action.
    Public,
}

impl JoinRule {
    /// The string form of the rule.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Invite => "invite",
            Self::Knock => "knock",
            Self::Private => "private",
            Self::Restricted(_) => "restricted",
            Self::KnockRestricted(_) => "knock_restricted",
            Self::Public => "public",
        }
    }
}

impl<'de> Deserialize<'de> for JoinRule {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let json = Box::<RawJsonValue>::deserialize(deserializer)?;

        #[derive(Deserialize)]
        struct JoinRuleDeHelper {
            join_rule: String,
        }

        let JoinRuleDeHelper { join_rule } = from_raw_json_value(&json)?;

        match join_rule.as_str() {
            "invite" => Ok(Self::Invite),
            "knock" => Ok(Self::Knock),
            "private" => Ok(Self::Private),
            "restricted" => from_raw_json_value(&json).map(Self::Restricted),
            "knock_restricted" => from_raw_json_value(&json).map(Self::KnockRestricted),
            "public" => Ok(Self::Public),
            other => Err(D::Error::custom(format!("unknown join rule: {other}"))),
        }
    }
}

/// Configuration of the `restricted` join rule.
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Restricted {
    /// Allow rules which describe conditions that allow joining a room.
    #[serde(default)]
    pub allow: Vec<AllowRule>,
}

impl Restricted {
    /// Constructs a new rule set with the given allow rules.
    pub fn new(allow: Vec<AllowRule>) -> Self {
        Self { allow }
    }
}

/// An allow rule which defines a condition that allows joining a room.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type")]
#[non_exhaustive]
pub enum AllowRule {
    /// Only a member of the referenced room can join.
    #[serde(rename = "m.room_membership")]
    RoomMembership(RoomMembership),
}

/// The condition of an `m.room_membership` allow rule.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct RoomMembership {
    /// The id of the room which being a member of grants permission to join.
    pub room_id: OwnedRoomId,
}

#[cfg(test)]
mod tests {
    use assert_matches2::assert_matches;

    use super::{JoinRule, RoomJoinRulesEventContent};

    #[test]
    fn deserialize() {
        let json = r#"{"join_rule": "public"}"#;
        let content: RoomJoinRulesEventContent = serde_json::from_str(json).unwrap();
        assert_matches!(content.join_rule, JoinRule::Public);
    }

    #[test]
    fn deserialize_restricted() {
        let json = r#"{
            "join_rule": "restricted",
            "allow": [
                { "type": "m.room_membership", "room_id": "!mods:example.org" },
                { "type": "m.room_membership", "room_id": "!users:example.org" }
            ]
        }"#;
        let content: RoomJoinRulesEventContent = serde_json::from_str(json).unwrap();
        assert_matches!(content.join_rule, JoinRule::Restricted(restricted));
        assert_eq!(restricted.allow.len(), 2);
    }
}
