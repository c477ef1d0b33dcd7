//! Event types and the state-event contents the auth rules inspect.

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod receipt;
pub mod room;
pub mod typing;

macro_rules! event_type_enum {
    (
        $(#[doc = $doc:literal])*
        pub enum $name:ident {
            $($variant:ident => $string:literal,)+
        }
    ) => {
        $(#[doc = $doc])*
        #[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[non_exhaustive]
        pub enum $name {
            $(
                #[doc = $string]
                $variant,
            )+
            /// An event type this crate has no special handling for.
            Other(String),
        }

        impl $name {
            /// The wire form of the event type.
            pub fn as_str(&self) -> &str {
                match self {
                    $(Self::$variant => $string,)+
                    Self::Other(s) => s,
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                match s {
                    $($string => Self::$variant,)+
                    other => Self::Other(other.to_owned()),
                }
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self::from(s.as_str())
            }
        }

        impl Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(self.as_str())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                Ok(Self::from(s))
            }
        }
    };
}

event_type_enum! {
    /// The type of an event appearing in a room timeline.
    pub enum TimelineEventType {
        RoomAliases => "m.room.aliases",
        RoomCreate => "m.room.create",
        RoomHistoryVisibility => "m.room.history_visibility",
        RoomJoinRules => "m.room.join_rules",
        RoomMember => "m.room.member",
        RoomMessage => "m.room.message",
        RoomName => "m.room.name",
        RoomPowerLevels => "m.room.power_levels",
        RoomRedaction => "m.room.redaction",
        RoomServerAcl => "m.room.server_acl",
        RoomThirdPartyInvite => "m.room.third_party_invite",
        RoomTopic => "m.room.topic",
    }
}

event_type_enum! {
    /// The type of a state event.
    pub enum StateEventType {
        RoomAliases => "m.room.aliases",
        RoomCreate => "m.room.create",
        RoomHistoryVisibility => "m.room.history_visibility",
        RoomJoinRules => "m.room.join_rules",
        RoomMember => "m.room.member",
        RoomName => "m.room.name",
        RoomPowerLevels => "m.room.power_levels",
        RoomServerAcl => "m.room.server_acl",
        RoomThirdPartyInvite => "m.room.third_party_invite",
        RoomTopic => "m.room.topic",
    }
}

impl From<TimelineEventType> for StateEventType {
    fn from(t: TimelineEventType) -> Self {
        Self::from(t.as_str())
    }
}

impl From<&TimelineEventType> for StateEventType {
    fn from(t: &TimelineEventType) -> Self {
        Self::from(t.as_str())
    }
}

impl From<StateEventType> for TimelineEventType {
    fn from(t: StateEventType) -> Self {
        Self::from(t.as_str())
    }
}

/// A minimal state event, carried in invites to give the receiving server
/// context about the room it does not hold.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct StrippedStateEvent {
    /// The `content` of the event.
    pub content: Box<crate::serde::RawJsonValue>,

    /// The `sender` of the event.
    pub sender: crate::OwnedUserId,

    /// The `state_key` of the event.
    pub state_key: String,

    /// The `type` of the event.
    #[serde(rename = "type")]
    pub event_type: TimelineEventType,
}

#[cfg(test)]
mod tests {
    use super::{StateEventType, TimelineEventType};

    #[test]
    fn known_and_custom_round_trip() {
        assert_eq!(TimelineEventType::from("m.room.member"), TimelineEventType::RoomMember);
        assert_eq!(TimelineEventType::RoomMember.as_str(), "m.room.member");

        let custom = StateEventType::from("org.example.custom");
        assert_eq!(custom.as_str(), "org.example.custom");
    }
}
