//! Types for the `m.room.power_levels` event.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::events::TimelineEventType;
use crate::power_levels::{default_power_level, NotificationPowerLevels};
use crate::serde::{btreemap_deserialize_v1_powerlevel_values, deserialize_v1_powerlevel};
use crate::OwnedUserId;

/// The content of an `m.room.power_levels` event.
///
/// Deserialization is lenient about stringified integers because room
/// versions before 10 tolerated them on the wire.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RoomPowerLevelsEventContent {
    /// The level required to ban a user.
    #[serde(
        default = "default_power_level",
        skip_serializing_if = "is_default_power_level",
        deserialize_with = "deserialize_v1_powerlevel"
    )]
    pub ban: i64,

    /// The level required to send specific event types.
    ///
    /// This is a mapping from event type to power level required.
    #[serde(
        default,
        skip_serializing_if = "BTreeMap::is_empty",
        deserialize_with = "btreemap_deserialize_v1_powerlevel_values"
    )]
    pub events: BTreeMap<TimelineEventType, i64>,

    /// The default level required to send message events.
    #[serde(
        default,
        skip_serializing_if = "crate::serde::is_default",
        deserialize_with = "deserialize_v1_powerlevel"
    )]
    pub events_default: i64,

    /// The level required to invite a user.
    #[serde(
        default,
        skip_serializing_if = "crate::serde::is_default",
        deserialize_with = "deserialize_v1_powerlevel"
    )]
    pub invite: i64,

    /// The level required to kick a user.
    #[serde(
        default = "default_power_level",
        skip_serializing_if = "is_default_power_level",
        deserialize_with = "deserialize_v1_powerlevel"
    )]
    pub kick: i64,

    /// The level required to redact an event.
    #[serde(
        default = "default_power_level",
        skip_serializing_if = "is_default_power_level",
        deserialize_with = "deserialize_v1_powerlevel"
    )]
    pub redact: i64,

    /// The default level required to send state events.
    #[serde(
        default = "default_power_level",
        skip_serializing_if = "is_default_power_level",
        deserialize_with = "deserialize_v1_powerlevel"
    )]
    pub state_default: i64,

    /// The power levels for specific users.
    ///
    /// This is a mapping from `user_id` to power level for that user.
    #[serde(
        default,
        skip_serializing_if = "BTreeMap::is_empty",
        deserialize_with = "btreemap_deserialize_v1_powerlevel_values"
    )]
    pub users: BTreeMap<OwnedUserId, i64>,

    /// The default power level for every user in the room.
    #[serde(
        default,
        skip_serializing_if = "crate::serde::is_default",
        deserialize_with = "deserialize_v1_powerlevel"
    )]
    pub users_default: i64,

    /// The power level requirements for specific notification types.
    ///
    /// This is a mapping from `key` to power level for that notification key.
    #[serde(default, skip_serializing_if = "crate::serde::is_default")]
    pub notifications: NotificationPowerLevels,
}

fn is_default_power_level(l: &i64) -> bool {
    *l == 50
}

impl Default for RoomPowerLevelsEventContent {
    fn default() -> Self {
        // events_default, users_default and invite default to 0; the other
        // fields default to 50 per the Matrix specification.
        Self {
            ban: default_power_level(),
            events: BTreeMap::new(),
            events_default: 0,
            invite: 0,
            kick: default_power_level(),
            redact: default_power_level(),
            state_default: default_power_level(),
            users: BTreeMap::new(),
            users_default: 0,
            notifications: NotificationPowerLevels::default(),
        }
    }
}

impl RoomPowerLevelsEventContent {
    /// Creates the default power levels content.
    pub fn new() -> Self {
        Self::default()
    }

    /// The power level of the given user under this content.
    pub fn user_power(&self, user_id: &crate::UserId) -> i64 {
        self.users
            .get(user_id)
            .copied()
            .unwrap_or(self.users_default)
    }

    /// The level required to send the given event type.
    pub fn send_level(&self, event_type: &TimelineEventType, is_state: bool) -> i64 {
        self.events.get(event_type).copied().unwrap_or(if is_state {
            self.state_default
        } else {
            self.events_default
        })
    }
}

#[cfg(test)]
mod tests {
    use super::RoomPowerLevelsEventContent;

    #[test]
    fn defaults_per_spec() {
        let content = RoomPowerLevelsEventContent::default();
        assert_eq!(content.ban, 50);
        assert_eq!(content.state_default, 50);
        assert_eq!(content.events_default, 0);
        assert_eq!(content.invite, 0);
    }

    #[test]
    fn lenient_stringified_integers() {
        let content: RoomPowerLevelsEventContent = serde_json::from_str(
            r#"{"ban":"75","users":{"@carol:example.com":"100"},"users_default":5}"#,
        )
        .unwrap();
        assert_eq!(content.ban, 75);
        assert_eq!(content.users_default, 5);
        let carol: crate::OwnedUserId = "@carol:example.com".try_into().unwrap();
        assert_eq!(content.users[&carol], 100);
    }
}
