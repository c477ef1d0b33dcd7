//! Room versions and the rule sets selected by them.
//!
//! A room version is a plain tag; everything behavior-relevant hangs off
//! [`RoomVersionRules`], a record of flags selected by a single lookup.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::MatrixError;

/// The version of a room, fixed by its `m.room.create` event.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[non_exhaustive]
pub enum RoomVersionId {
    V1,
    V2,
    V3,
    V4,
    V5,
    V6,
    V7,
    V8,
    V9,
    V10,
    V11,
    V12,
}

impl RoomVersionId {
    /// The string form used on the wire.
    pub fn as_str(&self) -> &str {
        match self {
            Self::V1 => "1",
            Self::V2 => "2",
            Self::V3 => "3",
            Self::V4 => "4",
            Self::V5 => "5",
            Self::V6 => "6",
            Self::V7 => "7",
            Self::V8 => "8",
            Self::V9 => "9",
            Self::V10 => "10",
            Self::V11 => "11",
            Self::V12 => "12",
        }
    }

    /// The rule set this version selects.
    pub fn rules(&self) -> RoomVersionRules {
        match self {
            Self::V1 => RoomVersionRules::V1,
            Self::V2 => RoomVersionRules::V2,
            Self::V3 => RoomVersionRules::V3,
            Self::V4 => RoomVersionRules::V4,
            Self::V5 => RoomVersionRules::V5,
            Self::V6 => RoomVersionRules::V6,
            Self::V7 => RoomVersionRules::V7,
            Self::V8 => RoomVersionRules::V8,
            Self::V9 => RoomVersionRules::V9,
            Self::V10 => RoomVersionRules::V10,
            Self::V11 => RoomVersionRules::V11,
            Self::V12 => RoomVersionRules::V12,
        }
    }
}

impl fmt::Display for RoomVersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for RoomVersionId {
    type Error = MatrixError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Ok(match s {
            "1" => Self::V1,
            "2" => Self::V2,
            "3" => Self::V3,
            "4" => Self::V4,
            "5" => Self::V5,
            "6" => Self::V6,
            "7" => Self::V7,
            "8" => Self::V8,
            "9" => Self::V9,
            "10" => Self::V10,
            "11" => Self::V11,
            "12" => Self::V12,
            other => {
                return Err(MatrixError::unsupported_room_version(format!(
                    "unsupported room version: {other}"
                )));
            }
        })
    }
}

impl Serialize for RoomVersionId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for RoomVersionId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.as_str().try_into().map_err(serde::de::Error::custom)
    }
}

/// The format of event IDs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum EventIdFormatVersion {
    /// `$id:server`, carried in the event; room v1 and v2.
    V1,

    /// `$hash` derived from the reference hash, standard unpadded base64;
    /// room v3.
    V2,

    /// `$hash` derived from the reference hash, url-safe unpadded base64;
    /// room v4 onwards.
    V3,
}

/// The format of `prev_events` and `auth_events` arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum EventsReferenceFormatVersion {
    /// `[["$id:server", {"sha256": "hash"}]]`; room v1 and v2.
    V1,

    /// `["$hash"]`; room v3 onwards.
    V2,
}

/// The state resolution algorithm a room version uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum StateResolutionVersion {
    /// The original algorithm of room v1.
    V1,

    /// The second algorithm, room v2 onwards.
    V2(StateResolutionV2Rules),
}

impl StateResolutionVersion {
    /// The v2 tweaks, if this is the v2 algorithm.
    pub fn v2_rules(&self) -> Option<StateResolutionV2Rules> {
        as_variant::as_variant!(self, Self::V2).copied()
    }
}

/// Tweaks within the v2 state resolution algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub struct StateResolutionV2Rules {
    /// Whether to apply the state-reset reduction before ordering competing
    /// state events, introduced in room version 12.
    pub state_reset_reduction: bool,
}

impl StateResolutionV2Rules {
    pub const V2_0: Self = Self {
        state_reset_reduction: false,
    };

    pub const V2_1: Self = Self {
        state_reset_reduction: true,
    };
}

/// Tweaks in the authorization rules.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct AuthorizationRules {
    /// Whether `m.room.redaction` events get special treatment, disabled
    /// since room v3.
    pub special_case_room_redaction: bool,

    /// Whether `m.room.aliases` events get special treatment, disabled since
    /// room v6.
    pub special_case_room_aliases: bool,

    /// Whether the `notifications` field participates in power-level checks,
    /// since room v6.
    pub limit_notifications_power_levels: bool,

    /// Whether the `knock` membership and join rule are allowed, since room
    /// v7.
    pub knocking: bool,

    /// Whether the `restricted` join rule is allowed, since room v8.
    pub restricted_join_rule: bool,

    /// Whether the `knock_restricted` join rule is allowed, since room v10.
    pub knock_restricted_join_rule: bool,

    /// Whether power-level values must be integers, since room v10.
    pub integer_power_levels: bool,

    /// Whether the room creator is the `m.room.create` sender rather than
    /// the content's `creator` field, since room v11.
    pub use_room_create_sender: bool,

    /// Whether room creators hold maximum power implicitly, since room v12.
    pub explicitly_privilege_room_creators: bool,

    /// Whether the room ID is the create event's ID, since room v12.
    pub room_create_event_id_as_room_id: bool,
}

impl AuthorizationRules {
    pub const V1: Self = Self {
        special_case_room_redaction: true,
        special_case_room_aliases: true,
        limit_notifications_power_levels: false,
        knocking: false,
        restricted_join_rule: false,
        knock_restricted_join_rule: false,
        integer_power_levels: false,
        use_room_create_sender: false,
        explicitly_privilege_room_creators: false,
        room_create_event_id_as_room_id: false,
    };

    pub const V3: Self = Self {
        special_case_room_redaction: false,
        ..Self::V1
    };

    pub const V6: Self = Self {
        special_case_room_aliases: false,
        limit_notifications_power_levels: true,
        ..Self::V3
    };

    pub const V7: Self = Self {
        knocking: true,
        ..Self::V6
    };

    pub const V8: Self = Self {
        restricted_join_rule: true,
        ..Self::V7
    };

    pub const V10: Self = Self {
        knock_restricted_join_rule: true,
        integer_power_levels: true,
        ..Self::V8
    };

    pub const V11: Self = Self {
        use_room_create_sender: true,
        ..Self::V10
    };

    pub const V12: Self = Self {
        explicitly_privilege_room_creators: true,
        room_create_event_id_as_room_id: true,
        ..Self::V11
    };
}

/// Tweaks in the redaction algorithm.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct RedactionRules {
    /// Keep `content.aliases` of `m.room.aliases`, dropped in room v6.
    pub keep_room_aliases_aliases: bool,

    /// Keep `content.allow` of `m.room.join_rules`, since room v8.
    pub keep_room_join_rules_allow: bool,

    /// Keep `content.join_authorised_via_users_server` of `m.room.member`,
    /// since room v9.
    pub keep_room_member_join_authorised_via_users_server: bool,

    /// Keep the top-level `origin`, `membership` and `prev_state` fields,
    /// dropped in room v11.
    pub keep_origin_membership_prev_state: bool,

    /// Keep the entire `content` of `m.room.create`, since room v11.
    pub keep_room_create_content: bool,

    /// Keep `content.redacts` of `m.room.redaction`, since room v11.
    pub keep_room_redaction_redacts: bool,

    /// Keep `content.invite` of `m.room.power_levels`, since room v11.
    pub keep_room_power_levels_invite: bool,

    /// Keep `content.third_party_invite.signed` of `m.room.member`, since
    /// room v11.
    pub keep_room_member_third_party_invite_signed: bool,

    /// Whether `content.redacts` names the redacted event instead of the
    /// top-level `redacts` field, since room v11.
    pub content_field_redacts: bool,
}

impl RedactionRules {
    pub const V1: Self = Self {
        keep_room_aliases_aliases: true,
        keep_room_join_rules_allow: false,
        keep_room_member_join_authorised_via_users_server: false,
        keep_origin_membership_prev_state: true,
        keep_room_create_content: false,
        keep_room_redaction_redacts: false,
        keep_room_power_levels_invite: false,
        keep_room_member_third_party_invite_signed: false,
        content_field_redacts: false,
    };

    pub const V6: Self = Self {
        keep_room_aliases_aliases: false,
        ..Self::V1
    };

    pub const V8: Self = Self {
        keep_room_join_rules_allow: true,
        ..Self::V6
    };

    pub const V9: Self = Self {
        keep_room_member_join_authorised_via_users_server: true,
        ..Self::V8
    };

    pub const V11: Self = Self {
        keep_origin_membership_prev_state: false,
        keep_room_create_content: true,
        keep_room_redaction_redacts: true,
        keep_room_power_levels_invite: true,
        keep_room_member_third_party_invite_signed: true,
        content_field_redacts: true,
        ..Self::V9
    };
}

/// Tweaks for verifying signatures.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct SignaturesRules {
    /// Whether the server named in the event ID must also have signed the
    /// event, dropped in room v3.
    pub check_event_id_server: bool,

    /// Whether the server of `join_authorised_via_users_server` must have
    /// signed `m.room.member` events, since room v8.
    pub check_join_authorised_via_users_server: bool,
}

impl SignaturesRules {
    pub const V1: Self = Self {
        check_event_id_server: true,
        check_join_authorised_via_users_server: false,
    };

    pub const V3: Self = Self {
        check_event_id_server: false,
        ..Self::V1
    };

    pub const V8: Self = Self {
        check_join_authorised_via_users_server: true,
        ..Self::V3
    };
}

/// The rules applied to a room version, selected by a single lookup.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct RoomVersionRules {
    /// The format of event IDs.
    pub event_id_format: EventIdFormatVersion,

    /// The format of arrays referencing events in PDUs.
    pub events_reference_format: EventsReferenceFormatVersion,

    /// The state resolution algorithm used.
    pub state_res: StateResolutionVersion,

    /// Whether to enforce the key validity period when verifying signatures,
    /// since room v5.
    pub enforce_key_validity: bool,

    /// The tweaks in the authorization rules.
    pub authorization: AuthorizationRules,

    /// The tweaks in the redaction algorithm.
    pub redaction: RedactionRules,

    /// The tweaks for verifying signatures.
    pub signatures: SignaturesRules,
}

impl RoomVersionRules {
    pub const V1: Self = Self {
        event_id_format: EventIdFormatVersion::V1,
        events_reference_format: EventsReferenceFormatVersion::V1,
        state_res: StateResolutionVersion::V1,
        enforce_key_validity: false,
        authorization: AuthorizationRules::V1,
        redaction: RedactionRules::V1,
        signatures: SignaturesRules::V1,
    };

    pub const V2: Self = Self {
        state_res: StateResolutionVersion::V2(StateResolutionV2Rules::V2_0),
        ..Self::V1
    };

    pub const V3: Self = Self {
        event_id_format: EventIdFormatVersion::V2,
        events_reference_format: EventsReferenceFormatVersion::V2,
        authorization: AuthorizationRules::V3,
        signatures: SignaturesRules::V3,
        ..Self::V2
    };

    pub const V4: Self = Self {
        event_id_format: EventIdFormatVersion::V3,
        ..Self::V3
    };

    pub const V5: Self = Self {
        enforce_key_validity: true,
        ..Self::V4
    };

    pub const V6: Self = Self {
        authorization: AuthorizationRules::V6,
        redaction: RedactionRules::V6,
        ..Self::V5
    };

    pub const V7: Self = Self {
        authorization: AuthorizationRules::V7,
        ..Self::V6
    };

    pub const V8: Self = Self {
        authorization: AuthorizationRules::V8,
        redaction: RedactionRules::V8,
        signatures: SignaturesRules::V8,
        ..Self::V7
    };

    pub const V9: Self = Self {
        redaction: RedactionRules::V9,
        ..Self::V8
    };

    pub const V10: Self = Self {
        authorization: AuthorizationRules::V10,
        ..Self::V9
    };

    pub const V11: Self = Self {
        authorization: AuthorizationRules::V11,
        redaction: RedactionRules::V11,
        ..Self::V10
    };

    pub const V12: Self = Self {
        authorization: AuthorizationRules::V12,
        state_res: StateResolutionVersion::V2(StateResolutionV2Rules::V2_1),
        ..Self::V11
    };

    /// Whether event IDs are derived from the reference hash rather than
    /// carried in the event.
    pub fn derived_event_ids(&self) -> bool {
        !matches!(self.event_id_format, EventIdFormatVersion::V1)
    }
}

#[cfg(test)]
mod tests {
    use super::{RoomVersionId, StateResolutionVersion};

    #[test]
    fn wire_round_trip() {
        for v in [
            "1", "2", "3", "4", "5", "6", "7", "8", "9", "10", "11", "12",
        ] {
            let id = RoomVersionId::try_from(v).unwrap();
            assert_eq!(id.as_str(), v);
        }
        assert!(RoomVersionId::try_from("13-custom").is_err());
    }

    #[test]
    fn rules_progression() {
        assert!(!RoomVersionId::V1.rules().derived_event_ids());
        assert!(RoomVersionId::V3.rules().derived_event_ids());
        assert!(matches!(
            RoomVersionId::V1.rules().state_res,
            StateResolutionVersion::V1
        ));
        assert!(RoomVersionId::V5.rules().enforce_key_validity);
        assert!(RoomVersionId::V10.rules().authorization.integer_power_levels);
        assert!(
            RoomVersionId::V12
                .rules()
                .state_res
                .v2_rules()
                .unwrap()
                .state_reset_reduction
        );
    }
}
