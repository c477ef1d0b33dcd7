//! Canonical JSON per the Matrix specification.
//!
//! Object keys are sorted (the `BTreeMap` backing guarantees code-unit
//! order), no insignificant whitespace is emitted, numbers must be integers
//! within `[-2^53 + 1, 2^53 - 1]` and floats are rejected outright. Strings
//! that merely look numeric stay strings; the conversion below never
//! coerces between JSON types.

use std::{collections::BTreeMap, fmt};

use serde::{de::Deserializer, ser::Serializer, Deserialize, Serialize};
use serde_json::{to_string as to_json_string, Error as JsonError, Value as JsonValue};

use crate::room_version::RedactionRules;

/// The largest number representable in canonical JSON: 2^53 - 1.
pub const CANONICAL_MAX: i64 = 9_007_199_254_740_991;

/// The smallest number representable in canonical JSON: -2^53 + 1.
pub const CANONICAL_MIN: i64 = -9_007_199_254_740_991;

/// The inner type of [`CanonicalJsonValue::Object`].
pub type CanonicalJsonObject = BTreeMap<String, CanonicalJsonValue>;

/// The set of possible errors when converting to canonical JSON.
#[derive(Debug, thiserror::Error)]
#[allow(clippy::exhaustive_enums)]
pub enum CanonicalJsonError {
    /// The JSON value contains a float or other non-integer number.
    #[error("canonical JSON forbids non-integer numbers")]
    NonIntegerNumber,

    /// The integer falls outside `[-2^53 + 1, 2^53 - 1]`.
    #[error("integer out of the canonical JSON range")]
    NumberOutOfRange,

    /// An error occurred while serializing/deserializing.
    #[error("serde error: {0}")]
    SerDe(#[from] JsonError),
}

/// Represents a canonical JSON value as per the Matrix specification.
#[derive(Clone, Default, Eq, PartialEq)]
#[allow(clippy::exhaustive_enums)]
pub enum CanonicalJsonValue {
    /// Represents a JSON null value.
    #[default]
    Null,

    /// Represents a JSON boolean.
    Bool(bool),

    /// Represents a JSON integer within the canonical range.
    Integer(i64),

    /// Represents a JSON string.
    String(String),

    /// Represents a JSON array.
    Array(Vec<CanonicalJsonValue>),

    /// Represents a JSON object.
    ///
    /// The map is backed by a BTreeMap to guarantee the sorting of keys.
    Object(CanonicalJsonObject),
}

impl CanonicalJsonValue {
    /// If the `CanonicalJsonValue` is a `Bool`, return the inner value.
    pub fn as_bool(&self) -> Option<bool> {
        as_variant::as_variant!(self, Self::Bool).copied()
    }

    /// If the `CanonicalJsonValue` is an `Integer`, return the inner value.
    pub fn as_integer(&self) -> Option<i64> {
        as_variant::as_variant!(self, Self::Integer).copied()
    }

    /// If the `CanonicalJsonValue` is a `String`, return a reference to the
    /// inner value.
    pub fn as_str(&self) -> Option<&str> {
        as_variant::as_variant!(self, Self::String).map(|s| s.as_str())
    }

    /// If the `CanonicalJsonValue` is an `Array`, return a reference to the
    /// inner value.
    pub fn as_array(&self) -> Option<&[CanonicalJsonValue]> {
        as_variant::as_variant!(self, Self::Array).map(|a| a.as_slice())
    }

    /// If the `CanonicalJsonValue` is an `Object`, return a reference to the
    /// inner value.
    pub fn as_object(&self) -> Option<&CanonicalJsonObject> {
        as_variant::as_variant!(self, Self::Object)
    }

    /// If the `CanonicalJsonValue` is an `Array`, return a mutable reference
    /// to the inner value.
    pub fn as_array_mut(&mut self) -> Option<&mut Vec<CanonicalJsonValue>> {
        as_variant::as_variant!(self, Self::Array)
    }

    /// If the `CanonicalJsonValue` is an `Object`, return a mutable reference
    /// to the inner value.
    pub fn as_object_mut(&mut self) -> Option<&mut CanonicalJsonObject> {
        as_variant::as_variant!(self, Self::Object)
    }

    /// Returns `true` if the `CanonicalJsonValue` is a `String`.
    pub fn is_string(&self) -> bool {
        matches!(self, Self::String(_))
    }

    /// Returns `true` if the `CanonicalJsonValue` is an `Object`.
    pub fn is_object(&self) -> bool {
        matches!(self, Self::Object(_))
    }
}

impl fmt::Debug for CanonicalJsonValue {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::Null => formatter.debug_tuple("Null").finish(),
            Self::Bool(v) => formatter.debug_tuple("Bool").field(&v).finish(),
            Self::Integer(ref v) => fmt::Debug::fmt(v, formatter),
            Self::String(ref v) => formatter.debug_tuple("String").field(v).finish(),
            Self::Array(ref v) => {
                formatter.write_str("Array(")?;
                fmt::Debug::fmt(v, formatter)?;
                formatter.write_str(")")
            }
            Self::Object(ref v) => {
                formatter.write_str("Object(")?;
                fmt::Debug::fmt(v, formatter)?;
                formatter.write_str(")")
            }
        }
    }
}

impl fmt::Display for CanonicalJsonValue {
    /// Display this value as its canonical string form.
    ///
    /// Intentionally unaffected by any formatting parameters; adding extra
    /// whitespace would make the output not the canonical form anymore.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", to_json_string(&self).map_err(|_| fmt::Error)?)
    }
}

impl TryFrom<JsonValue> for CanonicalJsonValue {
    type Error = CanonicalJsonError;

    fn try_from(val: JsonValue) -> Result<Self, Self::Error> {
        Ok(match val {
            JsonValue::Bool(b) => Self::Bool(b),
            JsonValue::Number(num) => {
                let int = match num.as_i64() {
                    Some(int) => int,
                    // u64 values above i64::MAX are integers, just too big.
                    None if num.is_u64() => return Err(CanonicalJsonError::NumberOutOfRange),
                    None => return Err(CanonicalJsonError::NonIntegerNumber),
                };
                if !(CANONICAL_MIN..=CANONICAL_MAX).contains(&int) {
                    return Err(CanonicalJsonError::NumberOutOfRange);
                }
                Self::Integer(int)
            }
            JsonValue::Array(vec) => Self::Array(
                vec.into_iter()
                    .map(TryInto::try_into)
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            JsonValue::String(string) => Self::String(string),
            JsonValue::Object(obj) => Self::Object(
                obj.into_iter()
                    .map(|(k, v)| Ok::<_, CanonicalJsonError>((k, v.try_into()?)))
                    .collect::<Result<CanonicalJsonObject, _>>()?,
            ),
            JsonValue::Null => Self::Null,
        })
    }
}

impl From<CanonicalJsonValue> for JsonValue {
    fn from(val: CanonicalJsonValue) -> Self {
        match val {
            CanonicalJsonValue::Bool(b) => Self::Bool(b),
            CanonicalJsonValue::Integer(int) => Self::Number(int.into()),
            CanonicalJsonValue::String(string) => Self::String(string),
            CanonicalJsonValue::Array(vec) => {
                Self::Array(vec.into_iter().map(Into::into).collect())
            }
            CanonicalJsonValue::Object(obj) => {
                Self::Object(obj.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
            CanonicalJsonValue::Null => Self::Null,
        }
    }
}

impl From<bool> for CanonicalJsonValue {
    fn from(val: bool) -> Self {
        Self::Bool(val)
    }
}

impl From<i64> for CanonicalJsonValue {
    fn from(val: i64) -> Self {
        Self::Integer(val)
    }
}

impl From<String> for CanonicalJsonValue {
    fn from(val: String) -> Self {
        Self::String(val)
    }
}

impl From<&str> for CanonicalJsonValue {
    fn from(val: &str) -> Self {
        Self::String(val.to_owned())
    }
}

impl From<CanonicalJsonObject> for CanonicalJsonValue {
    fn from(val: CanonicalJsonObject) -> Self {
        Self::Object(val)
    }
}

impl Serialize for CanonicalJsonValue {
    #[inline]
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Integer(n) => serializer.serialize_i64(*n),
            Self::String(s) => serializer.serialize_str(s),
            Self::Array(v) => v.serialize(serializer),
            Self::Object(m) => {
                use serde::ser::SerializeMap;
                let mut map = serializer.serialize_map(Some(m.len()))?;
                for (k, v) in m {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
        }
    }
}

impl<'de> Deserialize<'de> for CanonicalJsonValue {
    #[inline]
    fn deserialize<D>(deserializer: D) -> Result<CanonicalJsonValue, D::Error>
    where
        D: Deserializer<'de>,
    {
        let val = JsonValue::deserialize(deserializer)?;
        val.try_into().map_err(serde::de::Error::custom)
    }
}

/// Fallible conversion from any value that impls `Serialize` to a
/// `CanonicalJsonValue`.
pub fn to_canonical_value<T: Serialize>(
    value: T,
) -> Result<CanonicalJsonValue, CanonicalJsonError> {
    serde_json::to_value(value)?.try_into()
}

/// Serialize the given JSON value to its canonical string form.
pub fn to_canonical_string(value: &JsonValue) -> Result<String, CanonicalJsonError> {
    let canonical: CanonicalJsonValue = value.clone().try_into()?;
    Ok(canonical.to_string())
}

/// The top-level keys an event retains through redaction.
const KEPT_EVENT_FIELDS: &[&str] = &[
    "event_id",
    "type",
    "room_id",
    "sender",
    "state_key",
    "content",
    "hashes",
    "signatures",
    "depth",
    "prev_events",
    "auth_events",
    "origin_server_ts",
];

/// Redacts the given event object in accordance with the room version's
/// redaction rules, returning the redacted object.
///
/// If `redacted_because` is given it is placed under `unsigned`.
pub fn redact(
    mut object: CanonicalJsonObject,
    rules: &RedactionRules,
    redacted_because: Option<CanonicalJsonValue>,
) -> Result<CanonicalJsonObject, CanonicalJsonError> {
    let event_type = object
        .get("type")
        .and_then(|v| v.as_str())
        .map(ToOwned::to_owned)
        .unwrap_or_default();

    object.retain(|key, _| {
        KEPT_EVENT_FIELDS.contains(&key.as_str())
            || (rules.keep_origin_membership_prev_state
                && matches!(key.as_str(), "origin" | "membership" | "prev_state"))
    });

    if let Some(CanonicalJsonValue::Object(content)) = object.get_mut("content") {
        redact_content_in_place(content, rules, &event_type);
    }

    if let Some(because) = redacted_because {
        let mut unsigned = CanonicalJsonObject::new();
        unsigned.insert("redacted_because".to_owned(), because);
        object.insert("unsigned".to_owned(), CanonicalJsonValue::Object(unsigned));
    }

    Ok(object)
}

/// Strips the `content` of an event down to the fields the redaction
/// algorithm preserves for its type.
pub fn redact_content_in_place(
    content: &mut CanonicalJsonObject,
    rules: &RedactionRules,
    event_type: &str,
) {
    fn retain(content: &mut CanonicalJsonObject, keys: &[&str]) {
        content.retain(|k, _| keys.contains(&k.as_str()));
    }

    match event_type {
        "m.room.create" => {
            if rules.keep_room_create_content {
                // Since v11, the full content survives.
            } else {
                retain(content, &["creator"]);
            }
        }
        "m.room.member" => {
            let mut kept = vec!["membership"];
            if rules.keep_room_member_join_authorised_via_users_server {
                kept.push("join_authorised_via_users_server");
            }
            let signed = if rules.keep_room_member_third_party_invite_signed {
                content
                    .get("third_party_invite")
                    .and_then(|v| v.as_object())
                    .and_then(|tpi| tpi.get("signed"))
                    .cloned()
            } else {
                None
            };
            retain(content, &kept);
            if let Some(signed) = signed {
                let mut tpi = CanonicalJsonObject::new();
                tpi.insert("signed".to_owned(), signed);
                content.insert(
                    "third_party_invite".to_owned(),
                    CanonicalJsonValue::Object(tpi),
                );
            }
        }
        "m.room.join_rules" => {
            let mut kept = vec!["join_rule"];
            if rules.keep_room_join_rules_allow {
                kept.push("allow");
            }
            retain(content, &kept);
        }
        "m.room.power_levels" => {
            let mut kept = vec![
                "ban",
                "events",
                "events_default",
                "kick",
                "redact",
                "state_default",
                "users",
                "users_default",
            ];
            if rules.keep_room_power_levels_invite {
                kept.push("invite");
            }
            retain(content, &kept);
        }
        "m.room.aliases" => {
            if rules.keep_room_aliases_aliases {
                retain(content, &["aliases"]);
            } else {
                content.clear();
            }
        }
        "m.room.history_visibility" => {
            retain(content, &["history_visibility"]);
        }
        "m.room.redaction" => {
            if rules.keep_room_redaction_redacts {
                retain(content, &["redacts"]);
            } else {
                content.clear();
            }
        }
        _ => content.clear(),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{from_str as from_json_str, json};

    use super::{to_canonical_string, CanonicalJsonError, CanonicalJsonValue};

    #[test]
    fn sorts_keys() {
        let value: serde_json::Value = from_json_str(r#"{"z":1,"a":2}"#).unwrap();
        assert_eq!(to_canonical_string(&value).unwrap(), r#"{"a":2,"z":1}"#);
    }

    #[test]
    fn digit_strings_stay_strings() {
        let value = json!({ "address": "123456789" });
        assert_eq!(
            to_canonical_string(&value).unwrap(),
            r#"{"address":"123456789"}"#
        );
    }

    #[test]
    fn rejects_floats() {
        let value = json!({ "pi": 3.14 });
        assert_matches2::assert_matches!(
            CanonicalJsonValue::try_from(value),
            Err(CanonicalJsonError::NonIntegerNumber)
        );
    }

    #[test]
    fn rejects_out_of_range_integers() {
        let value = json!({ "big": 9_007_199_254_740_992_i64 });
        assert_matches2::assert_matches!(
            CanonicalJsonValue::try_from(value),
            Err(CanonicalJsonError::NumberOutOfRange)
        );

        let value = json!({ "small": -9_007_199_254_740_992_i64 });
        assert_matches2::assert_matches!(
            CanonicalJsonValue::try_from(value),
            Err(CanonicalJsonError::NumberOutOfRange)
        );

        let value = json!({ "edge": 9_007_199_254_740_991_i64 });
        assert!(CanonicalJsonValue::try_from(value).is_ok());
    }

    #[test]
    fn round_trips_through_parse() {
        let value = json!({
            "auth": {
                "success": true,
                "mxid": "@john.doe:example.com",
                "profile": {
                    "display_name": "John Doe",
                    "three_pids": [
                        { "medium": "email", "address": "john.doe@example.org" },
                        { "medium": "msisdn", "address": "123456789" }
                    ]
                }
            }
        });
        let first = to_canonical_string(&value).unwrap();
        let reparsed: serde_json::Value = from_json_str(&first).unwrap();
        assert_eq!(to_canonical_string(&reparsed).unwrap(), first);
        assert_eq!(
            first,
            r#"{"auth":{"mxid":"@john.doe:example.com","profile":{"display_name":"John Doe","three_pids":[{"address":"john.doe@example.org","medium":"email"},{"address":"123456789","medium":"msisdn"}]},"success":true}}"#
        );
    }

    #[test]
    fn unicode_keys_sort_by_code_unit() {
        let value: serde_json::Value = from_json_str(r#"{"本":2,"日":1}"#).unwrap();
        assert_eq!(to_canonical_string(&value).unwrap(), r#"{"日":1,"本":2}"#);
    }

    #[test]
    fn null_survives() {
        let value = json!({ "a": null });
        assert_eq!(to_canonical_string(&value).unwrap(), r#"{"a":null}"#);
    }
}
