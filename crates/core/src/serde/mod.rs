//! (De)serialization helpers shared by the rest of the crate.

use serde::{de, Deserialize, Deserializer};
pub use serde_json::{
    json,
    value::{to_raw_value as to_raw_json_value, RawValue as RawJsonValue, Value as JsonValue},
};

pub mod base64;
pub mod canonical_json;
mod raw_json;
pub mod single_element_seq;

pub use self::base64::{Base64, Base64DecodeError, Standard, UrlSafe};
pub use self::raw_json::RawJson;
pub use self::canonical_json::{
    to_canonical_string, to_canonical_value, CanonicalJsonError, CanonicalJsonObject,
    CanonicalJsonValue,
};

/// The inner type of [`JsonValue::Object`].
pub type JsonObject = serde_json::Map<String, JsonValue>;

/// Check whether a value is equal to its default value.
pub fn is_default<T: Default + PartialEq>(val: &T) -> bool {
    *val == T::default()
}

/// Simply returns `true`.
///
/// Useful for `#[serde(default = ...)]`.
pub fn default_true() -> bool {
    true
}

/// Simply dereferences the given bool.
///
/// Useful for `#[serde(skip_serializing_if = ...)]`.
#[allow(clippy::trivially_copy_pass_by_ref)]
pub fn is_true(b: &bool) -> bool {
    *b
}

/// Helper function for `serde_json::value::RawValue` deserialization.
pub fn from_raw_json_value<'a, T, E>(val: &'a RawJsonValue) -> Result<T, E>
where
    T: Deserialize<'a>,
    E: de::Error,
{
    serde_json::from_str(val.get()).map_err(E::custom)
}

/// Serialize the given value as a canonical JSON byte buffer.
pub fn json_to_buf<T: serde::Serialize>(val: &T) -> Result<Vec<u8>, CanonicalJsonError> {
    let value: CanonicalJsonValue = serde_json::to_value(val)?.try_into()?;
    Ok(serde_json::to_vec(&value)?)
}

/// Deserialize a power level that older room versions allow to be a
/// stringified integer.
pub fn deserialize_v1_powerlevel<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IntOrString {
        Int(i64),
        String(String),
    }

    match IntOrString::deserialize(deserializer)? {
        IntOrString::Int(i) => Ok(i),
        IntOrString::String(s) => s.trim().parse().map_err(de::Error::custom),
    }
}

/// Like [`deserialize_v1_powerlevel`], applied to every value of a map.
pub fn btreemap_deserialize_v1_powerlevel_values<'de, D, K>(
    deserializer: D,
) -> Result<std::collections::BTreeMap<K, i64>, D::Error>
where
    D: Deserializer<'de>,
    K: Deserialize<'de> + Ord,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IntOrString {
        Int(i64),
        String(String),
    }

    let raw = std::collections::BTreeMap::<K, IntOrString>::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(k, v)| {
            let v = match v {
                IntOrString::Int(i) => i,
                IntOrString::String(s) => s.trim().parse().map_err(de::Error::custom)?,
            };
            Ok((k, v))
        })
        .collect()
}
