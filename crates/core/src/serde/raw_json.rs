//! A typed wrapper around raw JSON, deserialized lazily.

use std::fmt;
use std::marker::PhantomData;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::value::RawValue as RawJsonValue;

/// A wrapper around `Box<RawValue>` with a phantom type `T`, carrying JSON
/// that is expected to deserialize as `T` but has not been validated yet.
///
/// Useful to pick individual fields out of open-ended PDU payloads without
/// committing to a full parse.
pub struct RawJson<T> {
    json: Box<RawJsonValue>,
    _ev: PhantomData<T>,
}

impl<T> RawJson<T> {
    /// Create a `RawJson` by serializing the given value.
    pub fn new(val: &T) -> serde_json::Result<Self>
    where
        T: Serialize,
    {
        serde_json::value::to_raw_value(val).map(Self::from_raw_value)
    }

    /// Create a `RawJson` from a boxed `RawValue`.
    pub fn from_raw_value(json: Box<RawJsonValue>) -> Self {
        Self {
            json,
            _ev: PhantomData,
        }
    }

    /// Access the underlying JSON text.
    pub fn json(&self) -> &RawJsonValue {
        &self.json
    }

    /// Convert into the underlying JSON text.
    pub fn into_json(self) -> Box<RawJsonValue> {
        self.json
    }

    /// Try to deserialize the JSON as `T`.
    pub fn deserialize(&self) -> serde_json::Result<T>
    where
        T: DeserializeOwned,
    {
        serde_json::from_str(self.json.get())
    }
}

impl<T> Clone for RawJson<T> {
    fn clone(&self) -> Self {
        Self::from_raw_value(self.json.clone())
    }
}

impl<T> fmt::Debug for RawJson<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawJson").field("json", &self.json).finish()
    }
}

impl<'de, T> Deserialize<'de> for RawJson<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        Box::<RawJsonValue>::deserialize(deserializer).map(Self::from_raw_value)
    }
}

impl<T> Serialize for RawJson<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.json.serialize(serializer)
    }
}
