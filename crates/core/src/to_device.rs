//! Types for the `m.direct_to_device` EDU.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::serde::RawJsonValue;
use crate::{OwnedTransactionId, OwnedUserId};

/// The content for an `m.direct_to_device` EDU.
///
/// The messages are opaque to the federation layer; they are queued for the
/// recipient devices untouched.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DirectDeviceContent {
    /// The user ID of the sender.
    pub sender: OwnedUserId,

    /// Event type for the message.
    #[serde(rename = "type")]
    pub ev_type: String,

    /// Unique utf8 string ID for the message, used for idempotency.
    pub message_id: OwnedTransactionId,

    /// The contents of the messages to be sent, keyed by user and then by
    /// device.
    pub messages: DirectDeviceMessages,
}

/// Direct device message contents.
pub type DirectDeviceMessages =
    BTreeMap<OwnedUserId, BTreeMap<DeviceIdOrAllDevices, Box<RawJsonValue>>>;

/// A device ID, or the wildcard `*` meaning all of a user's devices.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[allow(clippy::exhaustive_enums)]
pub enum DeviceIdOrAllDevices {
    /// A single device.
    DeviceId(String),

    /// All devices of the user.
    AllDevices,
}

impl fmt::Display for DeviceIdOrAllDevices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DeviceId(id) => f.write_str(id),
            Self::AllDevices => f.write_str("*"),
        }
    }
}

impl From<&str> for DeviceIdOrAllDevices {
    fn from(s: &str) -> Self {
        if s == "*" {
            Self::AllDevices
        } else {
            Self::DeviceId(s.to_owned())
        }
    }
}

impl Serialize for DeviceIdOrAllDevices {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::DeviceId(id) => serializer.serialize_str(id),
            Self::AllDevices => serializer.serialize_str("*"),
        }
    }
}

impl<'de> Deserialize<'de> for DeviceIdOrAllDevices {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::from(s.as_str()))
    }
}
