//! Types for the `m.presence` EDU.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::OwnedUserId;

/// A description of a user's connectivity and availability.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum PresenceState {
    /// Connected to the service and available for chat.
    Online,

    /// Not connected to the service.
    Offline,

    /// Connected to the service but not available for chat.
    Unavailable,

    /// Connected but explicitly marked busy.
    Busy,
}

impl PresenceState {
    /// The wire form of the state.
    pub fn as_str(&self) -> &str {
        match self {
            Self::Online => "online",
            Self::Offline => "offline",
            Self::Unavailable => "unavailable",
            Self::Busy => "busy",
        }
    }
}

impl fmt::Display for PresenceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<&str> for PresenceState {
    type Error = crate::MatrixError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        Ok(match s {
            "online" => Self::Online,
            "offline" => Self::Offline,
            "unavailable" => Self::Unavailable,
            "busy" => Self::Busy,
            other => {
                return Err(crate::MatrixError::invalid_param(format!(
                    "unknown presence state: {other}"
                )));
            }
        })
    }
}

impl Serialize for PresenceState {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for PresenceState {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.as_str().try_into().map_err(serde::de::Error::custom)
    }
}

/// The content for an `m.presence` EDU.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PresenceContent {
    /// A list of presence updates that the receiving server is likely to be
    /// interested in.
    pub push: Vec<PresenceUpdate>,
}

impl PresenceContent {
    /// Creates a new `PresenceContent`.
    pub fn new(push: Vec<PresenceUpdate>) -> Self {
        Self { push }
    }
}

/// An update to the presence of a user.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PresenceUpdate {
    /// The user ID this presence EDU is for.
    pub user_id: OwnedUserId,

    /// The presence of the user.
    pub presence: PresenceState,

    /// An optional description to accompany the presence.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_msg: Option<String>,

    /// The number of milliseconds that have elapsed since the user last did
    /// something.
    #[serde(default)]
    pub last_active_ago: u64,

    /// Whether or not the user is currently active.
    #[serde(default)]
    pub currently_active: bool,
}

#[cfg(test)]
mod tests {
    use super::PresenceState;

    #[test]
    fn rejects_unknown_states() {
        assert!(PresenceState::try_from("online").is_ok());
        assert!(PresenceState::try_from("busy").is_ok());
        assert!(PresenceState::try_from("asleep").is_err());
    }
}
