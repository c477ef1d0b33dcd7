//! Common power-level helpers.

use serde::{Deserialize, Serialize};

use crate::serde::deserialize_v1_powerlevel;

/// The default power level for fields that are not `events_default`,
/// `users_default` or `invite`.
pub fn default_power_level() -> i64 {
    50
}

/// The power level requirements for specific notification types.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct NotificationPowerLevels {
    /// The level required to trigger an `@room` notification.
    #[serde(
        default = "default_power_level",
        deserialize_with = "deserialize_v1_powerlevel"
    )]
    pub room: i64,
}

impl NotificationPowerLevels {
    /// Create a new `NotificationPowerLevels` with all-default values.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Default for NotificationPowerLevels {
    fn default() -> Self {
        Self {
            room: default_power_level(),
        }
    }
}
