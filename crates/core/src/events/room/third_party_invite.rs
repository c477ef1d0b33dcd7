//! Types for the `m.room.third_party_invite` event.

use serde::{Deserialize, Serialize};

use crate::serde::Base64;

/// The content of an `m.room.third_party_invite` event.
///
/// An invitation to a room issued to a third party identifier rather than a
/// matrix user ID.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct RoomThirdPartyInviteEventContent {
    /// A user-readable string which represents the user who has been
    /// invited.
    pub display_name: String,

    /// A URL which can be fetched to validate whether the key has been
    /// revoked.
    pub key_validity_url: String,

    /// A base64-encoded Ed25519 key with which the token must be signed.
    pub public_key: Base64,

    /// Keys with which the token may be signed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_keys: Option<Vec<PublicKey>>,
}

impl RoomThirdPartyInviteEventContent {
    /// All public keys that may have signed the invite token.
    pub fn all_public_keys(&self) -> Vec<&Base64> {
        let mut keys = vec![&self.public_key];
        if let Some(extra) = &self.public_keys {
            keys.extend(extra.iter().map(|k| &k.public_key));
        }
        keys
    }
}

/// A public key for signing a third party invite token.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PublicKey {
    /// An optional URL which can be fetched to validate whether the key has
    /// been revoked.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_validity_url: Option<String>,

    /// A base64-encoded Ed25519 key with which the token must be signed.
    pub public_key: Base64,
}
