//! Server discovery and key publication types.
//!
//! Covers `/.well-known/matrix/server`, `GET /_matrix/key/v2/server` and
//! the notary query endpoints under `/_matrix/key/v2/query`.

use std::collections::BTreeMap;

use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::sending::{SendRequest, SendResult};
use crate::serde::Base64;
use crate::{OwnedServerName, OwnedSigningKeyId, UnixMillis};

/// Public key of a homeserver.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct VerifyKey {
    /// The unpadded base64-encoded key.
    pub key: Base64,
}

impl VerifyKey {
    /// Creates a new `VerifyKey` from the given key.
    pub fn new(key: Base64) -> Self {
        Self { key }
    }
}

/// A public key the homeserver used at some point but no longer uses.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct OldVerifyKey {
    /// Timestamp when this key expired.
    pub expired_ts: UnixMillis,

    /// The unpadded base64-encoded key.
    pub key: Base64,
}

impl OldVerifyKey {
    /// Creates a new `OldVerifyKey` with the given expiry time and key.
    pub fn new(expired_ts: UnixMillis, key: Base64) -> Self {
        Self { expired_ts, key }
    }
}

/// The self-signed keys document a server publishes at
/// `GET /_matrix/key/v2/server`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ServerSigningKeys {
    /// DNS name of the homeserver.
    pub server_name: OwnedServerName,

    /// Public keys of the homeserver for verifying digital signatures.
    pub verify_keys: BTreeMap<OwnedSigningKeyId, VerifyKey>,

    /// Public keys that the homeserver used at some point but no longer
    /// uses.
    #[serde(default)]
    pub old_verify_keys: BTreeMap<OwnedSigningKeyId, OldVerifyKey>,

    /// Digital signatures of this object signed using the verify_keys.
    ///
    /// Map of server name to keys by key ID.
    #[serde(default)]
    pub signatures: BTreeMap<OwnedServerName, BTreeMap<OwnedSigningKeyId, String>>,

    /// Timestamp when the keys should be refreshed.
    ///
    /// This field MUST be ignored in room versions 1, 2, 3, and 4.
    pub valid_until_ts: UnixMillis,
}

impl ServerSigningKeys {
    /// Creates a new `ServerSigningKeys` with the given server name and
    /// validity timestamp, and no keys.
    pub fn new(server_name: OwnedServerName, valid_until_ts: UnixMillis) -> Self {
        Self {
            server_name,
            verify_keys: BTreeMap::new(),
            old_verify_keys: BTreeMap::new(),
            signatures: BTreeMap::new(),
            valid_until_ts,
        }
    }
}

/// `GET /_matrix/key/v2/server`
pub fn server_keys_request(origin: &str) -> SendResult<SendRequest> {
    let url = Url::parse(&format!("{origin}/_matrix/key/v2/server"))?;
    Ok(crate::sending::get(url))
}

/// Response type for the `get_server_keys` endpoint.
#[derive(Debug, Deserialize, Serialize)]
#[serde(transparent)]
pub struct ServerKeysResBody(pub ServerSigningKeys);

/// The criteria a notary applies when answering a key query.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct QueryCriteria {
    /// A millisecond POSIX timestamp in milliseconds indicating when the
    /// returned certificates need to be valid until to be useful to the
    /// requesting server.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum_valid_until_ts: Option<UnixMillis>,
}

/// `GET /_matrix/key/v2/query/{server_name}`, the single-server notary query.
pub fn remote_server_keys_request(
    origin: &str,
    args: RemoteServerKeysReqArgs,
) -> SendResult<SendRequest> {
    let url = Url::parse(&format!(
        "{origin}/_matrix/key/v2/query/{}?minimum_valid_until_ts={}",
        args.server_name, args.minimum_valid_until_ts
    ))?;
    Ok(crate::sending::get(url))
}

/// Request args for the single-server notary query.
#[derive(Clone, Debug)]
pub struct RemoteServerKeysReqArgs {
    /// The server's DNS name to query.
    pub server_name: OwnedServerName,

    /// A millisecond POSIX timestamp in milliseconds indicating when the
    /// returned certificates need to be valid until to be useful to the
    /// requesting server.
    pub minimum_valid_until_ts: UnixMillis,
}

/// Response type for the notary queries.
#[derive(Debug, Deserialize, Serialize)]
pub struct RemoteServerKeysResBody {
    /// The queried server's keys, verified by the notary.
    pub server_keys: Vec<ServerSigningKeys>,
}

/// `POST /_matrix/key/v2/query`, the batch notary query.
pub fn remote_server_keys_batch_request(
    origin: &str,
    body: RemoteServerKeysBatchReqBody,
) -> SendResult<SendRequest> {
    let url = Url::parse(&format!("{origin}/_matrix/key/v2/query"))?;
    crate::sending::post(url).json_body(&body)
}

/// Request body for the batch notary query.
#[derive(Debug, Deserialize, Serialize)]
pub struct RemoteServerKeysBatchReqBody {
    /// The query criteria.
    ///
    /// The outer string key on the object is the server name. The inner
    /// string key is the key ID to query for the particular server.
    pub server_keys: BTreeMap<OwnedServerName, BTreeMap<OwnedSigningKeyId, QueryCriteria>>,
}

/// Response type for the batch notary query.
#[derive(Debug, Deserialize, Serialize)]
pub struct RemoteServerKeysBatchResBody {
    /// The queried servers' keys, verified by the notary.
    pub server_keys: Vec<ServerSigningKeys>,
}

/// The body of `/.well-known/matrix/server`.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct WellKnownServer {
    /// The server name to delegate server-server communications to, with
    /// optional port.
    #[serde(rename = "m.server")]
    pub server: String,
}

/// `GET /.well-known/matrix/server`
pub fn well_known_request(origin: &str) -> SendResult<SendRequest> {
    let url = Url::parse(&format!("{origin}/.well-known/matrix/server"))?;
    Ok(crate::sending::get(url))
}
