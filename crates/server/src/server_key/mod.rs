//! The signing-key store: this server's Ed25519 keypair lifecycle and the
//! cache of remote servers' verify keys.

mod request;
mod verify;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;

use crate::core::federation::discovery::{
    OldVerifyKey, QueryCriteria, ServerSigningKeys, VerifyKey,
};
use crate::core::identifiers::*;
use crate::core::serde::{Base64, CanonicalJsonObject};
use crate::core::signatures::{self, Ed25519KeyPair, PublicKeyMap, PublicKeySet};
use crate::core::{MatrixError, UnixMillis};
use crate::{AppError, AppResult, Server};

/// How long a published keys document stays valid.
const KEY_VALIDITY: Duration = Duration::from_secs(7 * 24 * 3600);

/// Verify keys of one server, keyed by key ID.
pub type VerifyKeys = BTreeMap<OwnedSigningKeyId, VerifyKey>;

/// This server's signing keypair plus the cache of everyone else's verify
/// keys.
///
/// Exactly one active keypair exists per process. Rotation swaps the inner
/// value atomically: concurrent signers see either the old or the new key,
/// never a torn state.
pub struct KeyStore {
    keypair: RwLock<Arc<Ed25519KeyPair>>,
    old_verify_keys: RwLock<BTreeMap<OwnedSigningKeyId, OldVerifyKey>>,
    persist_path: Option<PathBuf>,

    /// Remote documents merged per server, with their `valid_until_ts`.
    remote: RwLock<HashMap<OwnedServerName, ServerSigningKeys>>,

    /// Single-flight guards so concurrent refreshes of the same key
    /// coalesce into one fetch.
    inflight: AsyncMutex<HashMap<(OwnedServerName, OwnedSigningKeyId), Arc<AsyncMutex<()>>>>,
}

impl KeyStore {
    /// Loads the keypair from the given path, generating and persisting a
    /// fresh one on first start.
    ///
    /// The key version lives in a `.version` sidecar so rotations survive
    /// restarts.
    pub fn open(path: &Path) -> AppResult<Self> {
        let version = std::fs::read_to_string(version_path(path))
            .map(|v| v.trim().to_owned())
            .unwrap_or_else(|_| "0".to_owned());

        let keypair = if path.exists() {
            let der = std::fs::read(path)?;
            Ed25519KeyPair::from_der(&der, version)
                .map_err(|e| AppError::internal(format!("persisted signing key invalid: {e}")))?
        } else {
            info!(path = %path.display(), "generating a new signing key");
            let der = Ed25519KeyPair::generate()
                .map_err(|e| AppError::internal(format!("key generation failed: {e}")))?;
            std::fs::write(path, &der)?;
            std::fs::write(version_path(path), &version)?;
            Ed25519KeyPair::from_der(&der, version)
                .map_err(|e| AppError::internal(format!("fresh signing key invalid: {e}")))?
        };

        Ok(Self::build(keypair, Some(path.to_owned())))
    }

    /// Wraps an externally managed keypair; nothing is persisted.
    pub fn with_keypair(keypair: Ed25519KeyPair) -> Self {
        Self::build(keypair, None)
    }

    fn build(keypair: Ed25519KeyPair, persist_path: Option<PathBuf>) -> Self {
        Self {
            keypair: RwLock::new(Arc::new(keypair)),
            old_verify_keys: RwLock::new(BTreeMap::new()),
            persist_path,
            remote: RwLock::new(HashMap::new()),
            inflight: AsyncMutex::new(HashMap::new()),
        }
    }

    /// The active keypair.
    pub fn keypair(&self) -> Arc<Ed25519KeyPair> {
        self.keypair.read().expect("keypair lock poisoned").clone()
    }

    /// The ID of the active key, `ed25519:{version}`.
    pub fn current_key_id(&self) -> OwnedSigningKeyId {
        OwnedSigningKeyId::ed25519(self.keypair().version()).expect("key version is valid")
    }

    /// The active public key.
    pub fn local_verify_key(&self) -> (OwnedSigningKeyId, Base64) {
        let keypair = self.keypair();
        (
            self.current_key_id(),
            Base64::new(keypair.public_key().to_vec()),
        )
    }

    /// Signs raw bytes with the active key; unpadded base64 out.
    pub fn sign(&self, message: &[u8]) -> String {
        use crate::core::signatures::KeyPair;
        self.keypair().sign(message).base64()
    }

    /// Retires the active key into `old_verify_keys` with `expired_ts` of
    /// now, generates a replacement with a bumped version, and persists it.
    pub fn rotate(&self) -> AppResult<()> {
        let current = self.keypair();
        let next_version = current
            .version()
            .parse::<u64>()
            .map(|v| (v + 1).to_string())
            .unwrap_or_else(|_| UnixMillis::now().get().to_string());

        let der = Ed25519KeyPair::generate()
            .map_err(|e| AppError::internal(format!("key generation failed: {e}")))?;
        let fresh = Ed25519KeyPair::from_der(&der, next_version.clone())
            .map_err(|e| AppError::internal(format!("fresh signing key invalid: {e}")))?;

        if let Some(path) = &self.persist_path {
            std::fs::write(path, &der)?;
            std::fs::write(version_path(path), &next_version)?;
        }

        let retired_id = self.current_key_id();
        self.old_verify_keys
            .write()
            .expect("old key lock poisoned")
            .insert(
                retired_id,
                OldVerifyKey::new(
                    UnixMillis::now(),
                    Base64::new(current.public_key().to_vec()),
                ),
            );

        *self.keypair.write().expect("keypair lock poisoned") = Arc::new(fresh);
        info!("rotated the server signing key");
        Ok(())
    }

    /// Retired local verify keys.
    pub fn old_verify_keys(&self) -> BTreeMap<OwnedSigningKeyId, OldVerifyKey> {
        self.old_verify_keys
            .read()
            .expect("old key lock poisoned")
            .clone()
    }

    fn cached(&self, server: &ServerName) -> Option<ServerSigningKeys> {
        self.remote
            .read()
            .expect("remote key lock poisoned")
            .get(server)
            .cloned()
    }

    fn merge_into_cache(&self, new_keys: ServerSigningKeys) {
        let mut remote = self.remote.write().expect("remote key lock poisoned");
        match remote.get_mut(&new_keys.server_name) {
            Some(existing) => {
                existing.verify_keys.extend(new_keys.verify_keys);
                existing.old_verify_keys.extend(new_keys.old_verify_keys);
                existing.valid_until_ts = existing.valid_until_ts.max(new_keys.valid_until_ts);
            }
            None => {
                remote.insert(new_keys.server_name.clone(), new_keys);
            }
        }
    }

    async fn flight_guard(
        &self,
        server: &ServerName,
        key_id: &SigningKeyId,
    ) -> Arc<AsyncMutex<()>> {
        self.inflight
            .lock()
            .await
            .entry((server.to_owned(), key_id.to_owned()))
            .or_default()
            .clone()
    }
}

fn version_path(path: &Path) -> PathBuf {
    let mut sidecar = path.as_os_str().to_owned();
    sidecar.push(".version");
    PathBuf::from(sidecar)
}

/// Picks the key usable for signatures made at `at`, looking through both
/// current and expired keys.
///
/// With `enforce_key_validity` (room v5+) a current key must still have
/// been valid at `at`, and an old key qualifies only while its
/// `expired_ts` is not before `at`.
fn key_usable_at(
    keys: &ServerSigningKeys,
    key_id: &SigningKeyId,
    at: Option<UnixMillis>,
    enforce_key_validity: bool,
) -> Option<Base64> {
    if let Some(verify_key) = keys.verify_keys.get(key_id) {
        let valid = match at {
            Some(at) if enforce_key_validity => keys.valid_until_ts >= at,
            _ => true,
        };
        if valid {
            return Some(verify_key.key.clone());
        }
    }

    if let Some(old) = keys.old_verify_keys.get(key_id) {
        let valid = match at {
            Some(at) if enforce_key_validity => old.expired_ts >= at,
            _ => true,
        };
        if valid {
            return Some(old.key.clone());
        }
    }

    None
}

impl Server {
    /// The keys document this server publishes at
    /// `GET /_matrix/key/v2/server`, self-signed.
    pub fn server_keys_document(&self) -> AppResult<ServerSigningKeys> {
        let (key_id, key) = self.keys().local_verify_key();

        let mut document = ServerSigningKeys::new(
            self.server_name().to_owned(),
            UnixMillis::from_system_time(std::time::SystemTime::now() + KEY_VALIDITY)
                .expect("system clock in range"),
        );
        document.verify_keys.insert(key_id, VerifyKey::new(key));
        document.old_verify_keys = self.keys().old_verify_keys();

        let mut object: CanonicalJsonObject =
            crate::core::serde::to_canonical_value(&document)?
                .as_object()
                .cloned()
                .ok_or_else(|| AppError::internal("keys document is not an object"))?;
        self.sign_json(&mut object)?;

        Ok(serde_json::from_value(serde_json::to_value(
            crate::core::serde::CanonicalJsonValue::Object(object),
        )?)?)
    }

    /// Answers a notary query (`POST /_matrix/key/v2/query`) from the
    /// cache: every requested server we hold keys for, plus our own
    /// document when asked about ourselves.
    pub fn notary_server_keys(
        &self,
        batch: &BTreeMap<OwnedServerName, BTreeMap<OwnedSigningKeyId, QueryCriteria>>,
    ) -> AppResult<Vec<ServerSigningKeys>> {
        let mut results = Vec::new();
        for server in batch.keys() {
            if server.as_str() == self.server_name().as_str() {
                results.push(self.server_keys_document()?);
            } else if let Some(keys) = self.keys().cached(server) {
                results.push(keys);
            }
        }
        Ok(results)
    }

    /// Signs an arbitrary JSON object with this server's active key.
    pub fn sign_json(&self, object: &mut CanonicalJsonObject) -> AppResult<()> {
        signatures::sign_json(
            self.server_name().as_str(),
            &self.keys().keypair(),
            object,
        )
        .map_err(Into::into)
    }

    /// Computes the content hash of an event and signs it with this
    /// server's active key.
    pub fn hash_and_sign_event(
        &self,
        object: &mut CanonicalJsonObject,
        rules: &crate::core::room_version::RedactionRules,
    ) -> AppResult<()> {
        signatures::hash_and_sign_event(
            self.server_name().as_str(),
            &self.keys().keypair(),
            object,
            rules,
        )
        .map_err(Into::into)
    }

    /// Validates a remote keys document's self-signature and caches its
    /// keys.
    ///
    /// Documents whose self-signature does not verify are rejected and not
    /// cached.
    pub fn remember_keys(&self, document_json: CanonicalJsonObject) -> AppResult<()> {
        let document: ServerSigningKeys = serde_json::from_value(serde_json::to_value(
            crate::core::serde::CanonicalJsonValue::Object(document_json.clone()),
        )?)?;

        // Self-signature check against the keys the document itself
        // declares.
        let mut key_set = PublicKeySet::new();
        for (key_id, verify_key) in &document.verify_keys {
            key_set.insert(key_id.clone(), verify_key.key.clone());
        }
        for (key_id, old_key) in &document.old_verify_keys {
            key_set.insert(key_id.clone(), old_key.key.clone());
        }
        let mut public_key_map = PublicKeyMap::new();
        public_key_map.insert(document.server_name.clone(), key_set);

        signatures::verify_json(&public_key_map, &document_json).map_err(|e| {
            warn!(server = %document.server_name, "rejecting keys document with bad self-signature");
            MatrixError::unauthorized(format!("keys document failed self-verification: {e}"))
        })?;

        self.keys().merge_into_cache(document);
        Ok(())
    }

    /// Resolves a verify key, consulting the cache first and then the
    /// network (origin and/or notaries, per configuration).
    ///
    /// `at` selects the key that was valid at a historical timestamp;
    /// `enforce_key_validity` comes from the room version.
    pub async fn get_verify_key(
        &self,
        origin: &ServerName,
        key_id: &SigningKeyId,
        at: Option<UnixMillis>,
        enforce_key_validity: bool,
    ) -> AppResult<Base64> {
        // Our own keys never come from the cache.
        if origin == self.server_name() {
            let (local_id, key) = self.keys().local_verify_key();
            if local_id == *key_id {
                return Ok(key);
            }
            if let Some(old) = self.keys().old_verify_keys().get(key_id) {
                return Ok(old.key.clone());
            }
            return Err(MatrixError::unauthorized(format!(
                "unknown local key {key_id}"
            ))
            .into());
        }

        if let Some(keys) = self.keys().cached(origin) {
            if let Some(key) = key_usable_at(&keys, key_id, at, enforce_key_validity) {
                return Ok(key);
            }
        }

        // Coalesce concurrent refreshes of the same (server, key).
        let guard = self.keys().flight_guard(origin, key_id).await;
        let _flight = guard.lock().await;

        if let Some(keys) = self.keys().cached(origin) {
            if let Some(key) = key_usable_at(&keys, key_id, at, enforce_key_validity) {
                return Ok(key);
            }
        }

        let notary_first = self.config().query_trusted_key_servers_first;
        let notary_only = self.config().only_query_trusted_key_servers;

        if notary_first {
            if let Ok(key) = self
                .fetch_key_from_notaries(origin, key_id, at, enforce_key_validity)
                .await
            {
                return Ok(key);
            }
        }

        if !notary_only {
            if let Ok(key) = self
                .fetch_key_from_origin(origin, key_id, at, enforce_key_validity)
                .await
            {
                return Ok(key);
            }
        }

        if !notary_first {
            if let Ok(key) = self
                .fetch_key_from_notaries(origin, key_id, at, enforce_key_validity)
                .await
            {
                return Ok(key);
            }
        }

        error!(?key_id, ?origin, "failed to fetch federation signing key");
        Err(MatrixError::unauthorized("failed to resolve the required signing key").into())
    }

    /// Assembles the public keys required to verify the given event,
    /// fetching any that are missing.
    pub async fn event_verify_keys(
        &self,
        object: &CanonicalJsonObject,
        rules: &crate::core::RoomVersionRules,
    ) -> AppResult<PublicKeyMap> {
        let required = signatures::required_keys(object, &rules.signatures)
            .map_err(|e| MatrixError::bad_json(format!("cannot determine required keys: {e}")))?;

        let at = object
            .get("origin_server_ts")
            .and_then(|v| v.as_integer())
            .and_then(|ts| u64::try_from(ts).ok())
            .map(UnixMillis);

        let mut keys = PublicKeyMap::new();
        for (server, key_ids) in required {
            let mut key_set = PublicKeySet::new();
            for key_id in key_ids {
                match self
                    .get_verify_key(&server, &key_id, at, rules.enforce_key_validity)
                    .await
                {
                    Ok(key) => {
                        key_set.insert(key_id, key);
                    }
                    Err(e) => {
                        debug!(%server, %key_id, "could not resolve verify key: {e}");
                    }
                }
            }
            keys.insert(server, key_set);
        }

        Ok(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::test::test_server;

    #[test]
    fn keypair_persists_across_opens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("signing.der");

        let first = KeyStore::open(&path).unwrap();
        let second = KeyStore::open(&path).unwrap();
        assert_eq!(
            first.keypair().public_key(),
            second.keypair().public_key()
        );

        // Rotation writes the replacement back to disk.
        second.rotate().unwrap();
        let third = KeyStore::open(&path).unwrap();
        assert_eq!(
            second.keypair().public_key(),
            third.keypair().public_key()
        );
        assert_ne!(
            first.keypair().public_key(),
            third.keypair().public_key()
        );
    }

    #[test]
    fn rotation_retires_the_old_key() {
        let server = test_server();
        let (old_id, old_key) = server.keys().local_verify_key();

        server.keys().rotate().unwrap();

        let (new_id, new_key) = server.keys().local_verify_key();
        assert_ne!(old_id, new_id);
        assert_ne!(old_key.encode(), new_key.encode());

        let old_keys = server.keys().old_verify_keys();
        let retired = old_keys.get(&old_id).expect("old key retained");
        assert_eq!(retired.key.encode(), old_key.encode());
        assert!(retired.expired_ts.get() > 0);
    }

    #[test]
    fn keys_document_is_self_signed() {
        let server = test_server();
        let document = server.server_keys_document().unwrap();

        assert_eq!(document.server_name, *server.server_name());
        assert_eq!(document.verify_keys.len(), 1);
        assert!(document.signatures.contains_key(server.server_name()));

        // A second server must accept the document through the
        // self-signature check.
        let other = crate::server::test::test_server_named("other.test");
        let json = crate::core::serde::to_canonical_value(&document)
            .unwrap()
            .as_object()
            .cloned()
            .unwrap();
        other.remember_keys(json).unwrap();
    }

    #[test]
    fn tampered_keys_document_is_rejected() {
        let server = test_server();
        let document = server.server_keys_document().unwrap();

        let mut json = crate::core::serde::to_canonical_value(&document)
            .unwrap()
            .as_object()
            .cloned()
            .unwrap();
        json.insert(
            "valid_until_ts".to_owned(),
            crate::core::serde::CanonicalJsonValue::Integer(1),
        );

        let other = crate::server::test::test_server_named("other.test");
        assert!(other.remember_keys(json).is_err());
    }

    #[tokio::test]
    async fn historical_keys_honor_expiry() {
        let server = test_server();
        let origin: crate::core::OwnedServerName = "remote.test".try_into().unwrap();

        let key_id: OwnedSigningKeyId = "ed25519:old".try_into().unwrap();
        let mut keys = ServerSigningKeys::new(origin.clone(), UnixMillis(50_000));
        keys.old_verify_keys.insert(
            key_id.clone(),
            OldVerifyKey::new(UnixMillis(100_000), Base64::new(vec![0u8; 32])),
        );
        server.keys().merge_into_cache(keys);

        // Usable for an event from before the expiry...
        assert!(server
            .get_verify_key(&origin, &key_id, Some(UnixMillis(90_000)), true)
            .await
            .is_ok());
        // ...but not for one after it (and no network is configured).
        assert!(server
            .get_verify_key(&origin, &key_id, Some(UnixMillis(200_000)), true)
            .await
            .is_err());
    }
}
