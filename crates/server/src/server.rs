//! The engine root: one [`Server`] per process, owning the signing keys,
//! the store handle and all shared in-memory state.

use std::sync::Arc;

use crate::config::ServerConfig;
use crate::core::signatures::Ed25519KeyPair;
use crate::core::ServerName;
use crate::room::RoomService;
use crate::sending::SendingService;
use crate::server_key::KeyStore;
use crate::storage::{EventStore, MemoryEventStore};
use crate::user::UserService;
use crate::AppResult;

/// A homeserver's federation core.
///
/// Cheap to share: wrap it in an `Arc` and hand clones to every task. All
/// interior state is behind its own lock; there is no global lock.
pub struct Server {
    config: ServerConfig,
    store: Arc<dyn EventStore>,
    keys: KeyStore,
    sending: SendingService,
    rooms: RoomService,
    users: UserService,
}

impl Server {
    /// Builds the engine, loading (or creating on first start) the signing
    /// keypair from the configured path.
    pub fn new(config: ServerConfig, store: Arc<dyn EventStore>) -> AppResult<Arc<Self>> {
        let keys = KeyStore::open(&config.keypair_path)?;
        Ok(Self::assemble(config, store, keys))
    }

    /// Builds the engine around an existing keypair; used by tests and
    /// embedders that manage key material themselves.
    pub fn with_keypair(
        config: ServerConfig,
        store: Arc<dyn EventStore>,
        keypair: Ed25519KeyPair,
    ) -> Arc<Self> {
        Self::assemble(config, store, KeyStore::with_keypair(keypair))
    }

    fn assemble(config: ServerConfig, store: Arc<dyn EventStore>, keys: KeyStore) -> Arc<Self> {
        let sending = SendingService::new(&config);
        let users = UserService::new(&config);
        Arc::new(Self {
            config,
            store,
            keys,
            sending,
            rooms: RoomService::default(),
            users,
        })
    }

    /// The server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// This server's name; its cryptographic identity.
    pub fn server_name(&self) -> &ServerName {
        &self.config.server_name
    }

    /// The event store.
    pub fn store(&self) -> &dyn EventStore {
        &*self.store
    }

    /// The signing-key store.
    pub fn keys(&self) -> &KeyStore {
        &self.keys
    }

    pub(crate) fn sending(&self) -> &SendingService {
        &self.sending
    }

    pub(crate) fn rooms(&self) -> &RoomService {
        &self.rooms
    }

    pub(crate) fn users(&self) -> &UserService {
        &self.users
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    /// An engine over a fresh in-memory store with a generated keypair.
    pub(crate) fn test_server() -> Arc<Server> {
        test_server_named("hs.test")
    }

    pub(crate) fn test_server_named(name: &str) -> Arc<Server> {
        // Outbound federation stays off so unit tests never touch the
        // network.
        let config: ServerConfig = serde_json::from_value(serde_json::json!({
            "server_name": name,
            "allow_federation": false,
        }))
        .expect("test config is valid");

        let der = Ed25519KeyPair::generate().expect("key generation works");
        let keypair = Ed25519KeyPair::from_der(&der, "0".to_owned()).expect("fresh DER parses");

        Server::with_keypair(config, Arc::new(MemoryEventStore::new()), keypair)
    }
}
