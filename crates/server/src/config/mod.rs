//! Server configuration, merged from a TOML file and `LODESTAR_*`
//! environment variables.

use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

use crate::core::OwnedServerName;
use crate::AppResult;

/// Top-level server configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct ServerConfig {
    /// The name this server is known by on the federation; its
    /// cryptographic identity. Immutable per process.
    pub server_name: OwnedServerName,

    /// The port the federation listener binds.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Connection string for persistent state.
    ///
    /// Interpreted by whichever `EventStore` implementation the process is
    /// wired with; the in-memory store ignores it.
    #[serde(default)]
    pub db_url: String,

    /// Where the signing keypair is persisted, as a PKCS#8 DER file.
    #[serde(default = "default_keypair_path")]
    pub keypair_path: PathBuf,

    /// Whether outbound federation is enabled at all.
    #[serde(default = "crate::core::serde::default_true")]
    pub allow_federation: bool,

    /// Notary servers to query for remote signing keys.
    #[serde(default)]
    pub trusted_servers: Vec<OwnedServerName>,

    /// Ask the notaries before the origin server itself.
    #[serde(default)]
    pub query_trusted_key_servers_first: bool,

    /// Never ask origin servers for their keys, only notaries.
    #[serde(default)]
    pub only_query_trusted_key_servers: bool,

    #[serde(default)]
    pub federation: FederationConfig,

    #[serde(default)]
    pub typing: TypingConfig,

    #[serde(default)]
    pub to_device: ToDeviceConfig,

    #[serde(default)]
    pub logger: LoggerConfig,
}

/// Outbound federation limits.
#[derive(Clone, Debug, Deserialize)]
pub struct FederationConfig {
    /// Cap on concurrently running outbound requests, across all
    /// destinations.
    #[serde(default = "default_max_concurrent_requests")]
    pub max_concurrent_requests: usize,

    /// Cap on concurrently running outbound requests per destination.
    #[serde(default = "default_max_requests_per_destination")]
    pub max_requests_per_destination: usize,

    /// Deadline for a single outbound request, in seconds.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Wall-clock deadline for processing one inbound transaction, in
    /// seconds.
    #[serde(default = "default_transaction_timeout_secs")]
    pub transaction_timeout_secs: u64,

    /// Consecutive failures before a destination's circuit opens.
    #[serde(default = "default_circuit_breaker_threshold")]
    pub circuit_breaker_threshold: u32,

    /// Seconds an open circuit waits before letting a probe through.
    #[serde(default = "default_circuit_breaker_cooldown_secs")]
    pub circuit_breaker_cooldown_secs: u64,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: default_max_concurrent_requests(),
            max_requests_per_destination: default_max_requests_per_destination(),
            request_timeout_secs: default_request_timeout_secs(),
            transaction_timeout_secs: default_transaction_timeout_secs(),
            circuit_breaker_threshold: default_circuit_breaker_threshold(),
            circuit_breaker_cooldown_secs: default_circuit_breaker_cooldown_secs(),
        }
    }
}

/// Typing-notification handling.
#[derive(Clone, Debug, Deserialize)]
pub struct TypingConfig {
    /// Seconds after which a remote user's typing notification expires.
    #[serde(default = "default_typing_timeout_secs")]
    pub federation_timeout_secs: u64,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            federation_timeout_secs: default_typing_timeout_secs(),
        }
    }
}

/// Device-to-device message queues.
#[derive(Clone, Debug, Deserialize)]
pub struct ToDeviceConfig {
    /// Per-device queue bound; the oldest message is dropped beyond it.
    #[serde(default = "default_to_device_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for ToDeviceConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_to_device_queue_capacity(),
        }
    }
}

/// Logging output.
#[derive(Clone, Debug, Deserialize)]
pub struct LoggerConfig {
    /// An `EnvFilter` directive string, e.g. `info,lodestar_server=debug`.
    #[serde(default = "default_log_filter")]
    pub filter: String,

    /// Emit JSON instead of human-readable lines.
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

fn default_listen_port() -> u16 {
    8448
}

fn default_keypair_path() -> PathBuf {
    PathBuf::from("./lodestar.signing.der")
}

fn default_max_concurrent_requests() -> usize {
    100
}

fn default_max_requests_per_destination() -> usize {
    10
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_transaction_timeout_secs() -> u64 {
    55
}

fn default_circuit_breaker_threshold() -> u32 {
    5
}

fn default_circuit_breaker_cooldown_secs() -> u64 {
    90
}

fn default_typing_timeout_secs() -> u64 {
    30
}

fn default_to_device_queue_capacity() -> usize {
    100
}

fn default_log_filter() -> String {
    "info".to_owned()
}

impl ServerConfig {
    /// Loads configuration from the given TOML file, overridable via
    /// `LODESTAR_*` environment variables.
    pub fn load(path: impl AsRef<Path>) -> AppResult<Self> {
        let config = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("LODESTAR_").split("__"))
            .extract()?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::ServerConfig;

    #[test]
    fn minimal_config_gets_defaults() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"server_name": "hs.example"}"#).unwrap();
        assert_eq!(config.listen_port, 8448);
        assert!(config.allow_federation);
        assert_eq!(config.typing.federation_timeout_secs, 30);
        assert_eq!(config.federation.max_requests_per_destination, 10);
        assert_eq!(config.to_device.queue_capacity, 100);
    }
}
