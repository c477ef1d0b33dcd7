//! Resolution of Matrix server names to transport endpoints.
//!
//! The cascade, in order: IP literal; explicit port; well-known
//! delegation; SRV (`_matrix-fed._tcp`, then the deprecated
//! `_matrix._tcp`); default port 8448. Results are cached with a TTL.

use std::time::{Duration, Instant};

use hickory_resolver::TokioResolver;
use tokio::sync::OnceCell;

use crate::core::federation::discovery::WellKnownServer;
use crate::core::identifiers::*;
use crate::{AppError, AppResult, Server};

/// How long resolved destinations stay cached.
const DEST_CACHE_TTL: Duration = Duration::from_secs(60 * 60);

/// The transport endpoint a server name resolved to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActualDest {
    /// Host to connect to.
    pub host: String,

    /// Port to connect to.
    pub port: u16,

    /// The value of the `Host` header (and TLS SNI) for requests, which
    /// stays the delegating name across SRV indirection.
    pub host_header: String,
}

impl ActualDest {
    /// The base URL requests to this destination are built against.
    pub fn base_url(&self) -> String {
        format!("https://{}:{}", self.host, self.port)
    }
}

#[derive(Clone, Debug)]
pub(crate) struct CachedDest {
    dest: ActualDest,
    at: Instant,
}

static DNS_RESOLVER: OnceCell<TokioResolver> = OnceCell::const_new();

async fn dns_resolver() -> AppResult<&'static TokioResolver> {
    DNS_RESOLVER
        .get_or_try_init(|| async {
            TokioResolver::builder_tokio()
                .map(|builder| builder.build())
                .map_err(|e| AppError::internal(format!("system DNS configuration invalid: {e}")))
        })
        .await
}

impl Server {
    /// Resolves the server name per the discovery cascade, consulting the
    /// cache first.
    pub async fn resolve_actual_dest(&self, server: &ServerName) -> AppResult<ActualDest> {
        if !self.config().allow_federation {
            return Err(AppError::public("federation is disabled"));
        }

        if let Some(cached) = self
            .sending()
            .resolved
            .lock()
            .expect("resolver cache lock poisoned")
            .get(server)
        {
            if cached.at.elapsed() < DEST_CACHE_TTL {
                return Ok(cached.dest.clone());
            }
        }

        let dest = self.resolve_uncached(server).await?;
        debug!(%server, host = %dest.host, port = dest.port, "resolved destination");

        self.sending()
            .resolved
            .lock()
            .expect("resolver cache lock poisoned")
            .insert(
                server.to_owned(),
                CachedDest {
                    dest: dest.clone(),
                    at: Instant::now(),
                },
            );
        Ok(dest)
    }

    /// The base URL for requests to the given server.
    pub async fn resolve_origin_url(&self, server: &ServerName) -> AppResult<String> {
        Ok(self.resolve_actual_dest(server).await?.base_url())
    }

    async fn resolve_uncached(&self, server: &ServerName) -> AppResult<ActualDest> {
        // 1. IP literals connect directly, port defaulted to 8448.
        if server.is_ip_literal() {
            return Ok(ActualDest {
                host: server.host().to_owned(),
                port: server.port().unwrap_or(8448),
                host_header: server.as_str().to_owned(),
            });
        }

        // 2. An explicit port ends the cascade.
        if let Some(port) = server.port() {
            return Ok(ActualDest {
                host: server.host().to_owned(),
                port,
                host_header: server.as_str().to_owned(),
            });
        }

        // 3. Well-known delegation.
        if let Some(delegated) = self.fetch_well_known(server).await {
            let delegated: OwnedServerName = match delegated.as_str().try_into() {
                Ok(name) => name,
                Err(_) => {
                    warn!(%server, %delegated, "ignoring invalid well-known delegation");
                    return self.resolve_srv_or_default(server.host(), server.host()).await;
                }
            };

            if delegated.is_ip_literal() {
                return Ok(ActualDest {
                    host: delegated.host().to_owned(),
                    port: delegated.port().unwrap_or(8448),
                    host_header: delegated.as_str().to_owned(),
                });
            }
            if let Some(port) = delegated.port() {
                return Ok(ActualDest {
                    host: delegated.host().to_owned(),
                    port,
                    host_header: delegated.as_str().to_owned(),
                });
            }
            // SRV on the delegated host; the Host header becomes the
            // delegated name.
            return self
                .resolve_srv_or_default(delegated.host(), delegated.host())
                .await;
        }

        // 4./5. SRV on the server name itself, else the default port.
        self.resolve_srv_or_default(server.host(), server.host()).await
    }

    async fn resolve_srv_or_default(
        &self,
        lookup_host: &str,
        host_header: &str,
    ) -> AppResult<ActualDest> {
        if let Some((target, port)) = self.lookup_srv(lookup_host).await {
            return Ok(ActualDest {
                host: target,
                port,
                host_header: host_header.to_owned(),
            });
        }

        Ok(ActualDest {
            host: lookup_host.to_owned(),
            port: 8448,
            host_header: host_header.to_owned(),
        })
    }

    /// `_matrix-fed._tcp` first, the deprecated `_matrix._tcp` second.
    /// Lowest priority wins, highest weight breaks ties.
    async fn lookup_srv(&self, host: &str) -> Option<(String, u16)> {
        let resolver = match dns_resolver().await {
            Ok(resolver) => resolver,
            Err(e) => {
                warn!("DNS resolver unavailable: {e}");
                return None;
            }
        };

        for prefix in ["_matrix-fed._tcp", "_matrix._tcp"] {
            let name = format!("{prefix}.{host}.");
            match resolver.srv_lookup(name).await {
                Ok(lookup) => {
                    let best = lookup
                        .iter()
                        .min_by_key(|srv| (srv.priority(), std::cmp::Reverse(srv.weight())));
                    if let Some(srv) = best {
                        let target = srv.target().to_string();
                        return Some((target.trim_end_matches('.').to_owned(), srv.port()));
                    }
                }
                Err(e) => {
                    trace!(%host, %prefix, "SRV lookup failed: {e}");
                }
            }
        }

        None
    }

    async fn fetch_well_known(&self, server: &ServerName) -> Option<String> {
        let url = format!("https://{}/.well-known/matrix/server", server.host());
        let response = self
            .sending()
            .default_client()
            .get(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await
            .ok()?;

        if !response.status().is_success() {
            return None;
        }

        let body: WellKnownServer = response.json().await.ok()?;
        debug!(%server, delegated = %body.server, "found well-known delegation");
        Some(body.server)
    }
}

#[cfg(test)]
mod tests {
    use crate::server::test::test_server_named;

    fn federated_server() -> std::sync::Arc<crate::Server> {
        // The resolver refuses to run with federation disabled, and these
        // cases stay offline anyway (literals and explicit ports resolve
        // without the network).
        let server = test_server_named("hs.test");
        let mut config = server.config().clone();
        config.allow_federation = true;
        let der = crate::core::signatures::Ed25519KeyPair::generate().unwrap();
        let keypair =
            crate::core::signatures::Ed25519KeyPair::from_der(&der, "0".to_owned()).unwrap();
        crate::Server::with_keypair(
            config,
            std::sync::Arc::new(crate::storage::MemoryEventStore::new()),
            keypair,
        )
    }

    #[tokio::test]
    async fn ip_literals_resolve_directly() {
        let server = federated_server();

        let dest = server
            .resolve_actual_dest("127.0.0.1".try_into().unwrap())
            .await
            .unwrap();
        assert_eq!(dest.host, "127.0.0.1");
        assert_eq!(dest.port, 8448);
        assert_eq!(dest.host_header, "127.0.0.1");

        let dest = server
            .resolve_actual_dest("[::1]:7000".try_into().unwrap())
            .await
            .unwrap();
        assert_eq!(dest.host, "[::1]");
        assert_eq!(dest.port, 7000);
        assert_eq!(dest.host_header, "[::1]:7000");
    }

    #[tokio::test]
    async fn explicit_ports_skip_discovery() {
        let server = federated_server();
        let dest = server
            .resolve_actual_dest("hs.example:8449".try_into().unwrap())
            .await
            .unwrap();
        assert_eq!(dest.host, "hs.example");
        assert_eq!(dest.port, 8449);
        assert_eq!(dest.host_header, "hs.example:8449");
        assert_eq!(dest.base_url(), "https://hs.example:8449");
    }

    #[tokio::test]
    async fn resolution_is_cached() {
        let server = federated_server();
        let name: crate::core::OwnedServerName = "hs.example:8449".try_into().unwrap();
        let first = server.resolve_actual_dest(&name).await.unwrap();
        let second = server.resolve_actual_dest(&name).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(server.sending().resolved.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn disabled_federation_refuses_to_resolve() {
        let server = test_server_named("hs.test");
        assert!(server
            .resolve_actual_dest("anywhere.example:8448".try_into().unwrap())
            .await
            .is_err());
    }
}
