//! Outbound federation plumbing: clients, concurrency bounds and the
//! per-destination circuit breaker.

pub mod resolver;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use tokio::sync::Semaphore;

use self::resolver::CachedDest;
use crate::config::ServerConfig;
use crate::core::identifiers::*;
use crate::{AppError, AppResult, Server};

/// Where a destination's circuit currently stands.
#[derive(Debug)]
enum BreakerState {
    /// Requests flow; consecutive failures are counted.
    Closed { failures: u32 },

    /// Requests are short-circuited until the cooldown elapses, then one
    /// probe is let through.
    Open { since: Instant, probing: bool },
}

/// Shared state of the outbound path.
pub struct SendingService {
    default_client: reqwest::Client,
    federation_client: ClientWithMiddleware,
    max_requests: Arc<Semaphore>,
    per_destination: Mutex<HashMap<OwnedServerName, Arc<Semaphore>>>,
    breakers: Mutex<HashMap<OwnedServerName, BreakerState>>,
    pub(crate) resolved: Mutex<HashMap<OwnedServerName, CachedDest>>,

    per_destination_limit: usize,
    breaker_threshold: u32,
    breaker_cooldown: Duration,
    request_timeout: Duration,
}

impl SendingService {
    pub(crate) fn new(config: &ServerConfig) -> Self {
        let default_client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .timeout(Duration::from_secs(config.federation.request_timeout_secs))
            .build()
            .expect("reqwest client builds");

        // Idempotent federation GETs retry with exponential backoff and
        // jitter; transaction PUTs are idempotent on (origin, txn_id) so
        // they may retry too.
        let retry_policy = ExponentialBackoff::builder()
            .retry_bounds(Duration::from_secs(5), Duration::from_secs(900))
            .build_with_max_retries(5);
        let federation_client = ClientBuilder::new(default_client.clone())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Self {
            default_client,
            federation_client,
            max_requests: Arc::new(Semaphore::new(config.federation.max_concurrent_requests)),
            per_destination: Mutex::new(HashMap::new()),
            breakers: Mutex::new(HashMap::new()),
            resolved: Mutex::new(HashMap::new()),
            per_destination_limit: config.federation.max_requests_per_destination,
            breaker_threshold: config.federation.circuit_breaker_threshold,
            breaker_cooldown: Duration::from_secs(config.federation.circuit_breaker_cooldown_secs),
            request_timeout: Duration::from_secs(config.federation.request_timeout_secs),
        }
    }

    /// The plain client, used for well-known lookups.
    pub(crate) fn default_client(&self) -> reqwest::Client {
        self.default_client.clone()
    }

    /// The retrying client used for federation requests proper.
    pub(crate) fn federation_client(&self) -> ClientWithMiddleware {
        self.federation_client.clone()
    }

    fn destination_semaphore(&self, destination: &ServerName) -> Arc<Semaphore> {
        self.per_destination
            .lock()
            .expect("semaphore lock poisoned")
            .entry(destination.to_owned())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_destination_limit)))
            .clone()
    }

    /// Whether a request to the destination may proceed right now.
    fn breaker_admits(&self, destination: &ServerName) -> bool {
        let mut breakers = self.breakers.lock().expect("breaker lock poisoned");
        match breakers.get_mut(destination) {
            None | Some(BreakerState::Closed { .. }) => true,
            Some(BreakerState::Open { since, probing }) => {
                if *probing {
                    false
                } else if since.elapsed() >= self.breaker_cooldown {
                    // One probe at a time.
                    *probing = true;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn breaker_record(&self, destination: &ServerName, success: bool) {
        let mut breakers = self.breakers.lock().expect("breaker lock poisoned");
        let state = breakers
            .entry(destination.to_owned())
            .or_insert(BreakerState::Closed { failures: 0 });

        if success {
            *state = BreakerState::Closed { failures: 0 };
            return;
        }

        match state {
            BreakerState::Closed { failures } => {
                *failures += 1;
                if *failures >= self.breaker_threshold {
                    info!(%destination, "circuit opened after repeated failures");
                    *state = BreakerState::Open {
                        since: Instant::now(),
                        probing: false,
                    };
                }
            }
            BreakerState::Open { since, probing } => {
                // The probe failed; start a fresh cooldown.
                *since = Instant::now();
                *probing = false;
            }
        }
    }
}

impl Server {
    /// Executes a signed federation request under the global and
    /// per-destination concurrency bounds, the circuit breaker and a
    /// deadline.
    ///
    /// Cancellation (dropping the returned future) releases both permits.
    pub async fn send_federation_request(
        &self,
        destination: &ServerName,
        request: reqwest::Request,
        timeout: Option<Duration>,
    ) -> AppResult<reqwest::Response> {
        let sending = self.sending();

        if !sending.breaker_admits(destination) {
            return Err(AppError::public(format!(
                "circuit breaker is open for {destination}"
            )));
        }

        let global_permit = sending
            .max_requests
            .clone()
            .acquire_owned()
            .await
            .expect("semaphore never closed");
        let destination_permit = sending
            .destination_semaphore(destination)
            .acquire_owned()
            .await
            .expect("semaphore never closed");

        let url = request.url().clone();
        let deadline = timeout.unwrap_or(sending.request_timeout);
        let result = tokio::time::timeout(
            deadline,
            crate::federation::send_request(self, destination, request),
        )
        .await
        .map_err(|_| {
            warn!("timeout waiting for server response of {url}");
            AppError::public("timeout waiting for server response")
        })
        .and_then(|r| r);

        drop(destination_permit);
        drop(global_permit);

        sending.breaker_record(destination, result.is_ok());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::test::test_server;

    #[test]
    fn breaker_opens_after_threshold_and_probes_after_cooldown() {
        let server = test_server();
        let sending = server.sending();
        let dest: OwnedServerName = "flaky.test".try_into().unwrap();

        for _ in 0..sending.breaker_threshold {
            assert!(sending.breaker_admits(&dest));
            sending.breaker_record(&dest, false);
        }
        assert!(!sending.breaker_admits(&dest), "circuit must be open");

        // Force the cooldown to elapse.
        {
            let mut breakers = sending.breakers.lock().unwrap();
            if let Some(BreakerState::Open { since, .. }) = breakers.get_mut(&dest) {
                *since = Instant::now() - sending.breaker_cooldown;
            }
        }

        // Exactly one probe is admitted.
        assert!(sending.breaker_admits(&dest));
        assert!(!sending.breaker_admits(&dest));

        // A successful probe closes the circuit again.
        sending.breaker_record(&dest, true);
        assert!(sending.breaker_admits(&dest));
    }
}
