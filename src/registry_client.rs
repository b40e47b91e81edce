//! How a node reaches the registry.
//!
//! Production nodes POST their record to `{registry}/registry`; tests and
//! single-process deployments call a [`RegistrationService`] directly.

use crate::circuit_breaker::{CircuitBreaker, CircuitConfig};
use crate::error::{BoxFuture, ReplicationError, Result};
use crate::metrics;
use crate::node::NodeRecord;
use crate::registry::{RegistrationService, RegistryResponse};
use crate::resilience::RetryConfig;
use crate::store::RegistryStore;
use crate::upstream::endpoint;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, warn};
use url::Url;

const REGISTRY_PATH: &str = "registry";
const CIRCUIT_NAME: &str = "registry";

/// Registration transport.
pub trait RegistryClient: Send + Sync + 'static {
    fn register<'a>(&'a self, node: &'a NodeRecord) -> BoxFuture<'a, RegistryResponse>;
}

impl<S: RegistryStore> RegistryClient for RegistrationService<S> {
    fn register<'a>(&'a self, node: &'a NodeRecord) -> BoxFuture<'a, RegistryResponse> {
        Box::pin(RegistrationService::register(self, node.clone()))
    }
}

/// Registry over HTTP, retried per call and guarded by a circuit breaker.
pub struct HttpRegistryClient {
    client: reqwest::Client,
    url: Url,
    timeout: Duration,
    retry: RetryConfig,
    circuit: CircuitBreaker,
}

impl HttpRegistryClient {
    pub fn new(client: reqwest::Client, registry_url: &Url, timeout: Duration) -> Result<Self> {
        Ok(Self {
            client,
            url: endpoint(registry_url, REGISTRY_PATH)?,
            timeout,
            retry: RetryConfig::registration(),
            circuit: CircuitBreaker::new(CIRCUIT_NAME, CircuitConfig::default()),
        })
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_circuit(mut self, config: CircuitConfig) -> Self {
        self.circuit = CircuitBreaker::new(CIRCUIT_NAME, config);
        self
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn circuit(&self) -> &CircuitBreaker {
        &self.circuit
    }

    async fn post_once(&self, node: &NodeRecord) -> Result<RegistryResponse> {
        let send = async {
            let response = self.client.post(self.url.clone()).json(node).send().await?;
            let status = response.status();
            if status.is_client_error() && status != reqwest::StatusCode::CONFLICT {
                let body = response.text().await.unwrap_or_default();
                return Err(ReplicationError::InvalidRequest(format!(
                    "registry answered {status}: {body}"
                )));
            }
            if !status.is_success() {
                return Err(ReplicationError::upstream(&self.url, format!("status {}", status)));
            }
            Ok::<_, ReplicationError>(response.json::<RegistryResponse>().await?)
        };

        timeout(self.timeout.min(self.retry.connection_timeout), send)
            .await
            .map_err(|_| ReplicationError::UpstreamTimeout {
                url: self.url.to_string(),
            })?
    }

    async fn post_with_retry(&self, node: &NodeRecord) -> Result<RegistryResponse> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let started = Instant::now();
            match self.post_once(node).await {
                Ok(response) => {
                    metrics::record_registration_call(true, started.elapsed());
                    return Ok(response);
                }
                Err(e) => {
                    metrics::record_registration_call(false, started.elapsed());
                    if !e.is_retryable() || attempt >= self.retry.max_attempts {
                        return Err(e);
                    }
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        registry = %self.url,
                        attempt,
                        max_attempts = self.retry.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Registration failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

impl RegistryClient for HttpRegistryClient {
    fn register<'a>(&'a self, node: &'a NodeRecord) -> BoxFuture<'a, RegistryResponse> {
        Box::pin(async move {
            let response = self.circuit.call(|| self.post_with_retry(node)).await?;
            debug!(
                registry = %self.url,
                chain_len = response.requested_to_follow.len(),
                bootstrap = ?response.bootstrap_type,
                "Registered with registry"
            );
            Ok(response)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use crate::store::InMemoryRegistryStore;
    use std::sync::Arc;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_http_client_targets_registry_path() {
        let client = HttpRegistryClient::new(
            reqwest::Client::new(),
            &url("http://registry.internal:8080/api"),
            Duration::from_secs(1),
        )
        .unwrap();
        assert_eq!(client.url(), &url("http://registry.internal:8080/api/registry"));
        assert_eq!(client.circuit().name(), "registry");
    }

    #[tokio::test]
    async fn test_service_as_client() {
        let config = RegistryConfig::for_testing("https://cloud.example.com/");
        let service = RegistrationService::new(&config, Arc::new(InMemoryRegistryStore::new())).unwrap();
        let node = NodeRecord::new("g", "v1", url("http://10.0.0.1:8080/"));

        let client: &dyn RegistryClient = &service;
        let response = client.register(&node).await.unwrap();
        assert_eq!(response.requested_to_follow, vec![url("https://cloud.example.com/")]);
    }
}
