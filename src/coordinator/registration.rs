//! Periodic self-registration.
//!
//! Every interval the node reports its identity, offset, status, pipe state
//! and the upstreams it considers up. The chain in the answer replaces the
//! service list; a bootstrap instruction is handed to the dispatcher.

use super::bootstrap::BootstrapDispatcher;
use super::types::Progress;
use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::metrics;
use crate::node::NodeRecord;
use crate::pipe::OffsetName;
use crate::registry::{BootstrapType, RegistryResponse};
use crate::registry_client::RegistryClient;
use crate::upstream::LoadBalancer;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, info_span, warn, Instrument};
use url::Url;

pub struct Registrar {
    group: String,
    generation: String,
    local_url: Url,
    client: Arc<dyn RegistryClient>,
    balancer: LoadBalancer,
    progress: watch::Receiver<Progress>,
    bootstrap: Option<Arc<BootstrapDispatcher>>,
    clock: Arc<dyn Clock>,
}

impl Registrar {
    pub fn new(
        identity: &NodeRecord,
        client: Arc<dyn RegistryClient>,
        balancer: LoadBalancer,
        progress: watch::Receiver<Progress>,
    ) -> Self {
        Self {
            group: identity.group.clone(),
            generation: identity.generation.clone(),
            local_url: identity.local_url.clone(),
            client,
            balancer,
            progress,
            bootstrap: None,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_bootstrap(mut self, dispatcher: Arc<BootstrapDispatcher>) -> Self {
        self.bootstrap = Some(dispatcher);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// What the node tells the registry right now.
    pub async fn record(&self) -> NodeRecord {
        let progress = self.progress.borrow().clone();
        let mut record = NodeRecord::new(&self.group, &self.generation, self.local_url.clone())
            .with_offset(progress.offset)
            .with_status(progress.status)
            .with_following(self.balancer.following().await)
            .with_requested_to_follow(self.balancer.services().urls().await)
            .with_last_seen(self.clock.now())
            .with_pipe_state(progress.pipe_state)
            .with_named_offset(OffsetName::PipeOffset.as_str(), progress.offset);
        if let Some(latest) = progress.global_latest_offset {
            record = record.with_named_offset(OffsetName::GlobalLatestOffset.as_str(), latest);
        }
        record
    }

    /// Register once and act on the answer.
    pub async fn register_once(&self) -> Result<RegistryResponse> {
        let record = self.record().await;
        let response = self.client.register(&record).await?;

        metrics::set_follow_chain_len(response.requested_to_follow.len());
        self.balancer
            .services()
            .update(response.requested_to_follow.clone())
            .await?;

        if let Some(kind) = response.bootstrap_type.filter(|k| *k != BootstrapType::None) {
            match &self.bootstrap {
                Some(dispatcher) => {
                    info!(bootstrap = %kind, "Registry requested bootstrap");
                    dispatcher.dispatch(kind);
                }
                None => warn!(bootstrap = %kind, "Registry requested bootstrap but none is configured"),
            }
        }
        Ok(response)
    }

    /// Register on `interval` until shutdown. The first registration is immediate.
    pub async fn run(self, interval: Duration, mut shutdown_rx: watch::Receiver<bool>) {
        let span = info_span!("registration", node = %self.local_url);

        async move {
            info!(interval_ms = interval.as_millis() as u64, "Starting registration task");
            let mut timer = tokio::time::interval(interval);
            timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = timer.tick() => {
                        match self.register_once().await {
                            Ok(response) => debug!(
                                chain_len = response.requested_to_follow.len(),
                                "Registration refreshed"
                            ),
                            // Keep following the last chain; the next tick retries.
                            Err(e) => warn!(error = %e, "Registration failed"),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("Registration task stopping");
                            break;
                        }
                    }
                }
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::{BoxFuture, ReplicationError};
    use crate::node::NodeStatus;
    use crate::pipe::PipeState;
    use crate::upstream::ServiceList;
    use std::sync::Mutex;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    struct FixedRegistry {
        chain: Vec<Url>,
        seen: Mutex<Vec<NodeRecord>>,
        fail: bool,
    }

    impl RegistryClient for FixedRegistry {
        fn register<'a>(&'a self, node: &'a NodeRecord) -> BoxFuture<'a, RegistryResponse> {
            Box::pin(async move {
                self.seen.lock().unwrap().push(node.clone());
                if self.fail {
                    return Err(ReplicationError::CircuitOpen("registry".to_string()));
                }
                Ok(RegistryResponse::new(self.chain.clone()))
            })
        }
    }

    fn registrar(registry: Arc<FixedRegistry>, progress: Progress) -> (Registrar, Arc<ServiceList>, watch::Sender<Progress>) {
        let services = Arc::new(ServiceList::new(url("https://cloud/")));
        let (tx, rx) = watch::channel(progress);
        let identity = NodeRecord::new("store-1", "v1", url("http://10.0.0.5:8080/"));
        let registrar = Registrar::new(&identity, registry, LoadBalancer::new(services.clone()), rx)
            .with_clock(Arc::new(ManualClock::new(chrono::Utc::now())));
        (registrar, services, tx)
    }

    #[tokio::test]
    async fn test_record_reports_progress() {
        let registry = Arc::new(FixedRegistry {
            chain: vec![],
            seen: Mutex::new(vec![]),
            fail: false,
        });
        let progress = Progress {
            offset: 105,
            pipe_state: PipeState::UpToDate,
            global_latest_offset: Some(105),
            status: NodeStatus::Following,
        };
        let (registrar, _services, _tx) = registrar(registry, progress);

        let record = registrar.record().await;
        assert_eq!(record.id(), "store-1|http://10.0.0.5:8080/");
        assert_eq!(record.offset, 105);
        assert_eq!(record.status, NodeStatus::Following);
        assert_eq!(record.pipe_state(), PipeState::UpToDate);
        assert_eq!(record.following, vec![url("https://cloud/")]);
        assert_eq!(record.offsets.get("GLOBAL_LATEST_OFFSET"), Some(&105));
        assert_eq!(record.offsets.get("PIPE_OFFSET"), Some(&105));
    }

    #[tokio::test]
    async fn test_register_once_replaces_chain() {
        let chain = vec![url("http://10.0.0.1:8080/"), url("https://cloud/")];
        let registry = Arc::new(FixedRegistry {
            chain: chain.clone(),
            seen: Mutex::new(vec![]),
            fail: false,
        });
        let (registrar, services, _tx) = registrar(registry.clone(), Progress::default());

        let response = registrar.register_once().await.unwrap();
        assert_eq!(response.requested_to_follow, chain);
        assert_eq!(services.urls().await, chain);

        // the next report carries the new chain
        let record = registrar.record().await;
        assert_eq!(record.requested_to_follow, chain);
        assert_eq!(registry.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_registration_keeps_chain() {
        let registry = Arc::new(FixedRegistry {
            chain: vec![],
            seen: Mutex::new(vec![]),
            fail: true,
        });
        let (registrar, services, _tx) = registrar(registry, Progress::default());
        services
            .update(vec![url("http://10.0.0.1:8080/"), url("https://cloud/")])
            .await
            .unwrap();

        assert!(registrar.register_once().await.is_err());
        assert_eq!(services.urls().await.len(), 2);
    }
}
