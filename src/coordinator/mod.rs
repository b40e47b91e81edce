// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Replicating node coordinator.
//!
//! Ties together:
//! - The follow chain via [`crate::upstream::ServiceList`]
//! - The pull loop reading from the first upstream that is up
//! - Cursor persistence via [`crate::cursor::CursorStore`]
//! - Periodic registration and bootstrap handling
//! - Upstream health probes
//!
//! # Lifecycle
//!
//! 1. Opens the cursor store and restores the persisted chain
//! 2. Resumes at the larger of the cursor and the local log's newest offset
//! 3. Spawns the pull loop, registration, cursor flush and health tasks
//! 4. On shutdown, signals every task, waits for them with a timeout and
//!    closes the cursor store

mod bootstrap;
mod health_probe;
mod pull_loop;
mod registration;
mod types;

pub use bootstrap::{BootstrapDispatcher, Bootstrapable, Resettable};
pub use health_probe::{probe_all, ProbeSummary};
pub use pull_loop::{PipeControl, PullLoop, Step};
pub use registration::Registrar;
pub use types::{HealthCheck, NodeState, Progress, PullState, UpstreamHealth};

use crate::config::NodeConfig;
use crate::cursor::CursorStore;
use crate::error::{ReplicationError, Result};
use crate::metrics;
use crate::node::NodeRecord;
use crate::pipe::{OffsetName, Reader, Writer};
use crate::registry_client::{HttpRegistryClient, RegistryClient};
use crate::upstream::{HttpUpstreamClient, LoadBalancer, ServiceList, UpstreamClient};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tracing::{debug, error, info, warn};

/// How long shutdown waits for each task.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// A node that follows its registry-assigned chain into a local log.
///
/// The local log `L` is what this node serves to its own followers; the
/// node only ever appends to it.
pub struct ReplicationNode<L: Reader + Writer> {
    config: NodeConfig,
    local: Arc<L>,
    upstream: Arc<dyn UpstreamClient>,
    registry: Arc<dyn RegistryClient>,
    provider: Option<Arc<dyn Bootstrapable>>,
    corruption: Option<Arc<dyn Resettable>>,

    state_tx: watch::Sender<NodeState>,
    state_rx: watch::Receiver<NodeState>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,

    services: Option<Arc<ServiceList>>,
    control: Option<Arc<PipeControl>>,
    pull_state: Option<watch::Receiver<PullState>>,
    cursor: Option<Arc<CursorStore>>,

    handles: RwLock<Vec<tokio::task::JoinHandle<()>>>,
}

impl<L: Reader + Writer> ReplicationNode<L> {
    pub fn new(
        config: NodeConfig,
        local: Arc<L>,
        upstream: Arc<dyn UpstreamClient>,
        registry: Arc<dyn RegistryClient>,
    ) -> Self {
        let (state_tx, state_rx) = watch::channel(NodeState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            config,
            local,
            upstream,
            registry,
            provider: None,
            corruption: None,
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            services: None,
            control: None,
            pull_state: None,
            cursor: None,
            handles: RwLock::new(Vec::new()),
        }
    }

    /// A node talking HTTP to its upstreams and registry.
    pub fn from_config(config: NodeConfig, local: Arc<L>) -> Result<Self> {
        config.validate()?;
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| ReplicationError::Config(format!("HTTP client: {e}")))?;

        let upstream = Arc::new(HttpUpstreamClient::new(
            http.clone(),
            config.read.timeout_duration(),
            config.health_check.timeout_duration(),
        ));
        let registry = Arc::new(HttpRegistryClient::new(
            http,
            &config.registry_url()?,
            config.registration.timeout_duration(),
        )?);
        Ok(Self::new(config, local, upstream, registry))
    }

    pub fn with_provider(mut self, provider: Arc<dyn Bootstrapable>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn with_corruption_manager(mut self, corruption: Arc<dyn Resettable>) -> Self {
        self.corruption = Some(corruption);
        self
    }

    pub fn state(&self) -> NodeState {
        *self.state_rx.borrow()
    }

    pub fn state_receiver(&self) -> watch::Receiver<NodeState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), NodeState::Running)
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// The follow chain, once started.
    pub fn services(&self) -> Option<&Arc<ServiceList>> {
        self.services.as_ref()
    }

    /// Pipe control (pause/reset), once started.
    pub fn pipe(&self) -> Option<&Arc<PipeControl>> {
        self.control.as_ref()
    }

    pub fn progress(&self) -> Progress {
        self.control.as_ref().map(|c| c.progress()).unwrap_or_default()
    }

    /// Health snapshot. No network I/O.
    pub async fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let pull_state = self
            .pull_state
            .as_ref()
            .map(|rx| rx.borrow().clone())
            .unwrap_or(PullState::Exhausted);

        let mut upstreams = Vec::new();
        if let Some(services) = &self.services {
            for instance in services.instances().await {
                upstreams.push(UpstreamHealth {
                    url: instance.url().clone(),
                    up: instance.is_up(),
                    failure_count: instance.failure_count(),
                    millis_since_success: instance.millis_since_success(),
                });
            }
        }
        let upstreams_up = upstreams.iter().filter(|u| u.up).count();

        HealthCheck {
            ready: state == NodeState::Running && matches!(pull_state, PullState::Following(_)),
            state,
            pull_state,
            progress: self.progress(),
            upstreams_total: upstreams.len(),
            upstreams_up,
            upstreams,
        }
    }

    fn set_state(&self, state: NodeState) {
        let _ = self.state_tx.send(state);
        metrics::set_node_state(&state.to_string());
    }

    /// Start replicating.
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != NodeState::Created {
            return Err(ReplicationError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        info!(
            group = %self.config.group,
            generation = %self.config.generation,
            local_url = %self.config.local_url,
            "Starting replication node"
        );
        self.set_state(NodeState::Starting);

        if let Err(e) = self.open().await {
            error!(error = %e, "Failed to start replication node");
            self.set_state(NodeState::Failed);
            return Err(e);
        }

        self.set_state(NodeState::Running);
        info!("Replication node running");
        Ok(())
    }

    async fn open(&mut self) -> Result<()> {
        self.config.validate()?;
        let local_url = self.config.local_url()?;
        let cloud_url = self.config.cloud_url()?;
        let location = self.config.read.location.clone();

        let cursor = Arc::new(CursorStore::new(&self.config.cursor).await?);
        let cursor_offset = cursor.get_or_start(&location).await;
        let local_offset = self.local.offset(OffsetName::LocalLatestOffset).await?.unwrap_or(0);
        let start_offset = cursor_offset.max(local_offset);
        if local_offset > cursor_offset {
            debug!(cursor_offset, local_offset, "Local log is ahead of the cursor");
        }
        info!(location = %location, offset = start_offset, "Resuming");

        let services = Arc::new(if self.config.service_list_path.is_empty() {
            ServiceList::new(cloud_url)
        } else {
            ServiceList::load(&self.config.service_list_path, cloud_url).await?
        });
        let balancer = LoadBalancer::new(Arc::clone(&services));

        let writer: Arc<dyn Writer> = self.local.clone();
        let control = Arc::new(PipeControl::new(
            writer,
            Some(Arc::clone(&cursor)),
            location,
            Progress::resume(start_offset),
        ));

        let mut dispatcher = BootstrapDispatcher::new(
            Arc::clone(&control) as Arc<dyn Bootstrapable>,
            self.config.registration.bootstrap_wait(),
        );
        if let Some(provider) = &self.provider {
            dispatcher = dispatcher.with_provider(Arc::clone(provider));
        }
        if let Some(corruption) = &self.corruption {
            dispatcher = dispatcher.with_corruption_manager(Arc::clone(corruption));
        }

        let identity = NodeRecord::new(&self.config.group, &self.config.generation, local_url);
        let registrar = Registrar::new(
            &identity,
            Arc::clone(&self.registry),
            balancer.clone(),
            control.subscribe_progress(),
        )
        .with_bootstrap(Arc::new(dispatcher));

        let pull = PullLoop::new(
            balancer,
            Arc::clone(&self.upstream),
            Arc::clone(&control),
            self.config.read.types.clone(),
        );
        self.pull_state = Some(pull.subscribe_state());

        let mut handles = self.handles.write().await;

        let shutdown_rx = self.shutdown_rx.clone();
        handles.push(tokio::spawn(pull.run(shutdown_rx)));

        let interval = self.config.registration.interval_duration();
        let shutdown_rx = self.shutdown_rx.clone();
        handles.push(tokio::spawn(registrar.run(interval, shutdown_rx)));

        handles.push(spawn_cursor_flush(
            Arc::clone(&cursor),
            self.config.cursor.flush_interval_duration(),
            self.shutdown_rx.clone(),
        ));

        if self.config.health_check.enabled {
            handles.push(tokio::spawn(health_probe::run_health_probe(
                Arc::clone(&services),
                Arc::clone(&self.upstream),
                self.config.health_check.clone(),
                self.shutdown_rx.clone(),
            )));
        }
        drop(handles);

        self.services = Some(services);
        self.control = Some(control);
        self.cursor = Some(cursor);
        Ok(())
    }

    /// Shutdown gracefully.
    ///
    /// 1. Signal all tasks to stop
    /// 2. Wait for each with a timeout
    /// 3. Flush and close the cursor store
    pub async fn shutdown(&mut self) {
        info!("Shutting down replication node");
        self.set_state(NodeState::ShuttingDown);
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<_> = std::mem::take(&mut *self.handles.write().await);
        if !handles.is_empty() {
            info!(task_count = handles.len(), "Waiting for tasks to complete");
        }
        for (i, handle) in handles.into_iter().enumerate() {
            match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
                Ok(Ok(())) => debug!(task = i + 1, "Task completed gracefully"),
                Ok(Err(e)) => warn!(task = i + 1, error = %e, "Task panicked during shutdown"),
                Err(_) => warn!(task = i + 1, "Task timed out during shutdown"),
            }
        }

        if let Some(cursor) = self.cursor.take() {
            cursor.close().await;
        }

        self.set_state(NodeState::Stopped);
        info!("Replication node stopped");
    }
}

/// Flush dirty cursors on an interval; once more on shutdown.
fn spawn_cursor_flush(
    cursor: Arc<CursorStore>,
    interval: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut timer = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = timer.tick() => {
                    if let Err(e) = cursor.flush_dirty().await {
                        warn!(error = %e, "Failed to flush cursors");
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!("Cursor flush task stopping");
                        break;
                    }
                }
            }
        }
    })
}
