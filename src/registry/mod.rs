// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Topology registry.
//!
//! Nodes register periodically; the registry places each one in its
//! generation's tree and answers with the chain it should follow.
//!
//! # Concurrency
//!
//! Any number of registry instances may share one [`RegistryStore`]. No lock
//! is held between reading a group and writing it back; instead every write
//! is conditional on the version that was read:
//!
//! ```text
//! loop (≤ max_attempts):
//!     read {entry, version}
//!     decode → upsert → classify offline → replan chains
//!     put(entry', version) ── Applied ──► respond with the persisted chain
//!                          └─ Conflict ─► sleep(base + jitter), retry
//! exhausted → RegistrationExhausted
//! ```

mod bootstrap;
mod types;

pub use bootstrap::{InMemoryNodeRequestStorage, NodeRequestStorage};
pub use types::{BootstrapType, RegistryResponse, StateSummary};

use crate::clock::{Clock, SystemClock};
use crate::config::RegistryConfig;
use crate::error::{ReplicationError, Result};
use crate::group::Group;
use crate::health::HealthClassifier;
use crate::metrics;
use crate::node::{NodeRecord, NodeStatus};
use crate::resilience::{BackoffPolicy, JitteredBackoff};
use crate::store::{CasOutcome, PersistedGroupRecord, RegistryStore};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use url::Url;

pub struct RegistrationService<S: RegistryStore> {
    store: Arc<S>,
    cloud_url: Url,
    classifier: HealthClassifier,
    backoff: Arc<dyn BackoffPolicy>,
    clock: Arc<dyn Clock>,
    requests: Option<Arc<dyn NodeRequestStorage>>,
}

impl<S: RegistryStore> RegistrationService<S> {
    pub fn new(config: &RegistryConfig, store: Arc<S>) -> Result<Self> {
        Ok(Self {
            store,
            cloud_url: config.cloud_url()?,
            classifier: HealthClassifier::new(config.offline_threshold_duration()),
            backoff: Arc::new(JitteredBackoff::from_config(&config.cas)),
            clock: Arc::new(SystemClock),
            requests: None,
        })
    }

    pub fn with_backoff(mut self, backoff: Arc<dyn BackoffPolicy>) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_node_requests(mut self, requests: Arc<dyn NodeRequestStorage>) -> Self {
        self.requests = Some(requests);
        self
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn cloud_url(&self) -> &Url {
        &self.cloud_url
    }

    /// Place `node` in its group and return the chain it should follow.
    pub async fn register(&self, node: NodeRecord) -> Result<RegistryResponse> {
        let group_id = node.group.clone();
        let max_attempts = self.backoff.max_attempts().max(1);

        for attempt in 1..=max_attempts {
            match self.try_register(&node).await? {
                Some(chain) => {
                    metrics::record_registration(&group_id, attempt);
                    let bootstrap = self.pending_bootstrap(&node).await?;
                    return Ok(RegistryResponse::new(chain).with_bootstrap(bootstrap));
                }
                None => {
                    metrics::record_cas_conflict(&group_id);
                    debug!(group_id = %group_id, node = %node.id(), attempt, "Registration conflicted, retrying");
                    if attempt < max_attempts {
                        tokio::time::sleep(self.backoff.delay(attempt)).await;
                    }
                }
            }
        }

        warn!(group_id = %group_id, node = %node.id(), attempts = max_attempts, "Registration gave up after repeated conflicts");
        metrics::record_registration_exhausted(&group_id);
        Err(ReplicationError::RegistrationExhausted {
            group_id,
            attempts: max_attempts,
        })
    }

    /// One read-modify-write round. `None` means the write lost the race.
    async fn try_register(&self, node: &NodeRecord) -> Result<Option<Vec<Url>>> {
        let group_id = node.group.as_str();
        let now = self.clock.now();

        let record = self.store.get(group_id).await?;
        let (mut group, version) = decode(group_id, record)?;

        group.upsert(node.clone(), &self.cloud_url, now);
        let demoted = self.classifier.apply(&mut group, now, &self.cloud_url);

        let id = node.id();
        let chain = match group.find_by_id(&id) {
            Some(stored) => stored.requested_to_follow.clone(),
            None => {
                error!(group_id, node = %id, "Node missing from its group right after upsert");
                return Err(ReplicationError::NodeNotFound { id });
            }
        };

        match self.store.put(group_id, group.encode()?, version).await? {
            CasOutcome::Applied { version } => {
                if demoted > 0 {
                    metrics::record_offline_demoted(group_id, demoted);
                }
                debug!(group_id, node = %id, version, chain_len = chain.len(), "Node registered");
                Ok(Some(chain))
            }
            CasOutcome::Conflict => Ok(None),
        }
    }

    async fn pending_bootstrap(&self, node: &NodeRecord) -> Result<Option<BootstrapType>> {
        let Some(requests) = &self.requests else {
            return Ok(None);
        };
        let bootstrap = requests.requires_bootstrap(&node.host()).await?;
        if let Some(kind) = bootstrap {
            info!(node = %node.id(), bootstrap = %kind, "Handing out bootstrap request");
        }
        Ok(bootstrap)
    }

    /// Queue a bootstrap for the node on `host`.
    pub async fn request_bootstrap(&self, host: &str, bootstrap: BootstrapType) -> Result<()> {
        match &self.requests {
            Some(requests) => requests.save(host, bootstrap).await,
            None => Err(ReplicationError::Unsupported(
                "no node request storage configured".to_string(),
            )),
        }
    }

    /// Snapshot of the fleet under a synthetic cloud root.
    ///
    /// Offline classification is applied to what is returned but not written
    /// back. An empty `groups` means every group.
    pub async fn get_summary(&self, offset: u64, status: NodeStatus, groups: &[String]) -> Result<StateSummary> {
        let now = self.clock.now();
        let records = self.store.list(groups).await?;

        let mut followers = Vec::new();
        for record in records {
            let mut group = Group::decode(record.group_id.clone(), &record.entry)?;
            self.classifier.apply(&mut group, now, &self.cloud_url);
            followers.extend(group.into_nodes());
        }

        Ok(StateSummary {
            root: NodeRecord::cloud(self.cloud_url.clone(), offset, status, now),
            followers,
        })
    }

    /// Remove the node on `host` from `group_id`.
    ///
    /// Returns `false` when there is no such group or node. A concurrent
    /// write surfaces as [`ReplicationError::VersionConflict`].
    pub async fn delete_node(&self, group_id: &str, host: &str) -> Result<bool> {
        let Some(record) = self.store.get(group_id).await? else {
            return Ok(false);
        };
        let Some(version) = record.version else {
            return Ok(false);
        };

        let mut group = Group::decode(group_id, &record.entry)?;
        if group.remove_by_host(host).is_none() {
            return Ok(false);
        }

        let outcome = if group.is_empty() {
            self.store.delete(group_id, version).await?
        } else {
            group.recompute_all(&self.cloud_url);
            self.store.put(group_id, group.encode()?, Some(version)).await?
        };

        match outcome {
            CasOutcome::Applied { .. } => {
                info!(group_id, host, remaining = group.len(), "Node removed");
                metrics::record_node_deleted(group_id);
                Ok(true)
            }
            CasOutcome::Conflict => {
                metrics::record_cas_conflict(group_id);
                Err(ReplicationError::VersionConflict {
                    group_id: group_id.to_string(),
                })
            }
        }
    }
}

fn decode(group_id: &str, record: Option<PersistedGroupRecord>) -> Result<(Group, Option<i64>)> {
    let record = record.unwrap_or_else(|| PersistedGroupRecord::unpersisted(group_id));
    let group = Group::decode(group_id, &record.entry)?;
    Ok((group, record.version))
}
