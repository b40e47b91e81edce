// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Shared test utilities for integration and chaos tests.
//!
//! This module provides:
//! - An in-process "network" of pipes keyed by URL
//! - Registry stores that lose CAS races on demand
//! - Node/config builders and a polling helper

#![allow(dead_code)]

use pipe_replication::config::{LogConfig, NodeConfig, RegistryConfig};
use pipe_replication::error::{BoxFuture, ReplicationError};
use pipe_replication::pipe::{InMemoryLog, Message, MessageResults, ReadRequest, Reader, Writer};
use pipe_replication::resilience::FixedBackoff;
use pipe_replication::store::{CasOutcome, InMemoryRegistryStore, PersistedGroupRecord, RegistryStore};
use pipe_replication::upstream::UpstreamClient;
use pipe_replication::{RegistrationService, ReplicationNode};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

pub const CLOUD: &str = "https://cloud.example.com/";

pub fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
}

pub fn node_url(host: &str) -> Url {
    url(&format!("http://{host}:8080/"))
}

/// Log config with a short retry-after so caught-up loops poll quickly.
pub fn fast_log() -> LogConfig {
    LogConfig {
        retry_after: "100ms".to_string(),
        ..LogConfig::default()
    }
}

pub fn registry_config() -> RegistryConfig {
    RegistryConfig::for_testing(CLOUD)
}

pub fn registry(store: Arc<InMemoryRegistryStore>) -> Arc<RegistrationService<InMemoryRegistryStore>> {
    Arc::new(
        RegistrationService::new(&registry_config(), store)
            .unwrap()
            .with_backoff(Arc::new(FixedBackoff::zero(10))),
    )
}

pub fn node_config(group: &str, host: &str) -> NodeConfig {
    let mut config = NodeConfig::for_testing(group, node_url(host).as_str(), CLOUD);
    config.read.location = "store-0042".to_string();
    config
}

/// Append `count` messages of type `X` after the log's head.
pub async fn publish(log: &InMemoryLog, count: usize) -> u64 {
    let messages = (0..count)
        .map(|i| Message::new("X", format!("k{i}"), "{}"))
        .collect();
    log.write_messages(messages).await.unwrap()
}

/// Poll `check` every 20ms until it holds or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// =============================================================================
// MockNetwork: upstream pipes keyed by URL
// =============================================================================

/// Serves reads straight out of registered logs. URLs that are unknown or
/// marked down fail like a refused connection.
#[derive(Default)]
pub struct MockNetwork {
    logs: Mutex<HashMap<Url, Arc<InMemoryLog>>>,
    down: Mutex<HashSet<Url>>,
    reads: Mutex<Vec<(Url, u64)>>,
    probes: AtomicUsize,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn serve(&self, at: &Url, log: Arc<InMemoryLog>) {
        self.logs.lock().unwrap().insert(at.clone(), log);
    }

    pub fn set_down(&self, at: &Url, down: bool) {
        let mut set = self.down.lock().unwrap();
        if down {
            set.insert(at.clone());
        } else {
            set.remove(at);
        }
    }

    /// Every read served or refused, in order.
    pub fn reads(&self) -> Vec<(Url, u64)> {
        self.reads.lock().unwrap().clone()
    }

    pub fn reads_from(&self, at: &Url) -> usize {
        self.reads.lock().unwrap().iter().filter(|(u, _)| u == at).count()
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    fn reachable(&self, at: &Url) -> Option<Arc<InMemoryLog>> {
        if self.down.lock().unwrap().contains(at) {
            return None;
        }
        self.logs.lock().unwrap().get(at).cloned()
    }
}

impl UpstreamClient for MockNetwork {
    fn read<'a>(&'a self, upstream: &'a Url, request: &'a ReadRequest) -> BoxFuture<'a, MessageResults> {
        Box::pin(async move {
            self.reads.lock().unwrap().push((upstream.clone(), request.offset));
            match self.reachable(upstream) {
                Some(log) => log.read(request).await,
                None => Err(ReplicationError::upstream(upstream, "connection refused")),
            }
        })
    }

    fn probe<'a>(&'a self, upstream: &'a Url) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            self.probes.fetch_add(1, Ordering::SeqCst);
            match self.reachable(upstream) {
                Some(_) => Ok(()),
                None => Err(ReplicationError::upstream(upstream, "status 503")),
            }
        })
    }
}

/// A node on `host` serving its local log on the network.
pub fn spawn_node(
    network: &Arc<MockNetwork>,
    registry: &Arc<RegistrationService<InMemoryRegistryStore>>,
    config: NodeConfig,
) -> (ReplicationNode<InMemoryLog>, Arc<InMemoryLog>) {
    let local = Arc::new(InMemoryLog::new(&fast_log()));
    network.serve(&config.local_url().unwrap(), Arc::clone(&local));
    let node = ReplicationNode::new(config, Arc::clone(&local), network.clone(), registry.clone());
    (node, local)
}

// =============================================================================
// Registry stores for CAS races
// =============================================================================

/// Wraps the in-memory store and rejects the next `n` puts as conflicts.
pub struct ConflictingStore {
    inner: InMemoryRegistryStore,
    conflicts_left: AtomicUsize,
    puts: AtomicUsize,
}

impl ConflictingStore {
    pub fn new(conflicts: usize) -> Self {
        Self {
            inner: InMemoryRegistryStore::new(),
            conflicts_left: AtomicUsize::new(conflicts),
            puts: AtomicUsize::new(0),
        }
    }

    pub fn put_attempts(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn inner(&self) -> &InMemoryRegistryStore {
        &self.inner
    }
}

impl RegistryStore for ConflictingStore {
    fn get<'a>(&'a self, group_id: &'a str) -> BoxFuture<'a, Option<PersistedGroupRecord>> {
        self.inner.get(group_id)
    }

    fn list<'a>(&'a self, group_ids: &'a [String]) -> BoxFuture<'a, Vec<PersistedGroupRecord>> {
        self.inner.list(group_ids)
    }

    fn put<'a>(&'a self, group_id: &'a str, entry: String, expected: Option<i64>) -> BoxFuture<'a, CasOutcome> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        let lose = self
            .conflicts_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if lose {
            return Box::pin(async { Ok(CasOutcome::Conflict) });
        }
        self.inner.put(group_id, entry, expected)
    }

    fn delete<'a>(&'a self, group_id: &'a str, expected: i64) -> BoxFuture<'a, CasOutcome> {
        self.inner.delete(group_id, expected)
    }
}

/// Yields between the read and the write of every CAS so concurrent
/// registrations genuinely interleave.
pub struct InterleavingStore {
    inner: InMemoryRegistryStore,
}

impl InterleavingStore {
    pub fn new() -> Self {
        Self {
            inner: InMemoryRegistryStore::new(),
        }
    }
}

impl RegistryStore for InterleavingStore {
    fn get<'a>(&'a self, group_id: &'a str) -> BoxFuture<'a, Option<PersistedGroupRecord>> {
        Box::pin(async move {
            let row = self.inner.get(group_id).await;
            tokio::task::yield_now().await;
            row
        })
    }

    fn list<'a>(&'a self, group_ids: &'a [String]) -> BoxFuture<'a, Vec<PersistedGroupRecord>> {
        self.inner.list(group_ids)
    }

    fn put<'a>(&'a self, group_id: &'a str, entry: String, expected: Option<i64>) -> BoxFuture<'a, CasOutcome> {
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.inner.put(group_id, entry, expected).await
        })
    }

    fn delete<'a>(&'a self, group_id: &'a str, expected: i64) -> BoxFuture<'a, CasOutcome> {
        self.inner.delete(group_id, expected)
    }
}
