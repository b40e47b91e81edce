// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Chaos tests: simulate contention and failures and verify the system
//! converges without panics, lost writes or out-of-order application.
//!
//! Run with: cargo test --test chaos_tests -- --nocapture

mod common;

use common::*;
use futures::future::join_all;
use pipe_replication::pipe::InMemoryLog;
use pipe_replication::resilience::FixedBackoff;
use pipe_replication::store::{CasOutcome, InMemoryRegistryStore, RegistryStore};
use pipe_replication::{NodeRecord, NodeStatus, RegistrationService, ReplicationError};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn record(host: &str) -> NodeRecord {
    NodeRecord::new("store-0042", "v1", node_url(host))
}

// =============================================================================
// Registry contention
// =============================================================================

/// Test: concurrent registrations into one group all land exactly once
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_registrations_all_land() {
    let registry = Arc::new(
        RegistrationService::new(&registry_config(), Arc::new(InterleavingStore::new()))
            .unwrap()
            .with_backoff(Arc::new(FixedBackoff::zero(16))),
    );

    let hosts: Vec<String> = (0..8).map(|i| format!("n{i}")).collect();
    let results = join_all(hosts.iter().map(|host| {
        let registry = Arc::clone(&registry);
        let host = host.clone();
        tokio::spawn(async move { registry.register(record(&host)).await })
    }))
    .await;

    for result in results {
        let response = result.unwrap().unwrap();
        assert_eq!(response.requested_to_follow.last(), Some(&url(CLOUD)));
    }

    let summary = registry.get_summary(0, NodeStatus::Ok, &[]).await.unwrap();
    let registered: HashSet<_> = summary.followers.iter().map(|n| n.host()).collect();
    let expected: HashSet<_> = hosts.iter().cloned().collect();
    assert_eq!(registered, expected);
    assert_eq!(summary.followers.len(), hosts.len());

    // every chain is exactly the ancestor path of its position
    for (index, node) in summary.followers.iter().enumerate() {
        assert_eq!(
            node.requested_to_follow.len(),
            pipe_replication::topology::depth(index),
            "node {} at {index}",
            node.host()
        );
    }
}

/// Test: a stale version never wins
#[tokio::test]
async fn cas_same_version_only_one_writer_wins() {
    let store = InMemoryRegistryStore::new();
    let created = store.put("store-0042", "[]".to_string(), None).await.unwrap();
    let CasOutcome::Applied { version } = created else {
        panic!("first insert must apply");
    };

    let first = store.put("store-0042", "[]".to_string(), Some(version)).await.unwrap();
    let second = store.put("store-0042", "[]".to_string(), Some(version)).await.unwrap();
    assert!(first.is_applied());
    assert_eq!(second, CasOutcome::Conflict);

    // a second insert of an existing row conflicts too
    let again = store.put("store-0042", "[]".to_string(), None).await.unwrap();
    assert_eq!(again, CasOutcome::Conflict);
}

/// Test: conflicts are retried until the write lands
#[tokio::test]
async fn registration_retries_through_conflicts() {
    let store = Arc::new(ConflictingStore::new(3));
    let registry = RegistrationService::new(&registry_config(), store.clone())
        .unwrap()
        .with_backoff(Arc::new(FixedBackoff::zero(5)));

    let response = registry.register(record("a")).await.unwrap();
    assert_eq!(response.requested_to_follow, vec![url(CLOUD)]);
    assert_eq!(store.put_attempts(), 4);
    assert_eq!(store.inner().len().await, 1);
}

/// Test: endless conflicts give up after the retry budget
#[tokio::test]
async fn registration_gives_up_after_budget() {
    let store = Arc::new(ConflictingStore::new(usize::MAX));
    let registry = RegistrationService::new(&registry_config(), store.clone())
        .unwrap()
        .with_backoff(Arc::new(FixedBackoff::zero(4)));

    match registry.register(record("a")).await {
        Err(ReplicationError::RegistrationExhausted { group_id, attempts }) => {
            assert_eq!(group_id, "store-0042");
            assert_eq!(attempts, 4);
        }
        other => panic!("expected RegistrationExhausted, got {other:?}"),
    }
    assert_eq!(store.put_attempts(), 4);
    assert!(store.inner().is_empty().await);
}

/// Test: a conflicting delete is surfaced, not silently dropped
#[tokio::test]
async fn delete_conflict_is_reported() {
    let store = Arc::new(ConflictingStore::new(0));
    let registry = RegistrationService::new(&registry_config(), store.clone())
        .unwrap()
        .with_backoff(Arc::new(FixedBackoff::zero(3)));
    registry.register(record("a")).await.unwrap();
    registry.register(record("b")).await.unwrap();

    let racing = Arc::new(ConflictingStore::new(1));
    let row = store.get("store-0042").await.unwrap().unwrap();
    racing
        .inner()
        .put("store-0042", row.entry, None)
        .await
        .unwrap();
    let registry = RegistrationService::new(&registry_config(), racing).unwrap();

    assert!(matches!(
        registry.delete_node("store-0042", "a").await,
        Err(ReplicationError::VersionConflict { .. })
    ));
    // the race is over; the retry goes through
    assert!(registry.delete_node("store-0042", "a").await.unwrap());
}

// =============================================================================
// Flapping upstreams
// =============================================================================

/// Test: a parent going up and down never breaks ordering or loses data
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn flapping_parent_converges() {
    let network = MockNetwork::new();
    let origin = Arc::new(InMemoryLog::origin(&fast_log()));
    network.serve(&url(CLOUD), origin.clone());
    publish(&origin, 50).await;

    let registry = registry(Arc::new(InMemoryRegistryStore::new()));
    let (mut a, _a_log) = spawn_node(&network, &registry, node_config("store-0042", "a"));
    a.start().await.unwrap();
    let (mut b, b_log) = spawn_node(&network, &registry, node_config("store-0042", "b"));
    b.start().await.unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let flapper = {
        let network = Arc::clone(&network);
        let stop = Arc::clone(&stop);
        tokio::spawn(async move {
            let mut down = false;
            while !stop.load(Ordering::SeqCst) {
                down = !down;
                network.set_down(&node_url("a"), down);
                tokio::time::sleep(Duration::from_millis(30)).await;
            }
            network.set_down(&node_url("a"), false);
        })
    };
    let publisher = {
        let origin = Arc::clone(&origin);
        tokio::spawn(async move {
            for _ in 0..20 {
                publish(&origin, 5).await;
                tokio::time::sleep(Duration::from_millis(15)).await;
            }
        })
    };

    publisher.await.unwrap();
    stop.store(true, Ordering::SeqCst);
    flapper.await.unwrap();

    assert!(wait_until(Duration::from_secs(10), || async { b.progress().offset == 150 }).await);
    // the local log refuses out-of-order writes, so equality means every
    // batch landed once and in order
    assert_eq!(b_log.messages().await, origin.messages().await);

    b.shutdown().await;
    a.shutdown().await;
}

/// Test: a chain where everything but the cloud is dead still replicates
#[tokio::test]
async fn dead_chain_falls_through_to_cloud() {
    let network = MockNetwork::new();
    let origin = Arc::new(InMemoryLog::origin(&fast_log()));
    network.serve(&url(CLOUD), origin.clone());
    publish(&origin, 25).await;

    // three registered hosts that never serve anything
    let registry = registry(Arc::new(InMemoryRegistryStore::new()));
    for host in ["a", "b", "c"] {
        registry.register(record(host)).await.unwrap();
    }

    let (mut d, d_log) = spawn_node(&network, &registry, node_config("store-0042", "d"));
    d.start().await.unwrap();

    assert!(wait_until(Duration::from_secs(5), || async { d.progress().offset == 25 }).await);
    assert_eq!(d_log.len().await, 25);
    assert!(
        wait_until(Duration::from_secs(5), || async {
            network.reads_from(&node_url("b")) > 0 && network.reads_from(&node_url("a")) > 0
        })
        .await
    );
    // still served by the cloud
    publish(&origin, 5).await;
    assert!(wait_until(Duration::from_secs(5), || async { d.progress().offset == 30 }).await);

    d.shutdown().await;
}
