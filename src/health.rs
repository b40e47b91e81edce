//! Offline demotion.
//!
//! A node that has not registered within the offline threshold is marked
//! `OFFLINE` and moved behind every online node of its generation. Children
//! always sit at higher positions than their parents, so once offline nodes
//! fill the tail no online node has an offline ancestor.

use crate::group::Group;
use crate::node::NodeStatus;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tracing::info;
use url::Url;

#[derive(Debug, Clone, Copy)]
pub struct HealthClassifier {
    offline_threshold: Duration,
}

impl HealthClassifier {
    pub fn new(offline_threshold: Duration) -> Self {
        Self { offline_threshold }
    }

    pub fn offline_threshold(&self) -> Duration {
        self.offline_threshold
    }

    /// Mark stale nodes offline. Returns how many changed status.
    pub fn mark_offline(&self, group: &mut Group, now: DateTime<Utc>) -> usize {
        let mut demoted = 0;
        for generation in group.generations_mut() {
            for node in generation.nodes_mut().iter_mut() {
                if node.status != NodeStatus::Offline && node.is_stale(now, self.offline_threshold) {
                    node.status = NodeStatus::Offline;
                    demoted += 1;
                }
            }
        }
        demoted
    }

    /// Move offline nodes to the tail (stable) and replan every chain.
    pub fn reorder(&self, group: &mut Group, cloud_url: &Url) {
        for generation in group.generations_mut() {
            let nodes = std::mem::take(generation.nodes_mut());
            let (mut online, offline): (Vec<_>, Vec<_>) =
                nodes.into_iter().partition(|n| n.status != NodeStatus::Offline);
            online.extend(offline);
            *generation.nodes_mut() = online;
            generation.recompute_chains(cloud_url);
        }
    }

    /// Classify and reorder. Returns the number of newly offline nodes.
    pub fn apply(&self, group: &mut Group, now: DateTime<Utc>, cloud_url: &Url) -> usize {
        let demoted = self.mark_offline(group, now);
        if demoted > 0 {
            info!(group = %group.group_id(), demoted, "Nodes marked offline");
        }
        self.reorder(group, cloud_url);
        demoted
    }
}
