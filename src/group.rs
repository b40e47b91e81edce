//! Group membership.
//!
//! A [`Group`] is everything the registry persists under one group id: its
//! nodes, split into generation groups. Nodes only ever follow nodes of
//! their own generation, so each [`GenerationGroup`] is its own tree.
//!
//! On disk a group is a flat JSON array of node records; generation groups
//! are rebuilt on decode in first-seen order.

use crate::error::Result;
use crate::node::NodeRecord;
use crate::topology;
use chrono::{DateTime, Utc};
use tracing::debug;
use url::Url;

/// Nodes of one generation in tree order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationGroup {
    generation: String,
    nodes: Vec<NodeRecord>,
}

impl GenerationGroup {
    pub fn new(generation: impl Into<String>) -> Self {
        Self {
            generation: generation.into(),
            nodes: Vec::new(),
        }
    }

    pub fn generation(&self) -> &str {
        &self.generation
    }

    pub fn nodes(&self) -> &[NodeRecord] {
        &self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn position_by_host(&self, host: &str) -> Option<usize> {
        self.nodes.iter().position(|n| n.host() == host)
    }

    /// Append `node` at the next free position with its planned chain.
    pub fn add(&mut self, node: NodeRecord, cloud_url: &Url) -> NodeRecord {
        let chain = topology::chain_for(&self.nodes, self.nodes.len(), cloud_url);
        let node = node.with_requested_to_follow(chain);
        self.nodes.push(node.clone());
        node
    }

    /// Swap in a fresh record at `index`, keeping its position and chain.
    pub fn replace(&mut self, index: usize, incoming: NodeRecord) -> NodeRecord {
        let chain = self.nodes[index].requested_to_follow.clone();
        let node = incoming.with_requested_to_follow(chain);
        self.nodes[index] = node.clone();
        node
    }

    pub fn remove_by_host(&mut self, host: &str) -> Option<NodeRecord> {
        self.position_by_host(host).map(|index| self.nodes.remove(index))
    }

    pub fn recompute_chains(&mut self, cloud_url: &Url) {
        let nodes = std::mem::take(&mut self.nodes);
        self.nodes = topology::recompute(nodes, cloud_url);
    }

    pub(crate) fn nodes_mut(&mut self) -> &mut Vec<NodeRecord> {
        &mut self.nodes
    }
}

/// All nodes registered under one group id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    group_id: String,
    generations: Vec<GenerationGroup>,
}

impl Group {
    pub fn new(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            generations: Vec::new(),
        }
    }

    /// Rebuild generation groups from a flat list, keeping list order.
    pub fn from_nodes(group_id: impl Into<String>, nodes: Vec<NodeRecord>) -> Self {
        let mut group = Self::new(group_id);
        for node in nodes {
            group.generation_mut(&node.generation).nodes.push(node);
        }
        group
    }

    pub fn decode(group_id: impl Into<String>, entry: &str) -> Result<Self> {
        let nodes: Vec<NodeRecord> = serde_json::from_str(entry)?;
        Ok(Self::from_nodes(group_id, nodes))
    }

    pub fn encode(&self) -> Result<String> {
        let nodes: Vec<&NodeRecord> = self.nodes().collect();
        Ok(serde_json::to_string(&nodes)?)
    }

    pub fn group_id(&self) -> &str {
        &self.group_id
    }

    pub fn generations(&self) -> &[GenerationGroup] {
        &self.generations
    }

    pub fn generation(&self, generation: &str) -> Option<&GenerationGroup> {
        self.generations.iter().find(|g| g.generation == generation)
    }

    pub(crate) fn generations_mut(&mut self) -> &mut [GenerationGroup] {
        &mut self.generations
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeRecord> {
        self.generations.iter().flat_map(|g| g.nodes.iter())
    }

    pub fn into_nodes(self) -> Vec<NodeRecord> {
        self.generations.into_iter().flat_map(|g| g.nodes).collect()
    }

    pub fn len(&self) -> usize {
        self.generations.iter().map(GenerationGroup::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.generations.iter().all(GenerationGroup::is_empty)
    }

    pub fn find_by_id(&self, id: &str) -> Option<&NodeRecord> {
        self.nodes().find(|n| n.id() == id)
    }

    pub fn find_by_host(&self, host: &str) -> Option<&NodeRecord> {
        self.nodes().find(|n| n.host() == host)
    }

    /// Insert or refresh `node`, stamped as seen at `now`.
    ///
    /// A known host keeps its position and chain; a host that switched
    /// generation leaves its old tree; a new host is appended. Returns the
    /// record as stored.
    pub fn upsert(&mut self, node: NodeRecord, cloud_url: &Url, now: DateTime<Utc>) -> NodeRecord {
        let node = node.with_last_seen(now);
        let host = node.host();

        for generation in self
            .generations
            .iter_mut()
            .filter(|g| g.generation != node.generation)
        {
            if generation.remove_by_host(&host).is_some() {
                debug!(
                    group = %self.group_id,
                    host = %host,
                    from = %generation.generation,
                    to = %node.generation,
                    "Node switched generation"
                );
                generation.recompute_chains(cloud_url);
            }
        }
        self.generations.retain(|g| !g.is_empty());

        let generation = self.generation_mut(&node.generation);
        match generation.position_by_host(&host) {
            Some(index) => generation.replace(index, node),
            None => generation.add(node, cloud_url),
        }
    }

    /// Remove the node on `host`, dropping its generation group if emptied.
    pub fn remove_by_host(&mut self, host: &str) -> Option<NodeRecord> {
        let removed = self
            .generations
            .iter_mut()
            .find_map(|g| g.remove_by_host(host));
        self.generations.retain(|g| !g.is_empty());
        removed
    }

    pub fn recompute_all(&mut self, cloud_url: &Url) {
        for generation in &mut self.generations {
            generation.recompute_chains(cloud_url);
        }
    }

    fn generation_mut(&mut self, generation: &str) -> &mut GenerationGroup {
        let index = match self.generations.iter().position(|g| g.generation == generation) {
            Some(index) => index,
            None => {
                self.generations.push(GenerationGroup::new(generation));
                self.generations.len() - 1
            }
        };
        &mut self.generations[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    fn cloud() -> Url {
        url("https://cloud/")
    }

    fn node(host: &str, generation: &str) -> NodeRecord {
        NodeRecord::new("g1", generation, url(&format!("http://{host}:8080/")))
    }

    #[test]
    fn test_first_node_follows_cloud() {
        let mut group = Group::new("g1");
        let stored = group.upsert(node("a", "v1"), &cloud(), Utc::now());
        assert_eq!(stored.requested_to_follow, vec![cloud()]);
        assert_eq!(group.len(), 1);
    }

    #[test]
    fn test_append_builds_tree() {
        let mut group = Group::new("g1");
        let now = Utc::now();
        group.upsert(node("a", "v1"), &cloud(), now);
        group.upsert(node("b", "v1"), &cloud(), now);
        group.upsert(node("c", "v1"), &cloud(), now);
        let d = group.upsert(node("d", "v1"), &cloud(), now);

        assert_eq!(
            d.requested_to_follow,
            vec![url("http://b:8080/"), url("http://a:8080/"), cloud()]
        );
    }

    #[test]
    fn test_reregistration_keeps_position_and_chain() {
        let mut group = Group::new("g1");
        let t0 = Utc::now();
        group.upsert(node("a", "v1"), &cloud(), t0);
        let before = group.upsert(node("b", "v1"), &cloud(), t0);

        let t1 = t0 + chrono::Duration::seconds(30);
        let after = group.upsert(node("b", "v1").with_offset(500), &cloud(), t1);

        assert_eq!(after.requested_to_follow, before.requested_to_follow);
        assert_eq!(after.offset, 500);
        assert_eq!(after.last_seen, t1);
        assert_eq!(group.len(), 2);
        assert_eq!(group.generation("v1").unwrap().position_by_host("b"), Some(1));
    }

    #[test]
    fn test_generations_are_separate_trees() {
        let mut group = Group::new("g1");
        let now = Utc::now();
        group.upsert(node("a", "v1"), &cloud(), now);
        let b = group.upsert(node("b", "v2"), &cloud(), now);

        assert_eq!(b.requested_to_follow, vec![cloud()]);
        assert_eq!(group.generations().len(), 2);
    }

    #[test]
    fn test_generation_switch_moves_node() {
        let mut group = Group::new("g1");
        let now = Utc::now();
        group.upsert(node("a", "v1"), &cloud(), now);
        group.upsert(node("b", "v1"), &cloud(), now);
        let moved = group.upsert(node("a", "v2"), &cloud(), now);

        assert_eq!(moved.requested_to_follow, vec![cloud()]);
        let v1 = group.generation("v1").unwrap();
        assert_eq!(v1.len(), 1);
        // b became the root of v1
        assert_eq!(v1.nodes()[0].requested_to_follow, vec![cloud()]);
        assert_eq!(group.len(), 2);
    }

    #[test]
    fn test_generation_switch_drops_empty_generation() {
        let mut group = Group::new("g1");
        let now = Utc::now();
        group.upsert(node("a", "v1"), &cloud(), now);
        group.upsert(node("a", "v2"), &cloud(), now);

        assert!(group.generation("v1").is_none());
        assert_eq!(group.generations().len(), 1);
    }

    #[test]
    fn test_remove_by_host() {
        let mut group = Group::new("g1");
        let now = Utc::now();
        group.upsert(node("a", "v1"), &cloud(), now);
        group.upsert(node("b", "v2"), &cloud(), now);

        assert!(group.remove_by_host("b").is_some());
        assert!(group.generation("v2").is_none());
        assert!(group.remove_by_host("b").is_none());
        assert!(group.remove_by_host("a").is_some());
        assert!(group.is_empty());
    }

    #[test]
    fn test_encode_decode_keeps_order() {
        let mut group = Group::new("g1");
        let now = Utc::now();
        for host in ["a", "b", "c"] {
            group.upsert(node(host, "v1"), &cloud(), now);
        }
        group.upsert(node("z", "v2"), &cloud(), now);

        let entry = group.encode().unwrap();
        let decoded = Group::decode("g1", &entry).unwrap();
        assert_eq!(decoded, group);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(Group::decode("g1", "{not json").is_err());
    }

    #[test]
    fn test_find_by_id() {
        let mut group = Group::new("g1");
        let stored = group.upsert(node("a", "v1"), &cloud(), Utc::now());
        assert!(group.find_by_id(&stored.id()).is_some());
        assert!(group.find_by_id("g1|http://nope/").is_none());
    }
}
