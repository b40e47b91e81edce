//! Follow chain planning.
//!
//! The nodes of one generation group form an implicit binary tree laid out
//! in list order: index 0 is the root, the parent of index `i` is
//! `(i + 1) / 2 - 1`. A node's chain is its parent's URL followed by the
//! parent's own chain, i.e. the whole ancestor path ending at the cloud.
//!
//! ```text
//! index:   0      1       2        3          4
//! chain: [C]   [0, C]  [0, C]  [1, 0, C]  [1, 0, C]
//! ```
//!
//! Everything here is pure: no I/O, no clock.

use crate::node::NodeRecord;
use url::Url;

/// Ordered upstream URLs, most preferred first, ending at the cloud.
pub type FollowChain = Vec<Url>;

/// Parent position of `index`, `None` for the root.
pub fn parent_index(index: usize) -> Option<usize> {
    if index == 0 {
        None
    } else {
        Some((index + 1) / 2 - 1)
    }
}

/// Length of the chain of the node at `index` (hops to the cloud).
pub fn depth(index: usize) -> usize {
    (usize::BITS - (index + 1).leading_zeros()) as usize
}

/// Chain for a node placed at `index` among `nodes`.
///
/// `nodes` only needs to hold the positions before `index`, so this also
/// plans an append at `index == nodes.len()`.
pub fn chain_for(nodes: &[NodeRecord], index: usize, cloud_url: &Url) -> FollowChain {
    let parent = match parent_index(index).and_then(|p| nodes.get(p)) {
        Some(parent) => parent,
        None => return vec![cloud_url.clone()],
    };

    let mut chain = Vec::with_capacity(parent.requested_to_follow.len() + 1);
    chain.push(parent.local_url.clone());
    chain.extend(parent.requested_to_follow.iter().cloned());
    if chain.last() != Some(cloud_url) {
        chain.push(cloud_url.clone());
    }
    chain
}

/// Reassign every chain in list order.
///
/// Parents precede children, so each parent's chain is final before any
/// child copies it.
pub fn recompute(nodes: Vec<NodeRecord>, cloud_url: &Url) -> Vec<NodeRecord> {
    let mut placed: Vec<NodeRecord> = Vec::with_capacity(nodes.len());
    for node in nodes {
        let chain = chain_for(&placed, placed.len(), cloud_url);
        placed.push(node.with_requested_to_follow(chain));
    }
    placed
}
