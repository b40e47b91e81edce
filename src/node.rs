//! Node records: what the registry knows about one fleet member.
//!
//! A [`NodeRecord`] is a value. Every change goes through a `with_*` method
//! that consumes the record and returns the updated one, so a group snapshot
//! handed to a reader never changes underneath it.

use crate::pipe::PipeState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use url::Url;

/// Key of the pipe state inside [`NodeRecord::pipe`].
pub const PIPE_STATE_KEY: &str = "pipeState";

/// Lifecycle status a node reports (or the registry assigns).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeStatus {
    /// Started, no successful read yet.
    Initialising,
    /// Pulling from an upstream.
    Following,
    /// Healthy root or standalone node.
    Ok,
    /// Not seen within the offline threshold.
    Offline,
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initialising => write!(f, "INITIALISING"),
            Self::Following => write!(f, "FOLLOWING"),
            Self::Ok => write!(f, "OK"),
            Self::Offline => write!(f, "OFFLINE"),
        }
    }
}

/// One fleet member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeRecord {
    /// Business group. Empty when the node is ungrouped.
    #[serde(default)]
    pub group: String,

    /// Software generation; nodes only follow nodes of their own generation.
    #[serde(default)]
    pub generation: String,

    /// Where followers read from this node.
    pub local_url: Url,

    /// Offset the node has consumed up to.
    #[serde(default)]
    pub offset: u64,

    pub status: NodeStatus,

    /// Upstreams the node currently considers up.
    #[serde(default)]
    pub following: Vec<Url>,

    /// Chain the registry last assigned. Ends with the cloud URL.
    #[serde(default)]
    pub requested_to_follow: Vec<Url>,

    #[serde(default)]
    pub last_seen: DateTime<Utc>,

    /// Pipe metrics reported by the node (`pipeState`, ...).
    #[serde(default)]
    pub pipe: BTreeMap<String, String>,

    /// Named offsets reported by the node.
    #[serde(default)]
    pub offsets: BTreeMap<String, u64>,

    /// Provider (producer side) metrics reported by the node.
    #[serde(default)]
    pub provider: BTreeMap<String, String>,
}

impl NodeRecord {
    pub fn new(group: impl Into<String>, generation: impl Into<String>, local_url: Url) -> Self {
        Self {
            group: group.into(),
            generation: generation.into(),
            local_url,
            offset: 0,
            status: NodeStatus::Initialising,
            following: Vec::new(),
            requested_to_follow: Vec::new(),
            last_seen: DateTime::<Utc>::default(),
            pipe: BTreeMap::new(),
            offsets: BTreeMap::new(),
            provider: BTreeMap::new(),
        }
    }

    /// The synthetic root of a summary: the cloud itself.
    pub fn cloud(cloud_url: Url, offset: u64, status: NodeStatus, now: DateTime<Utc>) -> Self {
        Self {
            status,
            offset,
            last_seen: now,
            ..Self::new("", "", cloud_url)
        }
    }

    /// `group|url`, or just the URL for an ungrouped node.
    pub fn id(&self) -> String {
        if self.group.is_empty() {
            self.local_url.to_string()
        } else {
            format!("{}|{}", self.group, self.local_url)
        }
    }

    /// Host part of the local URL; nodes are matched by host within a group.
    pub fn host(&self) -> String {
        self.local_url.host_str().unwrap_or_default().to_string()
    }

    /// Reported pipe state, `UNKNOWN` when missing or unreadable.
    pub fn pipe_state(&self) -> PipeState {
        PipeState::from_header(self.pipe.get(PIPE_STATE_KEY).map(String::as_str))
    }

    /// Whether the node has been silent for longer than `threshold`.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        match chrono::Duration::from_std(threshold) {
            Ok(threshold) => now - self.last_seen > threshold,
            Err(_) => false,
        }
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_status(mut self, status: NodeStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_following(mut self, following: Vec<Url>) -> Self {
        self.following = following;
        self
    }

    pub fn with_requested_to_follow(mut self, chain: Vec<Url>) -> Self {
        self.requested_to_follow = chain;
        self
    }

    pub fn with_last_seen(mut self, last_seen: DateTime<Utc>) -> Self {
        self.last_seen = last_seen;
        self
    }

    pub fn with_pipe_state(mut self, state: PipeState) -> Self {
        self.pipe.insert(PIPE_STATE_KEY.to_string(), state.to_string());
        self
    }

    pub fn with_pipe_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.pipe.insert(key.into(), value.into());
        self
    }

    pub fn with_named_offset(mut self, name: impl Into<String>, value: u64) -> Self {
        self.offsets.insert(name.into(), value);
        self
    }

    pub fn with_provider_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.provider.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn test_id_with_and_without_group() {
        let node = NodeRecord::new("store-1", "v1", url("http://10.0.0.1:8080/"));
        assert_eq!(node.id(), "store-1|http://10.0.0.1:8080/");

        let node = NodeRecord::new("", "v1", url("http://10.0.0.1:8080/"));
        assert_eq!(node.id(), "http://10.0.0.1:8080/");
    }

    #[test]
    fn test_host() {
        let node = NodeRecord::new("g", "v1", url("http://edge-7.local:8080/pipe"));
        assert_eq!(node.host(), "edge-7.local");
    }

    #[test]
    fn test_pipe_state_fallback() {
        let node = NodeRecord::new("g", "v1", url("http://a/"));
        assert_eq!(node.pipe_state(), PipeState::Unknown);

        let node = node.with_pipe_entry(PIPE_STATE_KEY, "garbage");
        assert_eq!(node.pipe_state(), PipeState::Unknown);

        let node = node.with_pipe_state(PipeState::Behind);
        assert_eq!(node.pipe_state(), PipeState::Behind);
    }

    #[test]
    fn test_is_stale() {
        let now = Utc::now();
        let node = NodeRecord::new("g", "v1", url("http://a/"))
            .with_last_seen(now - chrono::Duration::seconds(301));
        assert!(node.is_stale(now, Duration::from_secs(300)));
        assert!(!node.is_stale(now, Duration::from_secs(302)));
    }

    #[test]
    fn test_builders_leave_original_untouched() {
        let original = NodeRecord::new("g", "v1", url("http://a/"));
        let updated = original.clone().with_offset(42).with_status(NodeStatus::Following);
        assert_eq!(original.offset, 0);
        assert_eq!(original.status, NodeStatus::Initialising);
        assert_eq!(updated.offset, 42);
        assert_eq!(updated.status, NodeStatus::Following);
    }

    #[test]
    fn test_cloud_root() {
        let now = Utc::now();
        let root = NodeRecord::cloud(url("https://cloud/"), 900, NodeStatus::Ok, now);
        assert_eq!(root.local_url, url("https://cloud/"));
        assert_eq!(root.offset, 900);
        assert!(root.requested_to_follow.is_empty());
        assert_eq!(root.last_seen, now);
    }

    #[test]
    fn test_json_shape() {
        let node = NodeRecord::new("g", "v1", url("http://a:1/"))
            .with_requested_to_follow(vec![url("https://cloud/")])
            .with_named_offset("PIPE_OFFSET", 7);
        let json = serde_json::to_value(&node).unwrap();
        assert_eq!(json["localUrl"], "http://a:1/");
        assert_eq!(json["requestedToFollow"][0], "https://cloud/");
        assert_eq!(json["status"], "INITIALISING");
        assert_eq!(json["offsets"]["PIPE_OFFSET"], 7);

        let parsed: NodeRecord = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, node);
    }

    #[test]
    fn test_minimal_json_accepted() {
        let node: NodeRecord =
            serde_json::from_str(r#"{"localUrl":"http://a/","status":"FOLLOWING"}"#).unwrap();
        assert!(node.group.is_empty());
        assert_eq!(node.offset, 0);
        assert!(node.requested_to_follow.is_empty());
    }
}
