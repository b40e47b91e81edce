//! Node state types.
//!
//! # State Transitions
//!
//! ```text
//!                  start()
//! Created ───────────────────→ Starting
//!    │                              │
//!    │ (shutdown before start)      │ (tasks spawned)
//!    ↓                              ↓
//! Stopped ←──── ShuttingDown ←── Running
//!
//! Starting ──(cursor store / config error)──→ Failed
//! ```
//!
//! # State Descriptions
//!
//! - **Created**: after `ReplicationNode::new()`. Nothing is running.
//! - **Starting**: opening the cursor store and restoring the service list.
//! - **Running**: pull loop, registration and health probe tasks are live.
//! - **ShuttingDown**: tasks are draining, cursors being flushed.
//! - **Stopped**: clean shutdown. Safe to drop.
//! - **Failed**: startup error. Check logs.

use crate::node::NodeStatus;
use crate::pipe::PipeState;
use url::Url;

/// State of a replicating node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Created,
    Starting,
    Running,
    ShuttingDown,
    Stopped,
    Failed,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Created => write!(f, "Created"),
            NodeState::Starting => write!(f, "Starting"),
            NodeState::Running => write!(f, "Running"),
            NodeState::ShuttingDown => write!(f, "ShuttingDown"),
            NodeState::Stopped => write!(f, "Stopped"),
            NodeState::Failed => write!(f, "Failed"),
        }
    }
}

/// Where the pull loop is reading from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullState {
    Following(Url),
    /// Every upstream of the chain is down.
    Exhausted,
}

/// What the node reports about its own pipe on the next registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Progress {
    /// Last applied offset.
    pub offset: u64,
    pub pipe_state: PipeState,
    pub global_latest_offset: Option<u64>,
    pub status: NodeStatus,
}

impl Progress {
    /// Progress of a node resuming at `offset`.
    pub fn resume(offset: u64) -> Self {
        Self {
            offset,
            pipe_state: PipeState::Unknown,
            global_latest_offset: None,
            status: NodeStatus::Initialising,
        }
    }
}

impl Default for Progress {
    fn default() -> Self {
        Self::resume(0)
    }
}

/// Snapshot for health endpoints. Built from cached state, no I/O.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub state: NodeState,
    /// Running and reading from some upstream.
    pub ready: bool,
    pub pull_state: PullState,
    pub progress: Progress,
    pub upstreams_total: usize,
    pub upstreams_up: usize,
    pub upstreams: Vec<UpstreamHealth>,
}

/// Health of one follow chain entry.
#[derive(Debug, Clone)]
pub struct UpstreamHealth {
    pub url: Url,
    pub up: bool,
    pub failure_count: u64,
    pub millis_since_success: u64,
}
