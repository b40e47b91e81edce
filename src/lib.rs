//! # Pipe Replication
//!
//! Hierarchical replication of an append-only message pipe from a central
//! cloud origin down to a fleet of edge nodes.
//!
//! ## Architecture
//!
//! Edge nodes read the pipe from each other instead of all hitting the
//! cloud. A registry arranges every (group, generation) into a binary tree
//! and hands each node the chain of upstreams it should read from:
//!
//! ```text
//!                        ┌──────────────┐
//!                        │  cloud pipe  │◄──────────────────────────┐
//!                        └──────▲───────┘                           │
//!                               │ GET pipe/{offset}                 │
//!  ┌────────────────────────────┼─────────────────────────┐  ┌──────┴───────┐
//!  │ ReplicationNode (index 0)  │                         │  │   registry   │
//!  │                            │                         │  │              │
//!  │  ┌───────────┐   ┌─────────┴──┐   ┌───────────────┐  │  │ Registration │
//!  │  │ Registrar │──►│ ServiceList│◄──│ health probe  │  │  │   Service    │
//!  │  └─────┬─────┘   └─────┬──────┘   └───────────────┘  │  │  (CAS over   │
//!  │        │ register      │ first up                    │  │ RegistryStore│
//!  │        │               ▼                             │  │   + SQLite)  │
//!  │        │         ┌───────────┐   ┌───────────────┐   │  └──────▲───────┘
//!  │        │         │ PullLoop  │──►│ local log +   │   │         │
//!  │        │         └───────────┘   │ CursorStore   │   │         │
//!  │        │                         └───────────────┘   │         │
//!  └────────┼─────────────────────────────────────────────┘         │
//!           └───────────────────────────────────────────────────────┘
//!                               ▲
//!                               │ GET pipe/{offset}
//!                 index 1, 2 follow [0, cloud]; 3, 4 follow [1, 0, cloud] …
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use pipe_replication::config::{LogConfig, NodeConfig};
//! use pipe_replication::pipe::InMemoryLog;
//! use pipe_replication::ReplicationNode;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> pipe_replication::Result<()> {
//!     let config = NodeConfig::for_testing(
//!         "store-0042",
//!         "http://10.0.4.12:8080/",
//!         "https://pipe.example.com/",
//!     );
//!     let local = Arc::new(InMemoryLog::new(&LogConfig::default()));
//!
//!     let mut node = ReplicationNode::from_config(config, local)?;
//!     node.start().await?;
//!
//!     // Node replicates until shutdown
//!     node.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod cursor;
pub mod error;
pub mod group;
pub mod health;
pub mod metrics;
pub mod node;
pub mod pipe;
pub mod registry;
pub mod registry_client;
pub mod resilience;
pub mod store;
pub mod topology;
pub mod upstream;

// Re-exports for convenience
pub use circuit_breaker::{CircuitBreaker, CircuitConfig};
pub use config::{CursorConfig, LogConfig, NodeConfig, RegistryConfig};
pub use coordinator::{HealthCheck, NodeState, Progress, ReplicationNode};
pub use cursor::CursorStore;
pub use error::{ReplicationError, Result};
pub use node::{NodeRecord, NodeStatus};
pub use pipe::{Message, MessageResults, PipeState, ReadRequest, Reader, Writer};
pub use registry::{BootstrapType, RegistrationService, RegistryResponse, StateSummary};
pub use registry_client::{HttpRegistryClient, RegistryClient};
pub use store::{InMemoryRegistryStore, RegistryStore, SqliteRegistryStore};
pub use upstream::{HttpUpstreamClient, LoadBalancer, ServiceList, UpstreamClient};
