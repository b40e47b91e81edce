//! Pending bootstrap requests.
//!
//! Operators queue a [`BootstrapType`] against a host; the next registration
//! from that host picks it up in its response.

use super::types::BootstrapType;
use crate::error::BoxFuture;
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::info;

pub trait NodeRequestStorage: Send + Sync + 'static {
    /// Take the pending request for `host`, if any. A served request is gone.
    fn requires_bootstrap<'a>(&'a self, host: &'a str) -> BoxFuture<'a, Option<BootstrapType>>;

    /// Queue a request for `host`, replacing any earlier one.
    fn save<'a>(&'a self, host: &'a str, bootstrap: BootstrapType) -> BoxFuture<'a, ()>;
}

#[derive(Debug, Default)]
pub struct InMemoryNodeRequestStorage {
    requests: RwLock<HashMap<String, BootstrapType>>,
}

impl InMemoryNodeRequestStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn pending(&self) -> usize {
        self.requests.read().await.len()
    }
}

impl NodeRequestStorage for InMemoryNodeRequestStorage {
    fn requires_bootstrap<'a>(&'a self, host: &'a str) -> BoxFuture<'a, Option<BootstrapType>> {
        Box::pin(async move { Ok(self.requests.write().await.remove(host)) })
    }

    fn save<'a>(&'a self, host: &'a str, bootstrap: BootstrapType) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            info!(host, %bootstrap, "Bootstrap requested");
            self.requests.write().await.insert(host.to_string(), bootstrap);
            Ok(())
        })
    }
}
