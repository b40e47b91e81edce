//! Upstream management on the consuming side.
//!
//! A node follows a chain of upstream URLs handed out by the registry.
//! Each URL is tracked as an [`UpstreamInstance`] that is either up or down:
//!
//! ```text
//!   up ──read error / timeout / failed probe──► down
//!   ▲                                             │
//!   └──────── successful probe or read ───────────┘
//! ```
//!
//! The [`ServiceList`] holds the chain (persisted across restarts) and the
//! [`LoadBalancer`] picks the first instance that is up.

mod balancer;
mod http;
mod service_list;

pub use balancer::LoadBalancer;
pub use http::HttpUpstreamClient;
pub use service_list::{ChainVersion, ServiceList};

use crate::error::{BoxFuture, ReplicationError, Result};
use crate::metrics;
use crate::pipe::{MessageResults, ReadRequest};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{info, warn};
use url::Url;

/// Transport to an upstream pipe.
pub trait UpstreamClient: Send + Sync + 'static {
    /// `GET {upstream}/pipe/{offset}?type=..&location=..`
    fn read<'a>(&'a self, upstream: &'a Url, request: &'a ReadRequest) -> BoxFuture<'a, MessageResults>;

    /// `GET {upstream}/pipe/_status`
    fn probe<'a>(&'a self, upstream: &'a Url) -> BoxFuture<'a, ()>;
}

/// One URL of the follow chain and its health.
#[derive(Debug)]
pub struct UpstreamInstance {
    url: Url,
    up: AtomicBool,
    /// Consecutive failures
    failure_count: AtomicU64,
    /// Epoch millis of the last success, 0 if never
    last_success: AtomicU64,
}

impl UpstreamInstance {
    /// New instances start up.
    pub fn new(url: Url) -> Self {
        Self {
            url,
            up: AtomicBool::new(true),
            failure_count: AtomicU64::new(0),
            last_success: AtomicU64::new(0),
        }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    /// Returns true if the instance was down before.
    pub fn mark_up(&self) -> bool {
        let was_up = self.up.swap(true, Ordering::AcqRel);
        if !was_up {
            info!(upstream = %self.url, "Upstream is up");
            metrics::record_upstream_state(self.url.as_str(), true);
        }
        !was_up
    }

    /// Returns true if the instance was up before.
    pub fn mark_down(&self) -> bool {
        let was_up = self.up.swap(false, Ordering::AcqRel);
        if was_up {
            warn!(upstream = %self.url, failures = self.failure_count(), "Upstream is down");
            metrics::record_upstream_state(self.url.as_str(), false);
        }
        was_up
    }

    /// Record a successful call. Returns true if this brought the instance up.
    pub fn record_success(&self) -> bool {
        self.failure_count.store(0, Ordering::Release);
        self.last_success.store(epoch_millis(), Ordering::Release);
        self.mark_up()
    }

    /// Record a failed call. Returns true if this took the instance down.
    pub fn record_failure(&self) -> bool {
        self.failure_count.fetch_add(1, Ordering::AcqRel);
        self.mark_down()
    }

    pub fn failure_count(&self) -> u64 {
        self.failure_count.load(Ordering::Acquire)
    }

    pub fn millis_since_success(&self) -> u64 {
        let last = self.last_success.load(Ordering::Acquire);
        if last == 0 {
            return u64::MAX;
        }
        epoch_millis().saturating_sub(last)
    }
}

/// `base` joined with a relative `path`, treating `base` as a directory.
pub(crate) fn endpoint(base: &Url, path: &str) -> Result<Url> {
    let mut base = base.clone();
    if !base.path().ends_with('/') {
        let dir = format!("{}/", base.path());
        base.set_path(&dir);
    }
    base.join(path).map_err(|e| ReplicationError::invalid_url(path, e))
}

fn epoch_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
