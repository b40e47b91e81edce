//! The follow chain a node currently works from.
//!
//! The chain is written to a small properties file on every change so a
//! restarted node can resume following before its first registration
//! succeeds:
//!
//! ```text
//! services=http://10.0.4.11:8080/,http://10.0.4.10:8080/,https://pipe.example.com/
//! ```

use super::UpstreamInstance;
use crate::error::Result;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};
use url::Url;

const SERVICES_KEY: &str = "services";

/// What a [`ServiceList::subscribe`] receiver is woken for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChainVersion {
    /// Bumped on every registry update of the chain.
    pub refreshes: u64,
    /// Bumped whenever an instance comes back up.
    pub recoveries: u64,
}

pub struct ServiceList {
    cloud_url: Url,
    path: Option<PathBuf>,
    instances: RwLock<Vec<Arc<UpstreamInstance>>>,
    changes: watch::Sender<ChainVersion>,
}

impl ServiceList {
    /// A list holding only the cloud, not persisted.
    pub fn new(cloud_url: Url) -> Self {
        let (changes, _) = watch::channel(ChainVersion::default());
        Self {
            instances: RwLock::new(vec![Arc::new(UpstreamInstance::new(cloud_url.clone()))]),
            cloud_url,
            path: None,
            changes,
        }
    }

    /// Restore the chain from `path`, falling back to the cloud.
    pub async fn load(path: impl AsRef<Path>, cloud_url: Url) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let urls = read_services_file(&path).await?;

        let mut list = Self::new(cloud_url);
        if !urls.is_empty() {
            info!(path = %path.display(), count = urls.len(), "Restored service list");
            *list.instances.get_mut() = urls.into_iter().map(|u| Arc::new(UpstreamInstance::new(u))).collect();
        }
        list.path = Some(path);
        Ok(list)
    }

    pub fn cloud_url(&self) -> &Url {
        &self.cloud_url
    }

    pub async fn instances(&self) -> Vec<Arc<UpstreamInstance>> {
        self.instances.read().await.clone()
    }

    pub async fn urls(&self) -> Vec<Url> {
        self.instances.read().await.iter().map(|i| i.url().clone()).collect()
    }

    /// Replace the chain.
    ///
    /// Instances already known by URL are kept with their health. An empty
    /// chain falls back to the cloud and is not persisted.
    pub async fn update(&self, urls: Vec<Url>) -> Result<()> {
        let fallback = urls.is_empty();
        let urls = if fallback {
            warn!(cloud = %self.cloud_url, "Empty follow chain, falling back to cloud");
            vec![self.cloud_url.clone()]
        } else {
            dedup(urls)
        };

        let changed = {
            let mut instances = self.instances.write().await;
            let changed = instances.len() != urls.len() || instances.iter().zip(&urls).any(|(i, u)| i.url() != u);
            let next: Vec<_> = urls
                .iter()
                .map(|url| {
                    instances
                        .iter()
                        .find(|i| i.url() == url)
                        .cloned()
                        .unwrap_or_else(|| Arc::new(UpstreamInstance::new(url.clone())))
                })
                .collect();
            *instances = next;
            changed
        };

        if changed {
            debug!(chain = ?urls.iter().map(Url::as_str).collect::<Vec<_>>(), "Follow chain changed");
            if !fallback {
                self.persist(&urls).await;
            }
        }
        self.changes
            .send_modify(|version| version.refreshes = version.refreshes.wrapping_add(1));
        Ok(())
    }

    /// Bring every instance back up (a fresh start on the whole chain).
    pub async fn reset_health(&self) {
        for instance in self.instances.read().await.iter() {
            instance.mark_up();
        }
    }

    /// Report that an instance came back up.
    pub fn notify_recovered(&self) {
        self.changes
            .send_modify(|version| version.recoveries = version.recoveries.wrapping_add(1));
    }

    pub fn subscribe(&self) -> watch::Receiver<ChainVersion> {
        self.changes.subscribe()
    }

    async fn persist(&self, urls: &[Url]) {
        let Some(path) = &self.path else {
            return;
        };
        let line = urls.iter().map(Url::as_str).collect::<Vec<_>>().join(",");
        if let Err(e) = tokio::fs::write(path, format!("{SERVICES_KEY}={line}\n")).await {
            warn!(path = %path.display(), error = %e, "Failed to persist service list");
        }
    }
}

fn dedup(urls: Vec<Url>) -> Vec<Url> {
    let mut seen = Vec::with_capacity(urls.len());
    for url in urls {
        if !seen.contains(&url) {
            seen.push(url);
        }
    }
    seen
}

async fn read_services_file(path: &Path) -> Result<Vec<Url>> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    Ok(parse_services(&content))
}

/// Parse the `services=` line. Malformed URLs are skipped.
pub(crate) fn parse_services(content: &str) -> Vec<Url> {
    let Some(value) = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .find(|(key, _)| key.trim() == SERVICES_KEY)
        .map(|(_, value)| value)
    else {
        return Vec::new();
    };

    value
        .split(',')
        .map(str::trim)
        .filter(|raw| !raw.is_empty())
        .filter_map(|raw| match Url::parse(raw) {
            Ok(url) => Some(url),
            Err(e) => {
                warn!(url = raw, error = %e, "Skipping malformed upstream URL");
                None
            }
        })
        .collect()
}
