//! First-up selection over the follow chain.

use super::{ServiceList, UpstreamInstance};
use crate::error::{ReplicationError, Result};
use std::sync::Arc;
use url::Url;

#[derive(Clone)]
pub struct LoadBalancer {
    services: Arc<ServiceList>,
}

impl LoadBalancer {
    pub fn new(services: Arc<ServiceList>) -> Self {
        Self { services }
    }

    pub fn services(&self) -> &Arc<ServiceList> {
        &self.services
    }

    /// The most preferred instance that is up.
    pub async fn select(&self) -> Result<Arc<UpstreamInstance>> {
        self.services
            .instances()
            .await
            .into_iter()
            .find(|i| i.is_up())
            .ok_or(ReplicationError::NoUpstreamAvailable)
    }

    /// Every URL that is up, in chain order.
    pub async fn following(&self) -> Vec<Url> {
        self.services
            .instances()
            .await
            .iter()
            .filter(|i| i.is_up())
            .map(|i| i.url().clone())
            .collect()
    }
}
