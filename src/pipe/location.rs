//! Location resolution in front of a reader.
//!
//! Consumers name the location they read for by alias (a store code, a
//! cluster name). A resolver turns that into the id messages are addressed
//! to. Resolution failures are never swallowed: a 5xx from the location
//! service surfaces as a retryable error, a 4xx as a permanent one.

use super::{MessageResults, OffsetName, PipeState, ReadRequest, Reader};
use crate::error::{BoxFuture, ReplicationError, Result};
use crate::upstream::endpoint;
use std::collections::HashMap;
use std::time::Duration;
use tracing::warn;
use url::Url;

/// Maps a location alias to its canonical id.
pub trait LocationResolver: Send + Sync + 'static {
    fn resolve<'a>(&'a self, location: &'a str) -> BoxFuture<'a, String>;
}

/// Fixed alias table. Unknown aliases resolve to themselves.
#[derive(Debug, Clone, Default)]
pub struct StaticLocationResolver {
    aliases: HashMap<String, String>,
}

impl StaticLocationResolver {
    pub fn new(aliases: HashMap<String, String>) -> Self {
        Self { aliases }
    }
}

impl LocationResolver for StaticLocationResolver {
    fn resolve<'a>(&'a self, location: &'a str) -> BoxFuture<'a, String> {
        Box::pin(async move {
            Ok(self
                .aliases
                .get(location)
                .cloned()
                .unwrap_or_else(|| location.to_string()))
        })
    }
}

const LOCATIONS_PATH: &str = "locations";

/// Location service client: `GET {base}/locations/{alias}` returns the id as a JSON string.
pub struct HttpLocationResolver {
    client: reqwest::Client,
    base: Url,
    timeout: Duration,
}

impl HttpLocationResolver {
    pub fn new(client: reqwest::Client, base: Url, timeout: Duration) -> Self {
        Self { client, base, timeout }
    }

    /// The alias goes in as one percent-encoded path segment.
    fn lookup_url(&self, location: &str) -> Result<Url> {
        if matches!(location, "" | "." | "..") {
            return Err(ReplicationError::InvalidRequest(format!(
                "invalid location alias {location:?}"
            )));
        }
        let mut url = endpoint(&self.base, LOCATIONS_PATH)?;
        url.path_segments_mut()
            .map_err(|_| ReplicationError::InvalidUrl {
                url: self.base.to_string(),
                message: "cannot be a base URL".to_string(),
            })?
            .push(location);
        Ok(url)
    }
}

impl LocationResolver for HttpLocationResolver {
    fn resolve<'a>(&'a self, location: &'a str) -> BoxFuture<'a, String> {
        Box::pin(async move {
            let url = self.lookup_url(location)?;

            let response = tokio::time::timeout(self.timeout, self.client.get(url.clone()).send())
                .await
                .map_err(|_| ReplicationError::UpstreamTimeout { url: url.to_string() })??;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                warn!(location, status = status.as_u16(), "Location lookup failed");
                return Err(ReplicationError::location(status.as_u16(), body));
            }
            Ok(response.json::<String>().await?)
        })
    }
}

/// Resolves the request's location before delegating the read.
pub struct ResolvingReader<R, L> {
    inner: R,
    resolver: L,
}

impl<R: Reader, L: LocationResolver> ResolvingReader<R, L> {
    pub fn new(inner: R, resolver: L) -> Self {
        Self { inner, resolver }
    }
}

impl<R: Reader, L: LocationResolver> Reader for ResolvingReader<R, L> {
    fn read<'a>(&'a self, request: &'a ReadRequest) -> BoxFuture<'a, MessageResults> {
        Box::pin(async move {
            let location = self.resolver.resolve(&request.location).await?;
            let resolved = ReadRequest {
                location,
                ..request.clone()
            };
            self.inner.read(&resolved).await
        })
    }

    fn latest_offset_matching<'a>(&'a self, types: &'a [String]) -> BoxFuture<'a, u64> {
        self.inner.latest_offset_matching(types)
    }

    fn offset(&self, name: OffsetName) -> BoxFuture<'_, Option<u64>> {
        self.inner.offset(name)
    }

    fn pipe_state(&self) -> BoxFuture<'_, PipeState> {
        self.inner.pipe_state()
    }
}
