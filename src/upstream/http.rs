//! HTTP transport for the pull protocol.

use super::{endpoint, UpstreamClient};
use crate::error::{BoxFuture, ReplicationError};
use crate::pipe::{
    parse_global_latest_offset, parse_retry_after, Message, MessageResults, PipeState, ReadRequest,
    CONTENT_ENCODING_HEADER, GLOBAL_LATEST_OFFSET_HEADER, PIPE_STATE_HEADER, RETRY_AFTER_HEADER, STATUS_PATH,
};
use reqwest::header::HeaderMap;
use std::time::Duration;
use tracing::debug;
use url::Url;

#[derive(Clone)]
pub struct HttpUpstreamClient {
    client: reqwest::Client,
    read_timeout: Duration,
    probe_timeout: Duration,
}

impl HttpUpstreamClient {
    pub fn new(client: reqwest::Client, read_timeout: Duration, probe_timeout: Duration) -> Self {
        Self {
            client,
            read_timeout,
            probe_timeout,
        }
    }
}

fn header<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

impl UpstreamClient for HttpUpstreamClient {
    fn read<'a>(&'a self, upstream: &'a Url, request: &'a ReadRequest) -> BoxFuture<'a, MessageResults> {
        Box::pin(async move {
            let url = endpoint(upstream, &format!("pipe/{}", request.offset))?;

            let fetch = async {
                let response = self.client.get(url.clone()).query(&request.query()).send().await?;
                let status = response.status();
                if !status.is_success() {
                    return Err(ReplicationError::upstream(&url, format!("status {}", status)));
                }

                let headers = response.headers();
                // Compressed bodies are decoded by a codec layer in front of
                // this client; a bare client can only take identity.
                if let Some(encoding) = header(headers, CONTENT_ENCODING_HEADER) {
                    if !encoding.is_empty() && !encoding.eq_ignore_ascii_case("identity") {
                        return Err(ReplicationError::Unsupported(format!("content encoding {encoding}")));
                    }
                }
                let retry_after = parse_retry_after(header(headers, RETRY_AFTER_HEADER));
                let global_latest_offset = parse_global_latest_offset(header(headers, GLOBAL_LATEST_OFFSET_HEADER));
                let pipe_state = PipeState::from_header(header(headers, PIPE_STATE_HEADER));

                let messages: Vec<Message> = response.json().await?;
                Ok::<_, ReplicationError>(MessageResults {
                    messages,
                    retry_after,
                    global_latest_offset,
                    pipe_state,
                })
            };

            let results = tokio::time::timeout(self.read_timeout, fetch)
                .await
                .map_err(|_| ReplicationError::UpstreamTimeout { url: url.to_string() })??;

            debug!(
                upstream = %upstream,
                offset = request.offset,
                count = results.messages.len(),
                retry_after_secs = results.retry_after.as_secs(),
                "Read from upstream"
            );
            Ok(results)
        })
    }

    fn probe<'a>(&'a self, upstream: &'a Url) -> BoxFuture<'a, ()> {
        Box::pin(async move {
            let url = endpoint(upstream, STATUS_PATH)?;
            let response = tokio::time::timeout(self.probe_timeout, self.client.get(url.clone()).send())
                .await
                .map_err(|_| ReplicationError::UpstreamTimeout { url: url.to_string() })??;

            if response.status().is_success() {
                Ok(())
            } else {
                Err(ReplicationError::upstream(&url, format!("status {}", response.status())))
            }
        })
    }
}
