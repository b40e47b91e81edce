//! Read throttling for busy upstreams.
//!
//! When the read rate is exceeded the caller gets an empty batch and the
//! configured retry-after instead of an error, so consumers back off
//! through the normal pacing path.

use super::{MessageResults, OffsetName, PipeState, ReadRequest, Reader};
use crate::error::BoxFuture;
use crate::metrics;
use crate::resilience::{RateLimitConfig, RateLimiter};
use std::time::Duration;
use tracing::debug;

pub struct ThrottledReader<R> {
    inner: R,
    limiter: RateLimiter,
    retry_after: Duration,
}

impl<R: Reader> ThrottledReader<R> {
    pub fn new(inner: R, config: RateLimitConfig, retry_after: Duration) -> Self {
        Self {
            inner,
            limiter: RateLimiter::new(config),
            retry_after,
        }
    }

    pub fn inner(&self) -> &R {
        &self.inner
    }
}

impl<R: Reader> Reader for ThrottledReader<R> {
    fn read<'a>(&'a self, request: &'a ReadRequest) -> BoxFuture<'a, MessageResults> {
        Box::pin(async move {
            if self.limiter.try_acquire() {
                return self.inner.read(request).await;
            }
            debug!(offset = request.offset, location = %request.location, "Read throttled");
            metrics::record_read_throttled();
            let latest = self.inner.offset(OffsetName::GlobalLatestOffset).await?;
            let state = self.inner.pipe_state().await?;
            Ok(MessageResults::empty(self.retry_after, latest, state))
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogConfig;
    use crate::pipe::{InMemoryLog, Message, Writer};

    #[tokio::test]
    async fn test_throttled_read_returns_empty_batch() {
        let log = InMemoryLog::origin(&LogConfig::default());
        log.write_messages(vec![Message::new("X", "a", "{}"), Message::new("X", "b", "{}")])
            .await
            .unwrap();

        let reader = ThrottledReader::new(
            log,
            RateLimitConfig {
                burst_size: 1,
                refill_rate: 1,
            },
            Duration::from_secs(3),
        );
        let request = ReadRequest::new(0, vec![], "L");

        let first = reader.read(&request).await.unwrap();
        assert_eq!(first.messages.len(), 2);

        let second = reader.read(&request).await.unwrap();
        assert!(second.messages.is_empty());
        assert_eq!(second.retry_after, Duration::from_secs(3));
        assert_eq!(second.global_latest_offset, Some(2));
        assert_eq!(second.pipe_state, PipeState::UpToDate);
    }

    #[tokio::test]
    async fn test_throttle_delegates_metadata() {
        let log = InMemoryLog::new(&LogConfig::default());
        log.write_offset(OffsetName::PipeOffset, 9).await.unwrap();
        let reader = ThrottledReader::new(log, RateLimitConfig::default(), Duration::from_secs(1));

        assert_eq!(reader.offset(OffsetName::PipeOffset).await.unwrap(), Some(9));
        assert_eq!(reader.latest_offset_matching(&[]).await.unwrap(), 0);
        assert_eq!(reader.inner().len().await, 0);
    }
}
