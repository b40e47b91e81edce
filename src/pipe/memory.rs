//! Reference in-memory log.
//!
//! Serves the read contract out of a `Vec` sorted by offset. Used as the
//! local store of a node (what it serves to its own followers) and as the
//! origin in tests.

use super::{Message, MessageResults, OffsetName, PipeState, ReadRequest, Reader, Writer};
use crate::config::LogConfig;
use crate::error::{BoxFuture, ReplicationError, Result};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Debug)]
struct LogState {
    messages: Vec<Message>,
    offsets: HashMap<OffsetName, u64>,
    pipe_state: PipeState,
}

impl LogState {
    fn last_offset(&self) -> Option<u64> {
        self.messages.last().and_then(|m| m.offset)
    }
}

/// An append-only log held in memory.
#[derive(Debug)]
pub struct InMemoryLog {
    state: RwLock<LogState>,
    max_batch_messages: usize,
    max_batch_bytes: usize,
    retry_after: Duration,
    origin: bool,
}

impl InMemoryLog {
    /// A log fed by an upstream (an edge node's local store).
    pub fn new(config: &LogConfig) -> Self {
        Self {
            state: RwLock::new(LogState {
                messages: Vec::new(),
                offsets: HashMap::new(),
                pipe_state: PipeState::Unknown,
            }),
            max_batch_messages: config.max_batch_messages.max(1),
            max_batch_bytes: config.max_batch_bytes,
            retry_after: config.retry_after_duration(),
            origin: false,
        }
    }

    /// The root log. It is always up to date and its own newest offset is
    /// the global latest offset.
    pub fn origin(config: &LogConfig) -> Self {
        Self {
            origin: true,
            ..Self::new(config)
        }
    }

    pub fn is_origin(&self) -> bool {
        self.origin
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.messages.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.messages.is_empty()
    }

    /// Snapshot of every message, for assertions and diagnostics.
    pub async fn messages(&self) -> Vec<Message> {
        self.state.read().await.messages.clone()
    }

    fn global_latest(&self, state: &LogState) -> Option<u64> {
        if self.origin {
            Some(state.last_offset().unwrap_or(0))
        } else {
            state.offsets.get(&OffsetName::GlobalLatestOffset).copied()
        }
    }

    fn current_pipe_state(&self, state: &LogState) -> PipeState {
        if self.origin {
            PipeState::UpToDate
        } else {
            state.pipe_state
        }
    }
}

impl Reader for InMemoryLog {
    fn read<'a>(&'a self, request: &'a ReadRequest) -> BoxFuture<'a, MessageResults> {
        Box::pin(async move {
            let state = self.state.read().await;
            let start = state
                .messages
                .partition_point(|m| m.offset.unwrap_or(0) <= request.offset);

            let mut batch = Vec::new();
            let mut bytes = 0usize;
            for message in &state.messages[start..] {
                if !message.matches_types(&request.types) || !message.matches_location(&request.location) {
                    continue;
                }
                let size = message.encoded_size();
                // A single oversized message still goes out alone, or the
                // consumer would never get past it.
                if !batch.is_empty()
                    && (batch.len() >= self.max_batch_messages || bytes + size > self.max_batch_bytes)
                {
                    break;
                }
                bytes += size;
                batch.push(message.clone());
            }

            let retry_after = if batch.is_empty() {
                self.retry_after
            } else {
                Duration::ZERO
            };

            Ok(MessageResults {
                messages: batch,
                retry_after,
                global_latest_offset: self.global_latest(&state),
                pipe_state: self.current_pipe_state(&state),
            })
        })
    }

    fn latest_offset_matching<'a>(&'a self, types: &'a [String]) -> BoxFuture<'a, u64> {
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(state
                .messages
                .iter()
                .rev()
                .find(|m| m.matches_types(types))
                .and_then(|m| m.offset)
                .unwrap_or(0))
        })
    }

    fn offset(&self, name: OffsetName) -> BoxFuture<'_, Option<u64>> {
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(match name {
                OffsetName::LocalLatestOffset => state.last_offset(),
                OffsetName::GlobalLatestOffset => self.global_latest(&state),
                other => state.offsets.get(&other).copied(),
            })
        })
    }

    fn pipe_state(&self) -> BoxFuture<'_, PipeState> {
        Box::pin(async move {
            let state = self.state.read().await;
            Ok(self.current_pipe_state(&state))
        })
    }
}

impl Writer for InMemoryLog {
    fn write_messages(&self, messages: Vec<Message>) -> BoxFuture<'_, u64> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            let mut last = state.last_offset().unwrap_or(0);

            // Validate the whole batch before touching the log.
            let mut assigned = Vec::with_capacity(messages.len());
            for mut message in messages {
                let offset = match message.offset {
                    Some(offset) if offset <= last => {
                        return Err(ReplicationError::InvalidRequest(format!(
                            "offset {offset} is not after {last}"
                        )));
                    }
                    Some(offset) => offset,
                    None => last + 1,
                };
                message.offset = Some(offset);
                last = offset;
                assigned.push(message);
            }

            state.messages.extend(assigned);
            Ok(last)
        })
    }

    fn write_offset(&self, name: OffsetName, value: u64) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.state.write().await.offsets.insert(name, value);
            Ok(())
        })
    }

    fn write_pipe_state(&self, pipe_state: PipeState) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            self.state.write().await.pipe_state = pipe_state;
            Ok(())
        })
    }

    fn delete_all(&self) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.state.write().await;
            state.messages.clear();
            state.offsets.clear();
            state.pipe_state = PipeState::Unknown;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> LogConfig {
        LogConfig {
            max_batch_messages: 100,
            max_batch_bytes: 1024 * 1024,
            retry_after: "5s".to_string(),
            ..LogConfig::default()
        }
    }

    async fn seeded(log: &InMemoryLog, upto: u64, message_type: &str) {
        let messages = (1..=upto)
            .map(|i| Message::new(message_type, format!("k{i}"), "{}").with_offset(i))
            .collect();
        log.write_messages(messages).await.unwrap();
    }

    #[tokio::test]
    async fn test_read_at_head_is_empty_with_retry_after() {
        let log = InMemoryLog::origin(&config());
        seeded(&log, 100, "X").await;

        let results = log
            .read(&ReadRequest::new(100, vec!["X".into()], "L"))
            .await
            .unwrap();
        assert!(results.messages.is_empty());
        assert_eq!(results.retry_after, Duration::from_secs(5));
        assert_eq!(results.global_latest_offset, Some(100));
        assert_eq!(results.pipe_state, PipeState::UpToDate);
    }

    #[tokio::test]
    async fn test_read_behind_head_returns_tail() {
        let log = InMemoryLog::origin(&config());
        seeded(&log, 105, "X").await;

        let results = log
            .read(&ReadRequest::new(100, vec!["X".into()], "L"))
            .await
            .unwrap();
        let offsets: Vec<u64> = results.messages.iter().filter_map(|m| m.offset).collect();
        assert_eq!(offsets, vec![101, 102, 103, 104, 105]);
        assert_eq!(results.retry_after, Duration::ZERO);
        assert_eq!(results.max_offset(), Some(105));
    }

    #[tokio::test]
    async fn test_read_respects_message_limit() {
        let log = InMemoryLog::new(&LogConfig {
            max_batch_messages: 3,
            ..config()
        });
        seeded(&log, 10, "X").await;

        let results = log.read(&ReadRequest::new(0, vec![], "L")).await.unwrap();
        assert_eq!(results.messages.len(), 3);
        assert_eq!(results.max_offset(), Some(3));
        assert_eq!(results.retry_after, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_read_respects_byte_limit() {
        let per_message = Message::new("X", "k1", "{}").encoded_size();
        let log = InMemoryLog::new(&LogConfig {
            max_batch_bytes: per_message * 2 + 1,
            ..config()
        });
        seeded(&log, 9, "X").await;

        let results = log.read(&ReadRequest::new(0, vec![], "L")).await.unwrap();
        assert_eq!(results.messages.len(), 2);
    }

    #[tokio::test]
    async fn test_oversized_message_still_served() {
        let log = InMemoryLog::new(&LogConfig {
            max_batch_bytes: 10,
            ..config()
        });
        seeded(&log, 3, "X").await;

        let results = log.read(&ReadRequest::new(0, vec![], "L")).await.unwrap();
        assert_eq!(results.messages.len(), 1);
        assert_eq!(results.max_offset(), Some(1));
    }

    #[tokio::test]
    async fn test_read_filters_type_and_location() {
        let log = InMemoryLog::new(&config());
        log.write_messages(vec![
            Message::new("price", "a", "{}"),
            Message::new("stock", "b", "{}"),
            Message::new("price", "c", "{}").with_locations(vec!["store-2".into()]),
            Message::new("price", "d", "{}").with_locations(vec!["store-1".into()]),
        ])
        .await
        .unwrap();

        let results = log
            .read(&ReadRequest::new(0, vec!["price".into()], "store-1"))
            .await
            .unwrap();
        let keys: Vec<&str> = results.messages.iter().map(|m| m.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "d"]);
    }

    #[tokio::test]
    async fn test_write_assigns_and_checks_order() {
        let log = InMemoryLog::new(&config());
        let last = log
            .write_messages(vec![Message::new("X", "a", "1"), Message::new("X", "b", "2")])
            .await
            .unwrap();
        assert_eq!(last, 2);

        let last = log
            .write_messages(vec![Message::new("X", "c", "3").with_offset(10)])
            .await
            .unwrap();
        assert_eq!(last, 10);

        let err = log
            .write_messages(vec![
                Message::new("X", "d", "4").with_offset(11),
                Message::new("X", "e", "5").with_offset(9),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, ReplicationError::InvalidRequest(_)));
        // Rejected batch leaves no trace.
        assert_eq!(log.len().await, 3);
    }

    #[tokio::test]
    async fn test_latest_offset_matching() {
        let log = InMemoryLog::new(&config());
        log.write_messages(vec![
            Message::new("price", "a", "{}"),
            Message::new("stock", "b", "{}"),
            Message::new("price", "c", "{}"),
            Message::new("stock", "d", "{}"),
        ])
        .await
        .unwrap();

        assert_eq!(log.latest_offset_matching(&["price".to_string()]).await.unwrap(), 3);
        assert_eq!(log.latest_offset_matching(&[]).await.unwrap(), 4);
        assert_eq!(log.latest_offset_matching(&["promo".to_string()]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_edge_log_reports_stored_offsets_and_state() {
        let log = InMemoryLog::new(&config());
        assert_eq!(log.offset(OffsetName::GlobalLatestOffset).await.unwrap(), None);
        assert_eq!(log.pipe_state().await.unwrap(), PipeState::Unknown);

        log.write_offset(OffsetName::GlobalLatestOffset, 500).await.unwrap();
        log.write_offset(OffsetName::PipeOffset, 480).await.unwrap();
        log.write_pipe_state(PipeState::Behind).await.unwrap();

        assert_eq!(log.offset(OffsetName::GlobalLatestOffset).await.unwrap(), Some(500));
        assert_eq!(log.offset(OffsetName::PipeOffset).await.unwrap(), Some(480));
        assert_eq!(log.pipe_state().await.unwrap(), PipeState::Behind);

        let results = log.read(&ReadRequest::new(0, vec![], "L")).await.unwrap();
        assert_eq!(results.global_latest_offset, Some(500));
        assert_eq!(results.pipe_state, PipeState::Behind);
    }

    #[tokio::test]
    async fn test_delete_all_resets() {
        let log = InMemoryLog::new(&config());
        seeded(&log, 5, "X").await;
        log.write_pipe_state(PipeState::UpToDate).await.unwrap();

        log.delete_all().await.unwrap();
        assert!(log.is_empty().await);
        assert_eq!(log.offset(OffsetName::LocalLatestOffset).await.unwrap(), None);
        assert_eq!(log.pipe_state().await.unwrap(), PipeState::Unknown);
    }
}
