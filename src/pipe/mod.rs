//! Data plane: the pull protocol every upstream serves.
//!
//! A consumer asks for everything after its cursor:
//!
//! ```text
//! GET {base}/pipe/{offset}?type=a,b&location=L
//!
//! 200 OK
//! Retry-After: 5                  # seconds to wait before polling again
//! Global-Latest-Offset: 184467    # newest offset known at the origin
//! Pipe-State: UP_TO_DATE          # upstream's own state
//! [ {"offset": 101, ...}, ... ]   # ascending, bounded batch
//! ```
//!
//! The offset is exclusive: a read at 100 returns offsets 101 and up. An empty
//! type list matches every type. Storage engines implement [`Reader`] and
//! [`Writer`]; nothing above this module knows which engine is in use.

mod location;
mod memory;
mod throttle;

pub use location::{HttpLocationResolver, LocationResolver, ResolvingReader, StaticLocationResolver};
pub use memory::InMemoryLog;
pub use throttle::ThrottledReader;

use crate::error::{BoxFuture, ReplicationError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

pub const RETRY_AFTER_HEADER: &str = "Retry-After";
pub const GLOBAL_LATEST_OFFSET_HEADER: &str = "Global-Latest-Offset";
pub const PIPE_STATE_HEADER: &str = "Pipe-State";
pub const CONTENT_ENCODING_HEADER: &str = "X-Content-Encoding";

/// Path segment of the health probe.
pub const STATUS_PATH: &str = "pipe/_status";

/// Fixed per-message cost counted against the batch byte limit
/// (offset digits, timestamp, JSON punctuation).
pub const MAX_OVERHEAD_SIZE: usize = 19 + 64 + 6;

// ═══════════════════════════════════════════════════════════════════════════════
// Messages
// ═══════════════════════════════════════════════════════════════════════════════

/// One event of the pipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Position in the log. `None` until the writer assigns one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,

    #[serde(rename = "type")]
    pub message_type: String,

    pub key: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,

    pub data: String,

    /// Locations this message is addressed to. Empty means everywhere.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub locations: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl Message {
    pub fn new(message_type: impl Into<String>, key: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            offset: None,
            message_type: message_type.into(),
            key: key.into(),
            content_type: None,
            data: data.into(),
            locations: Vec::new(),
            timestamp: None,
        }
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.offset = Some(offset);
        self
    }

    pub fn with_locations(mut self, locations: Vec<String>) -> Self {
        self.locations = locations;
        self
    }

    /// Whether this message is in `types` (empty means all).
    pub fn matches_types(&self, types: &[String]) -> bool {
        types.is_empty() || types.iter().any(|t| t == &self.message_type)
    }

    /// Whether this message is addressed to `location`.
    pub fn matches_location(&self, location: &str) -> bool {
        self.locations.is_empty() || self.locations.iter().any(|l| l == location)
    }

    /// Bytes this message costs against a batch limit.
    pub fn encoded_size(&self) -> usize {
        self.data.len()
            + self.key.len()
            + self.message_type.len()
            + self.content_type.as_ref().map_or(0, String::len)
            + MAX_OVERHEAD_SIZE
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Pipe state and offsets
// ═══════════════════════════════════════════════════════════════════════════════

/// A consumer's relationship to its upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PipeState {
    #[serde(rename = "UP_TO_DATE")]
    UpToDate,
    /// Unread events remain upstream.
    #[serde(rename = "OUT_OF_DATE", alias = "BEHIND")]
    Behind,
    #[serde(rename = "UNKNOWN")]
    Unknown,
}

impl PipeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UpToDate => "UP_TO_DATE",
            Self::Behind => "OUT_OF_DATE",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Parse a header value, `UNKNOWN` when absent or unrecognised.
    pub fn from_header(value: Option<&str>) -> Self {
        value
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(Self::Unknown)
    }
}

impl fmt::Display for PipeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipeState {
    type Err = ReplicationError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "UP_TO_DATE" => Ok(Self::UpToDate),
            "OUT_OF_DATE" | "BEHIND" => Ok(Self::Behind),
            "UNKNOWN" => Ok(Self::Unknown),
            other => Err(ReplicationError::InvalidRequest(format!("unknown pipe state {other}"))),
        }
    }
}

/// Classify a consumer after a read.
///
/// Caught up once the cursor reaches the origin's latest offset. Without a
/// global offset the consumer cannot tell.
pub fn derive_pipe_state(offset: u64, global_latest_offset: Option<u64>) -> PipeState {
    match global_latest_offset {
        Some(latest) if offset >= latest => PipeState::UpToDate,
        Some(_) => PipeState::Behind,
        None => PipeState::Unknown,
    }
}

/// Named offsets a log keeps next to its messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OffsetName {
    /// Newest offset at the origin, as last reported by the upstream.
    GlobalLatestOffset,
    /// Newest offset in this log.
    LocalLatestOffset,
    /// Offset this node has consumed up to.
    PipeOffset,
    MaxOffsetPreviousHour,
}

impl OffsetName {
    /// Wire name, as used in a node's reported offsets.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GlobalLatestOffset => "GLOBAL_LATEST_OFFSET",
            Self::LocalLatestOffset => "LOCAL_LATEST_OFFSET",
            Self::PipeOffset => "PIPE_OFFSET",
            Self::MaxOffsetPreviousHour => "MAX_OFFSET_PREVIOUS_HOUR",
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Read contract
// ═══════════════════════════════════════════════════════════════════════════════

/// Parameters of one read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    /// Exclusive cursor.
    pub offset: u64,
    /// Empty means all types.
    pub types: Vec<String>,
    pub location: String,
}

impl ReadRequest {
    pub fn new(offset: u64, types: Vec<String>, location: impl Into<String>) -> Self {
        Self {
            offset,
            types,
            location: location.into(),
        }
    }

    /// Parse the raw path/query values of a pipe request.
    ///
    /// Rejects negative offsets and a missing location; `type` is a comma
    /// separated list.
    pub fn parse(offset: &str, types: Option<&str>, location: Option<&str>) -> Result<Self> {
        let offset: i64 = offset
            .trim()
            .parse()
            .map_err(|_| ReplicationError::InvalidRequest(format!("offset {offset:?} is not a number")))?;
        if offset < 0 {
            return Err(ReplicationError::InvalidRequest(format!("offset {offset} is negative")));
        }
        let location = location.map(str::trim).unwrap_or_default();
        if location.is_empty() {
            return Err(ReplicationError::InvalidRequest("location is required".to_string()));
        }
        Ok(Self {
            offset: offset as u64,
            types: split_types(types.unwrap_or_default()),
            location: location.to_string(),
        })
    }

    /// Query string for this request (`type=a,b&location=L`).
    pub fn query(&self) -> Vec<(&'static str, String)> {
        let mut query = Vec::with_capacity(2);
        if !self.types.is_empty() {
            query.push(("type", self.types.join(",")));
        }
        query.push(("location", self.location.clone()));
        query
    }
}

/// Split a `type` parameter on commas, dropping blanks.
pub fn split_types(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

/// A bounded batch plus the metadata a consumer needs to pace itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageResults {
    /// Ascending by offset.
    pub messages: Vec<Message>,
    /// Zero when more data is immediately available.
    pub retry_after: Duration,
    pub global_latest_offset: Option<u64>,
    pub pipe_state: PipeState,
}

impl MessageResults {
    pub fn empty(retry_after: Duration, global_latest_offset: Option<u64>, pipe_state: PipeState) -> Self {
        Self {
            messages: Vec::new(),
            retry_after,
            global_latest_offset,
            pipe_state,
        }
    }

    /// Highest offset in the batch.
    pub fn max_offset(&self) -> Option<u64> {
        self.messages.iter().filter_map(|m| m.offset).max()
    }

    /// Response headers carrying this batch's metadata.
    pub fn headers(&self) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            (RETRY_AFTER_HEADER, self.retry_after.as_secs().to_string()),
            (PIPE_STATE_HEADER, self.pipe_state.to_string()),
        ];
        if let Some(latest) = self.global_latest_offset {
            headers.push((GLOBAL_LATEST_OFFSET_HEADER, latest.to_string()));
        }
        headers
    }
}

/// Parse `Retry-After` seconds. Garbage and negatives read as zero.
pub fn parse_retry_after(value: Option<&str>) -> Duration {
    value
        .and_then(|v| v.trim().parse::<i64>().ok())
        .map(|secs| Duration::from_secs(secs.max(0) as u64))
        .unwrap_or(Duration::ZERO)
}

/// Parse `Global-Latest-Offset`; absent or malformed means unknown.
pub fn parse_global_latest_offset(value: Option<&str>) -> Option<u64> {
    value.and_then(|v| v.trim().parse::<u64>().ok())
}

/// Read side of a log.
pub trait Reader: Send + Sync + 'static {
    /// Messages strictly after `request.offset`, filtered and bounded.
    fn read<'a>(&'a self, request: &'a ReadRequest) -> BoxFuture<'a, MessageResults>;

    /// Newest offset among `types` (empty means all), 0 when none match.
    fn latest_offset_matching<'a>(&'a self, types: &'a [String]) -> BoxFuture<'a, u64>;

    fn offset(&self, name: OffsetName) -> BoxFuture<'_, Option<u64>>;

    fn pipe_state(&self) -> BoxFuture<'_, PipeState>;
}

/// Write side of a log.
pub trait Writer: Send + Sync + 'static {
    /// Append in ascending offset order; returns the last offset written.
    ///
    /// Messages without an offset get the next one.
    fn write_messages(&self, messages: Vec<Message>) -> BoxFuture<'_, u64>;

    fn write_offset(&self, name: OffsetName, value: u64) -> BoxFuture<'_, ()>;

    fn write_pipe_state(&self, state: PipeState) -> BoxFuture<'_, ()>;

    /// Drop every message and offset (pipe bootstrap).
    fn delete_all(&self) -> BoxFuture<'_, ()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_derive_pipe_state() {
        assert_eq!(derive_pipe_state(105, Some(105)), PipeState::UpToDate);
        assert_eq!(derive_pipe_state(106, Some(105)), PipeState::UpToDate);
        assert_eq!(derive_pipe_state(100, Some(105)), PipeState::Behind);
        assert_eq!(derive_pipe_state(100, None), PipeState::Unknown);
    }

    #[test]
    fn test_pipe_state_header_values() {
        assert_eq!(PipeState::from_header(Some("UP_TO_DATE")), PipeState::UpToDate);
        assert_eq!(PipeState::from_header(Some("OUT_OF_DATE")), PipeState::Behind);
        assert_eq!(PipeState::from_header(Some("BEHIND")), PipeState::Behind);
        assert_eq!(PipeState::from_header(Some("sideways")), PipeState::Unknown);
        assert_eq!(PipeState::from_header(None), PipeState::Unknown);
        assert_eq!(PipeState::Behind.to_string(), "OUT_OF_DATE");
    }

    #[test]
    fn test_pipe_state_serde() {
        let json = serde_json::to_string(&PipeState::UpToDate).unwrap();
        assert_eq!(json, "\"UP_TO_DATE\"");
        let parsed: PipeState = serde_json::from_str("\"BEHIND\"").unwrap();
        assert_eq!(parsed, PipeState::Behind);
    }

    #[test]
    fn test_offset_name_serde() {
        let json = serde_json::to_string(&OffsetName::GlobalLatestOffset).unwrap();
        assert_eq!(json, "\"GLOBAL_LATEST_OFFSET\"");

        for name in [
            OffsetName::GlobalLatestOffset,
            OffsetName::LocalLatestOffset,
            OffsetName::PipeOffset,
            OffsetName::MaxOffsetPreviousHour,
        ] {
            let json = serde_json::to_string(&name).unwrap();
            assert_eq!(json, format!("\"{}\"", name.as_str()));
        }
    }

    #[test]
    fn test_parse_retry_after() {
        assert_eq!(parse_retry_after(Some("5")), Duration::from_secs(5));
        assert_eq!(parse_retry_after(Some(" 12 ")), Duration::from_secs(12));
        assert_eq!(parse_retry_after(Some("-3")), Duration::ZERO);
        assert_eq!(parse_retry_after(Some("soon")), Duration::ZERO);
        assert_eq!(parse_retry_after(None), Duration::ZERO);
    }

    #[test]
    fn test_parse_global_latest_offset() {
        assert_eq!(parse_global_latest_offset(Some("184467")), Some(184_467));
        assert_eq!(parse_global_latest_offset(Some("x")), None);
        assert_eq!(parse_global_latest_offset(None), None);
    }

    #[test]
    fn test_read_request_parse() {
        let req = ReadRequest::parse("100", Some("price, stock,,"), Some("store-1")).unwrap();
        assert_eq!(req.offset, 100);
        assert_eq!(req.types, vec!["price".to_string(), "stock".to_string()]);
        assert_eq!(req.location, "store-1");

        let req = ReadRequest::parse("0", None, Some("store-1")).unwrap();
        assert!(req.types.is_empty());
    }

    #[test]
    fn test_read_request_rejects_bad_input() {
        assert!(matches!(
            ReadRequest::parse("-1", None, Some("store-1")),
            Err(ReplicationError::InvalidRequest(_))
        ));
        assert!(matches!(
            ReadRequest::parse("10", None, Some("  ")),
            Err(ReplicationError::InvalidRequest(_))
        ));
        assert!(matches!(
            ReadRequest::parse("ten", None, Some("store-1")),
            Err(ReplicationError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_read_request_query() {
        let req = ReadRequest::new(5, vec!["a".into(), "b".into()], "L");
        assert_eq!(req.query(), vec![("type", "a,b".to_string()), ("location", "L".to_string())]);

        let req = ReadRequest::new(5, vec![], "L");
        assert_eq!(req.query(), vec![("location", "L".to_string())]);
    }

    #[test]
    fn test_message_filters() {
        let msg = Message::new("price", "sku-1", "{}").with_locations(vec!["store-1".into()]);
        assert!(msg.matches_types(&[]));
        assert!(msg.matches_types(&["price".to_string()]));
        assert!(!msg.matches_types(&["stock".to_string()]));
        assert!(msg.matches_location("store-1"));
        assert!(!msg.matches_location("store-2"));

        let broadcast = Message::new("price", "sku-1", "{}");
        assert!(broadcast.matches_location("anywhere"));
    }

    #[test]
    fn test_message_encoded_size() {
        let msg = Message::new("t", "k", "0123456789");
        assert_eq!(msg.encoded_size(), 12 + MAX_OVERHEAD_SIZE);
    }

    #[test]
    fn test_message_json_shape() {
        let msg = Message::new("price", "sku-1", "{\"p\":1}").with_offset(7);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "price");
        assert_eq!(json["offset"], 7);
        assert!(json.get("locations").is_none());
    }

    #[test]
    fn test_results_headers() {
        let results = MessageResults::empty(Duration::from_secs(5), Some(42), PipeState::Behind);
        let headers = results.headers();
        assert!(headers.contains(&(RETRY_AFTER_HEADER, "5".to_string())));
        assert!(headers.contains(&(PIPE_STATE_HEADER, "OUT_OF_DATE".to_string())));
        assert!(headers.contains(&(GLOBAL_LATEST_OFFSET_HEADER, "42".to_string())));
        assert_eq!(results.max_offset(), None);
    }
}
