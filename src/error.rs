// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the pipe replication crate.
//!
//! Errors are categorized by their source (registry store, upstream pipe,
//! location service, etc.) and carry enough context to be logged directly.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Store` | No | Local/registry database errors (needs operator attention) |
//! | `VersionConflict` | Yes | Another registry instance won the CAS race |
//! | `RegistrationExhausted` | No | CAS retry budget spent, surfaced to the registering node |
//! | `NodeNotFound` | No | Node vanished from a group it was just placed in (planner bug) |
//! | `Upstream` | Yes | Upstream pipe returned an error or unexpected status |
//! | `UpstreamTimeout` | Yes | Upstream call exceeded its timeout |
//! | `NoUpstreamAvailable` | Yes | Every URL in the follow chain is down |
//! | `CircuitOpen` | Yes | Registry circuit breaker is open |
//! | `LocationUnavailable` | Yes | Location service answered 5xx |
//! | `LocationRejected` | No | Location service answered 4xx |
//! | `InvalidRequest` | No | Caller error (negative offset, missing location) |
//! | `InvalidUrl` | No | Malformed URL |
//! | `Serialization` | No | Stored or received JSON is malformed |
//! | `Io` | No | Local file access failed |
//! | `Config` | No | Configuration invalid |
//! | `Unsupported` | No | Operation not offered by this reader |
//! | `InvalidState` | No | Node state machine violation |
//!
//! # Retry Behavior
//!
//! Use [`ReplicationError::is_retryable()`] to decide whether an operation
//! should be retried with backoff. Retryable errors are transient availability
//! issues; the rest are bugs, bad input or configuration problems.

use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Result type alias for replication operations.
pub type Result<T> = std::result::Result<T, ReplicationError>;

/// Type alias for boxed async futures (reduces trait signature complexity).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Errors that can occur in the registry or in a replicating node.
#[derive(Error, Debug)]
pub enum ReplicationError {
    /// SQLite error in the registry store or cursor store.
    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Optimistic concurrency conflict on a group row.
    ///
    /// Another writer updated the row between our read and our write.
    #[error("Version conflict on group {group_id}")]
    VersionConflict { group_id: String },

    /// Registration gave up after spending its CAS retry budget.
    #[error("Registration for group {group_id} failed after {attempts} attempts")]
    RegistrationExhausted { group_id: String, attempts: usize },

    /// A node that was just upserted is missing from its group.
    #[error("Node {id} not found after placement")]
    NodeNotFound { id: String },

    /// Upstream pipe error (connection refused, non-success status, bad body).
    #[error("Upstream error ({url}): {message}")]
    Upstream { url: String, message: String },

    /// Upstream call exceeded its timeout.
    #[error("Upstream timeout ({url})")]
    UpstreamTimeout { url: String },

    /// No URL of the follow chain is currently up.
    #[error("No accessible service")]
    NoUpstreamAvailable,

    /// A circuit breaker is open and rejected the call.
    #[error("Circuit open: {0}")]
    CircuitOpen(String),

    /// Location service failed server-side.
    #[error("Location service unavailable (status {status}): {message}")]
    LocationUnavailable { status: u16, message: String },

    /// Location service rejected the request.
    #[error("Location service rejected request (status {status}): {message}")]
    LocationRejected { status: u16, message: String },

    /// Caller error on the read contract.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Malformed URL.
    #[error("Invalid URL {url}: {message}")]
    InvalidUrl { url: String, message: String },

    /// JSON encode/decode failure.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Local file access failure (service list persistence).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Operation not offered by this implementation.
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Node state machine violation.
    ///
    /// Occurs when an operation is attempted in the wrong state
    /// (e.g., calling `start()` on an already-running node).
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },
}

impl ReplicationError {
    /// Create an upstream error for the given URL.
    pub fn upstream(url: impl ToString, message: impl Into<String>) -> Self {
        Self::Upstream {
            url: url.to_string(),
            message: message.into(),
        }
    }

    /// Create an invalid URL error.
    pub fn invalid_url(url: impl Into<String>, source: url::ParseError) -> Self {
        Self::InvalidUrl {
            url: url.into(),
            message: source.to_string(),
        }
    }

    /// Classify a location service status code.
    ///
    /// 5xx is transient, anything else non-successful is the caller's fault.
    pub fn location(status: u16, message: impl Into<String>) -> Self {
        if status >= 500 {
            Self::LocationUnavailable {
                status,
                message: message.into(),
            }
        } else {
            Self::LocationRejected {
                status,
                message: message.into(),
            }
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::VersionConflict { .. } => true,
            Self::Upstream { .. } => true,
            Self::UpstreamTimeout { .. } => true,
            Self::NoUpstreamAvailable => true,
            Self::CircuitOpen(_) => true,
            Self::LocationUnavailable { .. } => true,
            Self::Store(_) => false, // Local DB issues need attention
            Self::RegistrationExhausted { .. } => false,
            Self::NodeNotFound { .. } => false,
            Self::LocationRejected { .. } => false,
            Self::InvalidRequest(_) => false,
            Self::InvalidUrl { .. } => false,
            Self::Serialization(_) => false,
            Self::Io(_) => false,
            Self::Config(_) => false,
            Self::Unsupported(_) => false,
            Self::InvalidState { .. } => false,
        }
    }
}

impl From<reqwest::Error> for ReplicationError {
    fn from(e: reqwest::Error) -> Self {
        let url = e
            .url()
            .map(|u| u.to_string())
            .unwrap_or_else(|| "unknown".to_string());
        if e.is_timeout() {
            Self::UpstreamTimeout { url }
        } else {
            Self::Upstream {
                url,
                message: e.to_string(),
            }
        }
    }
}
