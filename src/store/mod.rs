// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Registry persistence with optimistic concurrency.
//!
//! One row per group: the JSON-encoded node list plus a version. Every write
//! names the version it read; a write against a moved version is refused
//! with [`CasOutcome::Conflict`] and the caller re-reads and retries.
//!
//! ```text
//! get(g)        → {entry, version: 3}
//! put(g, e', 3) → Applied { version: 4 }
//! put(g, e'', 3)→ Conflict               (someone else won)
//! ```

mod memory;
mod sqlite;

pub use memory::InMemoryRegistryStore;
pub use sqlite::SqliteRegistryStore;
pub(crate) use sqlite::{connect_sqlite, execute_with_retry};

use crate::error::BoxFuture;
use std::sync::Arc;

/// A group row as read from the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistedGroupRecord {
    pub group_id: String,
    /// JSON array of node records.
    pub entry: String,
    /// `None` until the row exists.
    pub version: Option<i64>,
}

impl PersistedGroupRecord {
    /// Placeholder for a group that has never been written.
    pub fn unpersisted(group_id: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            entry: "[]".to_string(),
            version: None,
        }
    }

    pub fn is_persisted(&self) -> bool {
        self.version.is_some()
    }
}

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Applied { version: i64 },
    Conflict,
}

impl CasOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// Versioned group storage.
pub trait RegistryStore: Send + Sync + 'static {
    fn get<'a>(&'a self, group_id: &'a str) -> BoxFuture<'a, Option<PersistedGroupRecord>>;

    /// Rows for `group_ids` (empty means every group), ordered by group id.
    fn list<'a>(&'a self, group_ids: &'a [String]) -> BoxFuture<'a, Vec<PersistedGroupRecord>>;

    /// Insert when `expected` is `None`, otherwise update only if the stored
    /// version still equals `expected`.
    fn put<'a>(&'a self, group_id: &'a str, entry: String, expected: Option<i64>) -> BoxFuture<'a, CasOutcome>;

    /// Delete only if the stored version still equals `expected`.
    fn delete<'a>(&'a self, group_id: &'a str, expected: i64) -> BoxFuture<'a, CasOutcome>;
}

impl<S: RegistryStore> RegistryStore for Arc<S> {
    fn get<'a>(&'a self, group_id: &'a str) -> BoxFuture<'a, Option<PersistedGroupRecord>> {
        (**self).get(group_id)
    }

    fn list<'a>(&'a self, group_ids: &'a [String]) -> BoxFuture<'a, Vec<PersistedGroupRecord>> {
        (**self).list(group_ids)
    }

    fn put<'a>(&'a self, group_id: &'a str, entry: String, expected: Option<i64>) -> BoxFuture<'a, CasOutcome> {
        (**self).put(group_id, entry, expected)
    }

    fn delete<'a>(&'a self, group_id: &'a str, expected: i64) -> BoxFuture<'a, CasOutcome> {
        (**self).delete(group_id, expected)
    }
}
