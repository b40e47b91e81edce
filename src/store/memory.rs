//! In-process registry store.

use super::{CasOutcome, PersistedGroupRecord, RegistryStore};
use crate::error::BoxFuture;
use std::collections::BTreeMap;
use tokio::sync::RwLock;

#[derive(Debug, Default)]
pub struct InMemoryRegistryStore {
    rows: RwLock<BTreeMap<String, (String, i64)>>,
}

impl InMemoryRegistryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rows.read().await.is_empty()
    }
}

fn record(group_id: &str, row: &(String, i64)) -> PersistedGroupRecord {
    PersistedGroupRecord {
        group_id: group_id.to_string(),
        entry: row.0.clone(),
        version: Some(row.1),
    }
}

impl RegistryStore for InMemoryRegistryStore {
    fn get<'a>(&'a self, group_id: &'a str) -> BoxFuture<'a, Option<PersistedGroupRecord>> {
        Box::pin(async move {
            Ok(self.rows.read().await.get(group_id).map(|row| record(group_id, row)))
        })
    }

    fn list<'a>(&'a self, group_ids: &'a [String]) -> BoxFuture<'a, Vec<PersistedGroupRecord>> {
        Box::pin(async move {
            let rows = self.rows.read().await;
            Ok(rows
                .iter()
                .filter(|(id, _)| group_ids.is_empty() || group_ids.contains(id))
                .map(|(id, row)| record(id, row))
                .collect())
        })
    }

    fn put<'a>(&'a self, group_id: &'a str, entry: String, expected: Option<i64>) -> BoxFuture<'a, CasOutcome> {
        Box::pin(async move {
            let mut rows = self.rows.write().await;
            let outcome = match (rows.get_mut(group_id), expected) {
                (None, None) => {
                    rows.insert(group_id.to_string(), (entry, 0));
                    CasOutcome::Applied { version: 0 }
                }
                (Some(row), Some(expected)) if row.1 == expected => {
                    *row = (entry, expected + 1);
                    CasOutcome::Applied { version: expected + 1 }
                }
                _ => CasOutcome::Conflict,
            };
            Ok(outcome)
        })
    }

    fn delete<'a>(&'a self, group_id: &'a str, expected: i64) -> BoxFuture<'a, CasOutcome> {
        Box::pin(async move {
            let mut rows = self.rows.write().await;
            match rows.get(group_id) {
                Some((_, version)) if *version == expected => {
                    rows.remove(group_id);
                    Ok(CasOutcome::Applied { version: expected })
                }
                _ => Ok(CasOutcome::Conflict),
            }
        })
    }
}
