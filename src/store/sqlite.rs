// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! SQLite-backed registry store.
//!
//! ```text
//! registry(group_id TEXT PK, entry TEXT, version INTEGER, updated_at INTEGER)
//! ```
//!
//! The version check lives in the `WHERE` clause, so a conditional write is a
//! single statement and `rows_affected() == 0` means someone else moved the
//! row first. Busy/locked errors are retried with backoff before surfacing.

use super::{CasOutcome, PersistedGroupRecord, RegistryStore};
use crate::config::StoreConfig;
use crate::error::{BoxFuture, ReplicationError, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, info, warn};

const SQLITE_RETRY_MAX_ATTEMPTS: u32 = 5;
const SQLITE_RETRY_BASE_DELAY_MS: u64 = 10;
const SQLITE_RETRY_MAX_DELAY_MS: u64 = 500;

/// Path that opens a private in-memory database.
const MEMORY_PATH: &str = ":memory:";

/// Check if an error is a retryable SQLite busy/locked error
fn is_sqlite_busy_error(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db_err) => {
            // SQLITE_BUSY = 5, SQLITE_LOCKED = 6
            if let Some(code) = db_err.code() {
                return code == "5" || code == "6";
            }
            let msg = db_err.message().to_lowercase();
            msg.contains("database is locked") || msg.contains("database is busy")
        }
        _ => false,
    }
}

/// Execute a database operation with retry on SQLITE_BUSY/SQLITE_LOCKED
pub(crate) async fn execute_with_retry<F, Fut, T>(
    operation_name: &str,
    mut f: F,
) -> std::result::Result<T, sqlx::Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<T, sqlx::Error>>,
{
    let mut attempts = 0;
    let mut delay_ms = SQLITE_RETRY_BASE_DELAY_MS;

    loop {
        attempts += 1;
        match f().await {
            Ok(result) => {
                if attempts > 1 {
                    debug!(operation = operation_name, attempts, "SQLite operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if is_sqlite_busy_error(&e) && attempts < SQLITE_RETRY_MAX_ATTEMPTS => {
                warn!(
                    operation = operation_name,
                    attempts,
                    max_attempts = SQLITE_RETRY_MAX_ATTEMPTS,
                    delay_ms,
                    "SQLite busy, retrying"
                );
                crate::metrics::record_sqlite_retry(operation_name);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                delay_ms = (delay_ms * 2).min(SQLITE_RETRY_MAX_DELAY_MS);
            }
            Err(e) => {
                if is_sqlite_busy_error(&e) {
                    warn!(operation = operation_name, attempts, "SQLite busy, max retries exceeded");
                }
                return Err(e);
            }
        }
    }
}

/// Open a pool on `path`, creating the file if needed.
///
/// `:memory:` gets a single long-lived connection; every extra connection
/// would see its own empty database.
pub(crate) async fn connect_sqlite(path: &str, wal_mode: bool) -> Result<SqlitePool> {
    if path == MEMORY_PATH {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?;
        return Ok(SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?);
    }

    let journal = if wal_mode {
        SqliteJournalMode::Wal
    } else {
        SqliteJournalMode::Delete
    };
    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}?mode=rwc", path))
        .map_err(|e| ReplicationError::Config(format!("Invalid SQLite path: {}", e)))?
        .journal_mode(journal)
        .synchronous(SqliteSynchronous::Normal)
        .create_if_missing(true);

    Ok(SqlitePoolOptions::new()
        .max_connections(2)
        .connect_with(options)
        .await?)
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn cas_outcome(rows_affected: u64, version: i64) -> CasOutcome {
    if rows_affected == 0 {
        CasOutcome::Conflict
    } else {
        CasOutcome::Applied { version }
    }
}

pub struct SqliteRegistryStore {
    pool: SqlitePool,
    path: String,
}

impl SqliteRegistryStore {
    /// Open the store, creating the table if it doesn't exist.
    pub async fn new(config: &StoreConfig) -> Result<Self> {
        info!(path = %config.sqlite_path, "Initializing registry store");
        let pool = connect_sqlite(&config.sqlite_path, config.wal_mode).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS registry (
                group_id TEXT PRIMARY KEY,
                entry TEXT NOT NULL,
                version INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let (groups,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM registry")
            .fetch_one(&pool)
            .await?;
        if groups > 0 {
            info!(groups, "Restored registry from previous run");
        }

        Ok(Self {
            pool,
            path: config.sqlite_path.clone(),
        })
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub async fn close(&self) {
        self.pool.close().await;
        info!("Registry store closed");
    }
}

impl RegistryStore for SqliteRegistryStore {
    fn get<'a>(&'a self, group_id: &'a str) -> BoxFuture<'a, Option<PersistedGroupRecord>> {
        Box::pin(async move {
            let pool = &self.pool;
            let row: Option<(String, String, i64)> = execute_with_retry("registry_get", || async {
                sqlx::query_as("SELECT group_id, entry, version FROM registry WHERE group_id = ?")
                    .bind(group_id)
                    .fetch_optional(pool)
                    .await
            })
            .await?;

            Ok(row.map(|(group_id, entry, version)| PersistedGroupRecord {
                group_id,
                entry,
                version: Some(version),
            }))
        })
    }

    fn list<'a>(&'a self, group_ids: &'a [String]) -> BoxFuture<'a, Vec<PersistedGroupRecord>> {
        Box::pin(async move {
            let pool = &self.pool;
            let sql = if group_ids.is_empty() {
                "SELECT group_id, entry, version FROM registry ORDER BY group_id".to_string()
            } else {
                let placeholders = vec!["?"; group_ids.len()].join(", ");
                format!(
                    "SELECT group_id, entry, version FROM registry WHERE group_id IN ({}) ORDER BY group_id",
                    placeholders
                )
            };

            let rows: Vec<(String, String, i64)> = execute_with_retry("registry_list", || async {
                let mut query = sqlx::query_as(&sql);
                for id in group_ids {
                    query = query.bind(id);
                }
                query.fetch_all(pool).await
            })
            .await?;

            Ok(rows
                .into_iter()
                .map(|(group_id, entry, version)| PersistedGroupRecord {
                    group_id,
                    entry,
                    version: Some(version),
                })
                .collect())
        })
    }

    fn put<'a>(&'a self, group_id: &'a str, entry: String, expected: Option<i64>) -> BoxFuture<'a, CasOutcome> {
        Box::pin(async move {
            let pool = &self.pool;
            let entry = &entry;
            let now = now_millis();

            let outcome = match expected {
                None => {
                    let result = execute_with_retry("registry_insert", || async {
                        sqlx::query(
                            r#"
                            INSERT INTO registry (group_id, entry, version, updated_at)
                            VALUES (?, ?, 0, ?)
                            ON CONFLICT(group_id) DO NOTHING
                            "#,
                        )
                        .bind(group_id)
                        .bind(entry)
                        .bind(now)
                        .execute(pool)
                        .await
                    })
                    .await?;
                    cas_outcome(result.rows_affected(), 0)
                }
                Some(version) => {
                    let result = execute_with_retry("registry_update", || async {
                        sqlx::query(
                            r#"
                            UPDATE registry
                            SET entry = ?, version = version + 1, updated_at = ?
                            WHERE group_id = ? AND version = ?
                            "#,
                        )
                        .bind(entry)
                        .bind(now)
                        .bind(group_id)
                        .bind(version)
                        .execute(pool)
                        .await
                    })
                    .await?;
                    cas_outcome(result.rows_affected(), version + 1)
                }
            };

            if outcome == CasOutcome::Conflict {
                debug!(group_id, ?expected, "Registry write lost the race");
            }
            Ok(outcome)
        })
    }

    fn delete<'a>(&'a self, group_id: &'a str, expected: i64) -> BoxFuture<'a, CasOutcome> {
        Box::pin(async move {
            let pool = &self.pool;
            let result = execute_with_retry("registry_delete", || async {
                sqlx::query("DELETE FROM registry WHERE group_id = ? AND version = ?")
                    .bind(group_id)
                    .bind(expected)
                    .execute(pool)
                    .await
            })
            .await?;
            Ok(cas_outcome(result.rows_affected(), expected))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn file_config(dir: &tempfile::TempDir, name: &str) -> StoreConfig {
        StoreConfig {
            sqlite_path: dir.path().join(name).to_string_lossy().to_string(),
            wal_mode: true,
        }
    }

    #[tokio::test]
    async fn test_insert_update_delete() {
        let dir = tempdir().unwrap();
        let store = SqliteRegistryStore::new(&file_config(&dir, "registry.db")).await.unwrap();

        assert!(store.get("g1").await.unwrap().is_none());
        assert_eq!(
            store.put("g1", "[1]".into(), None).await.unwrap(),
            CasOutcome::Applied { version: 0 }
        );
        assert_eq!(store.put("g1", "[1]".into(), None).await.unwrap(), CasOutcome::Conflict);

        assert_eq!(
            store.put("g1", "[2]".into(), Some(0)).await.unwrap(),
            CasOutcome::Applied { version: 1 }
        );
        assert_eq!(store.put("g1", "[3]".into(), Some(0)).await.unwrap(), CasOutcome::Conflict);

        let row = store.get("g1").await.unwrap().unwrap();
        assert_eq!(row.entry, "[2]");
        assert_eq!(row.version, Some(1));

        assert_eq!(store.delete("g1", 0).await.unwrap(), CasOutcome::Conflict);
        assert!(store.delete("g1", 1).await.unwrap().is_applied());
        assert!(store.get("g1").await.unwrap().is_none());

        store.close().await;
    }

    #[tokio::test]
    async fn test_update_of_missing_row_conflicts() {
        let store = SqliteRegistryStore::new(&StoreConfig::in_memory()).await.unwrap();
        assert_eq!(store.put("g1", "[]".into(), Some(4)).await.unwrap(), CasOutcome::Conflict);
    }

    #[tokio::test]
    async fn test_list() {
        let store = SqliteRegistryStore::new(&StoreConfig::in_memory()).await.unwrap();
        for id in ["c", "a", "b"] {
            store.put(id, "[]".into(), None).await.unwrap();
        }

        let all: Vec<_> = store.list(&[]).await.unwrap().into_iter().map(|r| r.group_id).collect();
        assert_eq!(all, vec!["a", "b", "c"]);

        let some: Vec<_> = store
            .list(&["c".to_string(), "a".to_string()])
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.group_id)
            .collect();
        assert_eq!(some, vec!["a", "c"]);
    }

    #[tokio::test]
    async fn test_rows_survive_reopen() {
        let dir = tempdir().unwrap();
        let config = file_config(&dir, "persist.db");

        {
            let store = SqliteRegistryStore::new(&config).await.unwrap();
            store.put("g1", "[42]".into(), None).await.unwrap();
            store.close().await;
        }

        let store = SqliteRegistryStore::new(&config).await.unwrap();
        let row = store.get("g1").await.unwrap().unwrap();
        assert_eq!(row.entry, "[42]");
        assert_eq!(row.version, Some(0));
        store.close().await;
    }

    #[tokio::test]
    async fn test_execute_with_retry_succeeds_immediately() {
        let mut attempt_count = 0;

        let result: std::result::Result<i32, sqlx::Error> = execute_with_retry("test_op", || {
            attempt_count += 1;
            async { Ok(42) }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempt_count, 1);
    }

    #[tokio::test]
    async fn test_execute_with_retry_fails_on_non_busy_error() {
        let mut attempt_count = 0;

        let result: std::result::Result<i32, sqlx::Error> = execute_with_retry("test_op", || {
            attempt_count += 1;
            async { Err(sqlx::Error::RowNotFound) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempt_count, 1);
    }

    #[test]
    fn test_is_sqlite_busy_error() {
        assert!(!is_sqlite_busy_error(&sqlx::Error::RowNotFound));
        assert!(!is_sqlite_busy_error(&sqlx::Error::PoolTimedOut));
    }
}
