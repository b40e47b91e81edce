// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Cursor persistence for pipe offsets.
//!
//! Stores the last applied offset per location in SQLite so a restarted
//! node resumes where it stopped instead of replaying from zero.
//!
//! # Debounced Writes
//!
//! - `set()` updates the in-memory cache immediately and marks the cursor dirty
//! - `flush_dirty()` persists all dirty cursors to disk in a batch
//! - The node calls `flush_dirty()` on an interval and on shutdown
//!
//! A crash between `set()` and `flush_dirty()` loses at most one flush
//! interval of progress. On restart those messages are read again and the
//! local log rejects offsets it already holds.
//!
//! ## Cursor Semantics
//!
//! The cursor stores the **last successfully applied** offset. Reads are
//! exclusive, so it is passed to the next read unchanged.
//!
//! ```text
//! read after 1200 → apply 1201..=1234 → set cursor 1234
//!                   (crash here = re-read from 1200)
//! ```
//!
//! `set()` never moves a cursor backward; only `reset()` does, for a pipe
//! bootstrap.

use crate::config::CursorConfig;
use crate::error::Result;
use crate::store::{connect_sqlite, execute_with_retry};
use sqlx::sqlite::SqlitePool;
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Persistent cursor storage backed by SQLite.
pub struct CursorStore {
    pool: SqlitePool,
    cache: RwLock<HashMap<String, u64>>,
    /// Keys with unflushed cursors
    dirty: RwLock<HashSet<String>>,
    path: String,
    wal_mode: bool,
}

impl CursorStore {
    /// Open the store, creating the table if it doesn't exist.
    pub async fn new(config: &CursorConfig) -> Result<Self> {
        info!(path = %config.sqlite_path, "Initializing cursor store");
        let pool = connect_sqlite(&config.sqlite_path, config.wal_mode).await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cursors (
                location TEXT PRIMARY KEY,
                offset_value INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
        )
        .execute(&pool)
        .await?;

        let rows: Vec<(String, i64)> = sqlx::query_as("SELECT location, offset_value FROM cursors")
            .fetch_all(&pool)
            .await?;

        let mut cache = HashMap::new();
        for (location, offset) in rows {
            debug!(location = %location, offset, "Loaded cursor from disk");
            cache.insert(location, offset.max(0) as u64);
        }

        if !cache.is_empty() {
            info!(count = cache.len(), "Restored cursors from previous run");
        }

        Ok(Self {
            pool,
            cache: RwLock::new(cache),
            dirty: RwLock::new(HashSet::new()),
            path: config.sqlite_path.clone(),
            wal_mode: config.wal_mode,
        })
    }

    pub async fn get(&self, location: &str) -> Option<u64> {
        self.cache.read().await.get(location).copied()
    }

    /// The cursor, or 0 (read from the beginning).
    pub async fn get_or_start(&self, location: &str) -> u64 {
        self.get(location).await.unwrap_or(0)
    }

    /// Advance the cursor (debounced).
    ///
    /// Returns false, leaving the cursor alone, when `offset` is behind it.
    pub async fn set(&self, location: &str, offset: u64) -> bool {
        {
            let mut cache = self.cache.write().await;
            let current = cache.entry(location.to_string()).or_insert(0);
            if offset < *current {
                warn!(location, offset, current = *current, "Refusing to move cursor backward");
                return false;
            }
            *current = offset;
        }
        self.dirty.write().await.insert(location.to_string());
        crate::metrics::set_cursor_offset(location, offset);

        debug!(location, offset, "Cursor updated (pending flush)");
        true
    }

    /// Put the cursor back to 0 (the pipe was wiped).
    pub async fn reset(&self, location: &str) {
        self.cache.write().await.insert(location.to_string(), 0);
        self.dirty.write().await.insert(location.to_string());
        crate::metrics::set_cursor_offset(location, 0);
        info!(location, "Cursor reset");
    }

    /// Flush all dirty cursors to disk. Returns the number flushed.
    pub async fn flush_dirty(&self) -> Result<usize> {
        let dirty: Vec<String> = self.dirty.write().await.drain().collect();
        if dirty.is_empty() {
            return Ok(0);
        }

        let now = chrono::Utc::now().timestamp_millis();
        let snapshot: Vec<(String, u64)> = {
            let cache = self.cache.read().await;
            dirty
                .into_iter()
                .filter_map(|location| cache.get(&location).map(|offset| (location, *offset)))
                .collect()
        };

        let pool = &self.pool;
        let mut flushed = 0;
        let mut errors = 0;
        let mut last_error = None;

        for (location, offset) in snapshot {
            let result = execute_with_retry("cursor_flush", || async {
                sqlx::query(
                    r#"
                    INSERT INTO cursors (location, offset_value, updated_at)
                    VALUES (?, ?, ?)
                    ON CONFLICT(location) DO UPDATE SET
                        offset_value = excluded.offset_value,
                        updated_at = excluded.updated_at
                    "#,
                )
                .bind(&location)
                .bind(offset as i64)
                .bind(now)
                .execute(pool)
                .await
            })
            .await;

            match result {
                Ok(_) => flushed += 1,
                Err(e) => {
                    errors += 1;
                    warn!(location = %location, error = %e, "Failed to flush cursor");
                    // Retry on the next flush
                    self.dirty.write().await.insert(location);
                    last_error = Some(e);
                }
            }
        }

        crate::metrics::record_cursor_flush(flushed, errors);
        if let Some(e) = last_error {
            return Err(e.into());
        }
        debug!(flushed, "Flushed dirty cursors");
        Ok(flushed)
    }

    pub async fn has_dirty(&self) -> bool {
        !self.dirty.read().await.is_empty()
    }

    pub async fn dirty_count(&self) -> usize {
        self.dirty.read().await.len()
    }

    /// Forget the cursor for `location` entirely.
    pub async fn delete(&self, location: &str) -> Result<()> {
        self.cache.write().await.remove(location);
        self.dirty.write().await.remove(location);

        let pool = &self.pool;
        execute_with_retry("cursor_delete", || async {
            sqlx::query("DELETE FROM cursors WHERE location = ?")
                .bind(location)
                .execute(pool)
                .await
        })
        .await?;

        info!(location, "Deleted cursor");
        Ok(())
    }

    pub async fn get_all(&self) -> HashMap<String, u64> {
        self.cache.read().await.clone()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Force flush WAL to main database (for clean shutdown).
    pub async fn checkpoint(&self) -> Result<()> {
        if !self.wal_mode {
            return Ok(());
        }
        let pool = &self.pool;
        execute_with_retry("cursor_checkpoint", || async {
            sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)").execute(pool).await
        })
        .await?;

        debug!("WAL checkpoint complete");
        Ok(())
    }

    /// Flush, checkpoint and close the pool.
    pub async fn close(&self) {
        if self.has_dirty().await {
            match self.flush_dirty().await {
                Ok(count) if count > 0 => info!(count, "Flushed dirty cursors on close"),
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Failed to flush dirty cursors on close"),
            }
        }

        if let Err(e) = self.checkpoint().await {
            warn!(error = %e, "Failed to checkpoint WAL on close");
        }
        self.pool.close().await;
        info!("Cursor store closed");
    }
}
