//! Durable SQLite backend.
//!
//! One pool serves all three storage traits. Table definitions live in
//! `schema.rs`; the per-table queries live next to it.

mod fingerprints;
mod rows;
mod scans;
mod schema;
mod tasks;

use crate::error::Result;
use crate::traits::{
    CacheEntry, ChildFilter, FingerprintStore, IndexPage, IndexStore, RecoveryReport, ScanLedger,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::collections::HashMap;
use std::path::Path;
use tracing::info;
use treeline_protocol::{CommitOutcome, IndexRow, RowCounts, ScanId, ScanRecord, Task, TaskId};

/// SQLite-backed index, ledger and fingerprint cache.
#[derive(Clone)]
pub struct IndexDb {
    pool: SqlitePool,
}

impl IndexDb {
    /// Open or create a database at the given path.
    ///
    /// Creates all tables if they don't exist.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let url = format!("sqlite:{}?mode=rwc", path.display());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;

        let db = Self { pool };
        db.ensure_schema().await?;

        info!(path = %path.display(), "Index database opened");
        Ok(db)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

// Timestamp utilities
pub(crate) fn to_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn opt_to_millis(at: Option<DateTime<Utc>>) -> Option<i64> {
    at.map(to_millis)
}

pub(crate) fn from_millis(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or_default()
}

pub(crate) fn opt_from_millis(millis: Option<i64>) -> Option<DateTime<Utc>> {
    millis.map(from_millis)
}

#[async_trait]
impl IndexStore for IndexDb {
    async fn insert_rows(&self, scan_id: &ScanId, rows: &[IndexRow]) -> Result<u64> {
        self.rows_insert(scan_id, rows).await
    }

    async fn get_row(&self, scan_id: &ScanId, path: &str) -> Result<Option<IndexRow>> {
        self.rows_get(scan_id, path).await
    }

    async fn get_children(
        &self,
        scan_id: &ScanId,
        parent_path: &str,
        filter: &ChildFilter,
        page_token: Option<&str>,
        limit: usize,
    ) -> Result<IndexPage> {
        self.rows_children(scan_id, parent_path, filter, page_token, limit)
            .await
    }

    async fn scan_rows(&self, scan_id: &ScanId) -> Result<Vec<IndexRow>> {
        self.rows_for_scan(scan_id).await
    }

    async fn count_rows(&self, scan_id: &ScanId) -> Result<RowCounts> {
        self.rows_count(scan_id).await
    }

    async fn delete_scan(&self, scan_id: &ScanId) -> Result<u64> {
        self.rows_delete(scan_id).await
    }
}

#[async_trait]
impl ScanLedger for IndexDb {
    async fn put_scan(&self, scan: &ScanRecord) -> Result<()> {
        self.scans_upsert(scan).await
    }

    async fn get_scan(&self, scan_id: &ScanId) -> Result<Option<ScanRecord>> {
        self.scans_get(scan_id).await
    }

    async fn list_scans(&self) -> Result<Vec<ScanRecord>> {
        self.scans_list().await
    }

    async fn mark_committed(&self, scan_id: &ScanId, at: DateTime<Utc>) -> Result<()> {
        self.scans_mark_committed(scan_id, at).await
    }

    async fn delete_scan_record(&self, scan_id: &ScanId) -> Result<bool> {
        self.scans_delete(scan_id).await
    }

    async fn record_task(&self, task: &Task) -> Result<()> {
        self.tasks_upsert(task).await
    }

    async fn get_task(&self, task_id: &TaskId) -> Result<Option<Task>> {
        self.tasks_get(task_id).await
    }

    async fn list_tasks(&self) -> Result<Vec<Task>> {
        self.tasks_list().await
    }

    async fn record_commit(&self, outcome: &CommitOutcome) -> Result<()> {
        self.commits_insert(outcome).await
    }

    async fn last_commit(&self, scan_id: &ScanId) -> Result<Option<CommitOutcome>> {
        self.commits_last(scan_id).await
    }

    async fn recover_interrupted(&self, reason: &str) -> Result<RecoveryReport> {
        let tasks = self.tasks_fail_unfinished(reason).await?;
        let scans = self.scans_fail_running(reason).await?;
        Ok(RecoveryReport { tasks, scans })
    }
}

#[async_trait]
impl FingerprintStore for IndexDb {
    async fn load_root(&self, root_key: &str) -> Result<HashMap<String, CacheEntry>> {
        self.fingerprints_load(root_key).await
    }

    async fn replace_root(&self, root_key: &str, entries: Vec<CacheEntry>) -> Result<()> {
        self.fingerprints_replace(root_key, entries).await
    }
}
