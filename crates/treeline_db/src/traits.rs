//! Storage seams for the indexing engine.
//!
//! Every backend implements all three traits so callers can swap the
//! in-memory and SQLite stores without changing observable results.

use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use treeline_protocol::{
    CommitOutcome, EntryKind, IndexRow, RowCounts, ScanId, ScanRecord, Task, TaskId,
};

/// Optional narrowing of a child listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildFilter {
    pub kind: Option<EntryKind>,
    /// Compared case-insensitively against the row's lowercased extension
    pub extension: Option<String>,
}

impl ChildFilter {
    pub fn files() -> Self {
        Self {
            kind: Some(EntryKind::File),
            extension: None,
        }
    }

    pub fn folders() -> Self {
        Self {
            kind: Some(EntryKind::Folder),
            extension: None,
        }
    }

    pub fn with_extension(mut self, ext: impl Into<String>) -> Self {
        self.extension = Some(ext.into());
        self
    }

    /// Extension in stored form (lowercase, no leading dot).
    pub fn normalized_extension(&self) -> Option<String> {
        self.extension
            .as_deref()
            .map(|ext| ext.trim_start_matches('.').to_lowercase())
    }

    pub fn matches(&self, row: &IndexRow) -> bool {
        if let Some(kind) = self.kind {
            if row.kind != kind {
                return false;
            }
        }
        match self.normalized_extension() {
            Some(ext) => row.extension.as_deref() == Some(ext.as_str()),
            None => true,
        }
    }
}

/// One page of a child listing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IndexPage {
    pub rows: Vec<IndexRow>,
    /// Present when more rows follow the last one returned
    pub next_token: Option<String>,
}

/// Cached fingerprint plus the row it was derived from.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub fingerprint: String,
    pub row: IndexRow,
}

/// What `recover_interrupted` repaired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub tasks: u64,
    pub scans: u64,
}

/// Hierarchical rows keyed by `(scan_id, path)`.
#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Insert a batch of rows for one scan.
    ///
    /// A row whose path already exists is skipped, except that an explicit
    /// row replaces a synthesized one. Returns the number of rows written.
    async fn insert_rows(&self, scan_id: &ScanId, rows: &[IndexRow]) -> Result<u64>;

    async fn get_row(&self, scan_id: &ScanId, path: &str) -> Result<Option<IndexRow>>;

    /// Children of `parent_path`: folders first, then by name, ties by path.
    async fn get_children(
        &self,
        scan_id: &ScanId,
        parent_path: &str,
        filter: &ChildFilter,
        page_token: Option<&str>,
        limit: usize,
    ) -> Result<IndexPage>;

    /// All rows of a scan: folders by depth, then files by depth.
    async fn scan_rows(&self, scan_id: &ScanId) -> Result<Vec<IndexRow>>;

    async fn count_rows(&self, scan_id: &ScanId) -> Result<RowCounts>;

    /// Remove every row of a scan. Returns the number removed.
    async fn delete_scan(&self, scan_id: &ScanId) -> Result<u64>;
}

/// Scan records, task history and commit outcomes.
#[async_trait]
pub trait ScanLedger: Send + Sync {
    /// Insert or overwrite a scan record.
    async fn put_scan(&self, scan: &ScanRecord) -> Result<()>;

    async fn get_scan(&self, scan_id: &ScanId) -> Result<Option<ScanRecord>>;

    /// Newest first.
    async fn list_scans(&self) -> Result<Vec<ScanRecord>>;

    async fn mark_committed(&self, scan_id: &ScanId, at: DateTime<Utc>) -> Result<()>;

    /// Drop a scan record and its commit outcomes.
    async fn delete_scan_record(&self, scan_id: &ScanId) -> Result<bool>;

    /// Insert or overwrite a task snapshot.
    async fn record_task(&self, task: &Task) -> Result<()>;

    async fn get_task(&self, task_id: &TaskId) -> Result<Option<Task>>;

    /// Newest first.
    async fn list_tasks(&self) -> Result<Vec<Task>>;

    async fn record_commit(&self, outcome: &CommitOutcome) -> Result<()>;

    async fn last_commit(&self, scan_id: &ScanId) -> Result<Option<CommitOutcome>>;

    /// Mark tasks and scans left non-terminal by a previous process as errors.
    async fn recover_interrupted(&self, reason: &str) -> Result<RecoveryReport>;
}

/// Fingerprints of the last successful scan of each logical root.
#[async_trait]
pub trait FingerprintStore: Send + Sync {
    /// Entries keyed by path. Empty when the root was never scanned.
    async fn load_root(&self, root_key: &str) -> Result<HashMap<String, CacheEntry>>;

    /// Atomically supersede everything recorded for a root.
    async fn replace_root(&self, root_key: &str, entries: Vec<CacheEntry>) -> Result<()>;
}

/// Reject rows that belong to a different scan than the batch claims.
pub(crate) fn check_batch(scan_id: &ScanId, rows: &[IndexRow]) -> Result<()> {
    match rows.iter().find(|row| &row.scan_id != scan_id) {
        Some(row) => Err(crate::DbError::invalid_state(format!(
            "row {} belongs to scan {}, not {}",
            row.path, row.scan_id, scan_id
        ))),
        None => Ok(()),
    }
}

/// Ordering used by `scan_rows`.
pub(crate) fn commit_order(rows: &mut [IndexRow]) {
    rows.sort_by(|a, b| {
        a.kind
            .sort_rank()
            .cmp(&b.kind.sort_rank())
            .then(a.depth.cmp(&b.depth))
            .then_with(|| a.path.cmp(&b.path))
    });
}
