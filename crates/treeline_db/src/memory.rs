//! In-memory backend.
//!
//! Each scan owns its own partition behind its own lock, so scans writing
//! concurrently never contend. Listing walks a sorted per-parent key set.

use crate::error::{DbError, Result};
use crate::page::{decode_token, encode_token};
use crate::traits::{
    check_batch, commit_order, CacheEntry, ChildFilter, FingerprintStore, IndexPage, IndexStore,
    RecoveryReport, ScanLedger,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeSet, HashMap};
use std::ops::Bound;
use std::sync::Arc;
use treeline_protocol::{
    CommitOutcome, EntryKind, IndexRow, RowCounts, RowSortKey, ScanId, ScanRecord, ScanStatus,
    Task, TaskId, TaskStatus,
};

// ============================================================================
// Index rows
// ============================================================================

#[derive(Default)]
struct ScanPartition {
    rows: HashMap<String, IndexRow>,
    children: HashMap<String, BTreeSet<RowSortKey>>,
}

impl ScanPartition {
    /// Returns true if the row was written.
    fn upsert(&mut self, row: &IndexRow) -> bool {
        if let Some(existing) = self.rows.get(&row.path) {
            if !(existing.synthesized && !row.synthesized) {
                return false;
            }
            let old_key = existing.sort_key();
            if let Some(parent) = existing.parent_path.clone() {
                if let Some(set) = self.children.get_mut(&parent) {
                    set.remove(&old_key);
                }
            }
        }

        if let Some(parent) = &row.parent_path {
            self.children
                .entry(parent.clone())
                .or_default()
                .insert(row.sort_key());
        }
        self.rows.insert(row.path.clone(), row.clone());
        true
    }
}

/// Index rows held in process memory.
#[derive(Default)]
pub struct MemoryIndex {
    scans: DashMap<ScanId, Arc<RwLock<ScanPartition>>>,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    fn partition(&self, scan_id: &ScanId) -> Option<Arc<RwLock<ScanPartition>>> {
        self.scans.get(scan_id).map(|p| Arc::clone(p.value()))
    }
}

#[async_trait]
impl IndexStore for MemoryIndex {
    async fn insert_rows(&self, scan_id: &ScanId, rows: &[IndexRow]) -> Result<u64> {
        check_batch(scan_id, rows)?;
        if rows.is_empty() {
            return Ok(0);
        }
        // Clone the Arc out so the DashMap shard lock is not held while writing
        let partition = Arc::clone(
            self.scans
                .entry(scan_id.clone())
                .or_default()
                .value(),
        );
        let mut guard = partition.write();
        let written = rows.iter().filter(|row| guard.upsert(row)).count();
        Ok(written as u64)
    }

    async fn get_row(&self, scan_id: &ScanId, path: &str) -> Result<Option<IndexRow>> {
        Ok(self
            .partition(scan_id)
            .and_then(|p| p.read().rows.get(path).cloned()))
    }

    async fn get_children(
        &self,
        scan_id: &ScanId,
        parent_path: &str,
        filter: &ChildFilter,
        page_token: Option<&str>,
        limit: usize,
    ) -> Result<IndexPage> {
        let after = page_token.map(decode_token).transpose()?;
        let Some(partition) = self.partition(scan_id) else {
            return Ok(IndexPage::default());
        };
        let guard = partition.read();
        let Some(keys) = guard.children.get(parent_path) else {
            return Ok(IndexPage::default());
        };

        let lower = match &after {
            Some(key) => Bound::Excluded(key),
            None => Bound::Unbounded,
        };
        let mut matched = keys
            .range((lower, Bound::Unbounded))
            .filter_map(|key| guard.rows.get(&key.path))
            .filter(|row| filter.matches(row))
            .take(limit.saturating_add(1))
            .cloned()
            .collect::<Vec<_>>();

        let next_token = if matched.len() > limit {
            matched.truncate(limit);
            match matched.last() {
                Some(last) => Some(encode_token(&last.sort_key())?),
                None => None,
            }
        } else {
            None
        };

        Ok(IndexPage {
            rows: matched,
            next_token,
        })
    }

    async fn scan_rows(&self, scan_id: &ScanId) -> Result<Vec<IndexRow>> {
        let mut rows = match self.partition(scan_id) {
            Some(p) => p.read().rows.values().cloned().collect::<Vec<_>>(),
            None => Vec::new(),
        };
        commit_order(&mut rows);
        Ok(rows)
    }

    async fn count_rows(&self, scan_id: &ScanId) -> Result<RowCounts> {
        let mut counts = RowCounts::default();
        if let Some(p) = self.partition(scan_id) {
            for row in p.read().rows.values() {
                match row.kind {
                    EntryKind::File => counts.files += 1,
                    EntryKind::Folder => counts.folders += 1,
                }
            }
        }
        Ok(counts)
    }

    async fn delete_scan(&self, scan_id: &ScanId) -> Result<u64> {
        Ok(self
            .scans
            .remove(scan_id)
            .map(|(_, p)| p.read().rows.len() as u64)
            .unwrap_or(0))
    }
}

// ============================================================================
// Ledger
// ============================================================================

/// Scan records, task history and commit outcomes held in process memory.
#[derive(Default)]
pub struct MemoryLedger {
    scans: RwLock<HashMap<ScanId, ScanRecord>>,
    tasks: RwLock<HashMap<TaskId, Task>>,
    commits: RwLock<Vec<CommitOutcome>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ScanLedger for MemoryLedger {
    async fn put_scan(&self, scan: &ScanRecord) -> Result<()> {
        self.scans.write().insert(scan.id.clone(), scan.clone());
        Ok(())
    }

    async fn get_scan(&self, scan_id: &ScanId) -> Result<Option<ScanRecord>> {
        Ok(self.scans.read().get(scan_id).cloned())
    }

    async fn list_scans(&self) -> Result<Vec<ScanRecord>> {
        let mut scans: Vec<_> = self.scans.read().values().cloned().collect();
        scans.sort_by(|a, b| b.started_at.cmp(&a.started_at).then_with(|| a.id.cmp(&b.id)));
        Ok(scans)
    }

    async fn mark_committed(&self, scan_id: &ScanId, at: DateTime<Utc>) -> Result<()> {
        let mut scans = self.scans.write();
        let scan = scans
            .get_mut(scan_id)
            .ok_or_else(|| DbError::not_found(format!("scan {}", scan_id)))?;
        scan.committed = true;
        scan.committed_at = Some(at);
        Ok(())
    }

    async fn delete_scan_record(&self, scan_id: &ScanId) -> Result<bool> {
        let removed = self.scans.write().remove(scan_id).is_some();
        self.commits.write().retain(|c| &c.scan_id != scan_id);
        Ok(removed)
    }

    async fn record_task(&self, task: &Task) -> Result<()> {
        self.tasks.write().insert(task.task_id.clone(), task.clone());
        Ok(())
    }

    async fn get_task(&self, task_id: &TaskId) -> Result<Option<Task>> {
        Ok(self.tasks.read().get(task_id).cloned())
    }

    async fn list_tasks(&self) -> Result<Vec<Task>> {
        let mut tasks: Vec<_> = self.tasks.read().values().cloned().collect();
        tasks.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.task_id.cmp(&b.task_id))
        });
        Ok(tasks)
    }

    async fn record_commit(&self, outcome: &CommitOutcome) -> Result<()> {
        self.commits.write().push(outcome.clone());
        Ok(())
    }

    async fn last_commit(&self, scan_id: &ScanId) -> Result<Option<CommitOutcome>> {
        // Later pushes win ties on attempted_at
        Ok(self
            .commits
            .read()
            .iter()
            .filter(|c| &c.scan_id == scan_id)
            .fold(None::<&CommitOutcome>, |best, c| match best {
                Some(b) if b.attempted_at > c.attempted_at => Some(b),
                _ => Some(c),
            })
            .cloned())
    }

    async fn recover_interrupted(&self, reason: &str) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let now = Utc::now();

        for task in self.tasks.write().values_mut() {
            if matches!(task.status, TaskStatus::Queued | TaskStatus::Running) {
                task.status = TaskStatus::Error;
                task.error = Some(reason.to_string());
                task.eta_seconds = None;
                task.ended_at = Some(now);
                report.tasks += 1;
            }
        }
        for scan in self.scans.write().values_mut() {
            if scan.status == ScanStatus::Running {
                scan.status = ScanStatus::Error;
                scan.error = Some(reason.to_string());
                scan.ended_at = Some(now);
                report.scans += 1;
            }
        }
        Ok(report)
    }
}

// ============================================================================
// Fingerprints
// ============================================================================

/// Fingerprint cache held in process memory.
#[derive(Default)]
pub struct MemoryFingerprints {
    roots: DashMap<String, Arc<HashMap<String, CacheEntry>>>,
}

impl MemoryFingerprints {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FingerprintStore for MemoryFingerprints {
    async fn load_root(&self, root_key: &str) -> Result<HashMap<String, CacheEntry>> {
        Ok(self
            .roots
            .get(root_key)
            .map(|entries| entries.value().as_ref().clone())
            .unwrap_or_default())
    }

    async fn replace_root(&self, root_key: &str, entries: Vec<CacheEntry>) -> Result<()> {
        let map = entries
            .into_iter()
            .map(|entry| (entry.row.path.clone(), entry))
            .collect::<HashMap<_, _>>();
        self.roots.insert(root_key.to_string(), Arc::new(map));
        Ok(())
    }
}
