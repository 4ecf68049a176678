//! Core types shared by the index store, the scheduler and the commit protocol.
//!
//! Everything here is plain data: records are created and mutated by the
//! engine and handed to readers as snapshot copies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

// ============================================================================
// Identifiers
// ============================================================================

/// Unique scan identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScanId(pub String);

impl ScanId {
    /// Create a new random scan ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ScanId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ScanId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for ScanId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Unique task identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub String);

impl TaskId {
    /// Create a new random task ID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Create from an existing string
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for TaskId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Provider Listing
// ============================================================================

/// One normalized entry reported by a storage provider.
///
/// `path` is absolute and provider-qualified (`/data/x.csv`,
/// `remote:bucket/x.csv`). Providers may omit any intermediate folders.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderEntry {
    pub path: String,
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified_time: Option<DateTime<Utc>>,
    /// Provider-supplied content hash or etag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    /// Provider-supplied MIME type (takes precedence over extension guessing)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

// ============================================================================
// Index Rows
// ============================================================================

/// Kind of an index row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Folder,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Folder => "folder",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "file" => Some(Self::File),
            "folder" | "dir" | "directory" => Some(Self::Folder),
            _ => None,
        }
    }

    /// Listing rank: folders sort before files.
    pub fn sort_rank(&self) -> u8 {
        match self {
            Self::Folder => 0,
            Self::File => 1,
        }
    }

    pub fn from_sort_rank(rank: u8) -> Option<Self> {
        match rank {
            0 => Some(Self::Folder),
            1 => Some(Self::File),
            _ => None,
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One file or folder in a scan's hierarchy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexRow {
    pub scan_id: ScanId,
    /// Absolute, provider-qualified path
    pub path: String,
    /// `None` only for the scan root
    pub parent_path: Option<String>,
    pub name: String,
    /// Distance from the scan root (root = 0)
    pub depth: u32,
    #[serde(rename = "type")]
    pub kind: EntryKind,
    pub size: u64,
    pub modified_time: Option<DateTime<Utc>>,
    pub extension: Option<String>,
    pub mime_type: Option<String>,
    /// Provider etag/hash, if one was supplied
    pub fingerprint: Option<String>,
    /// True when the row was inferred to close a gap in the hierarchy
    #[serde(default)]
    pub synthesized: bool,
}

impl IndexRow {
    pub fn is_folder(&self) -> bool {
        self.kind == EntryKind::Folder
    }

    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    /// Deterministic listing key: folders first, then by name, ties by path.
    pub fn sort_key(&self) -> RowSortKey {
        RowSortKey {
            rank: self.kind.sort_rank(),
            name: self.name.clone(),
            path: self.path.clone(),
        }
    }

    /// Re-home a row into another scan (cache copy-forward).
    pub fn with_scan(mut self, scan_id: &ScanId) -> Self {
        self.scan_id = scan_id.clone();
        self
    }
}

/// Sort key used for child listings and continuation tokens.
///
/// Field order matters: the derived `Ord` compares rank, then name, then path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowSortKey {
    pub rank: u8,
    pub name: String,
    pub path: String,
}

/// File/folder totals for one scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowCounts {
    pub files: u64,
    pub folders: u64,
}

// ============================================================================
// Scan Records
// ============================================================================

/// Scan lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanStatus {
    Running,
    Completed,
    Error,
    Canceled,
}

impl ScanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "error" => Some(Self::Error),
            "canceled" | "cancelled" => Some(Self::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Persistent record of one scan of one root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRecord {
    pub id: ScanId,
    pub provider_id: String,
    pub root_path: String,
    pub recursive: bool,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: ScanStatus,
    pub file_count: u64,
    pub folder_count: u64,
    pub committed: bool,
    pub committed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub cache_hits: u64,
    #[serde(default)]
    pub cache_misses: u64,
    #[serde(default)]
    pub synthesized_folders: u64,
}

impl ScanRecord {
    /// New running scan record
    pub fn start(provider_id: impl Into<String>, root_path: impl Into<String>, recursive: bool) -> Self {
        Self {
            id: ScanId::new(),
            provider_id: provider_id.into(),
            root_path: root_path.into(),
            recursive,
            started_at: Utc::now(),
            ended_at: None,
            status: ScanStatus::Running,
            file_count: 0,
            folder_count: 0,
            committed: false,
            committed_at: None,
            error: None,
            cache_hits: 0,
            cache_misses: 0,
            synthesized_folders: 0,
        }
    }

    /// Move to a terminal status. Returns false if already terminal.
    pub fn finish(&mut self, status: ScanStatus, error: Option<String>) -> bool {
        if self.status.is_terminal() || !status.is_terminal() {
            return false;
        }
        self.status = status;
        self.error = error;
        self.ended_at = Some(Utc::now());
        true
    }

    pub fn is_committable(&self) -> bool {
        self.status == ScanStatus::Completed
    }
}

// ============================================================================
// Tasks
// ============================================================================

/// Task kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Scan,
    Commit,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scan => "scan",
            Self::Commit => "commit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "scan" => Some(Self::Scan),
            "commit" => Some(Self::Commit),
            _ => None,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Completed,
    Error,
    Canceled,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Error => "error",
            Self::Canceled => "canceled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "error" => Some(Self::Error),
            "canceled" | "cancelled" => Some(Self::Canceled),
            _ => None,
        }
    }

    /// Check if the task is terminal (completed, error, or canceled)
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error | Self::Canceled)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A long-running scan or commit job.
///
/// Transition methods are no-ops once the task is terminal, so a late
/// writer can never move a finished task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: TaskId,
    pub kind: TaskKind,
    pub status: TaskStatus,
    /// 0.0 to 1.0; only a completed task reaches 1.0
    pub progress: f64,
    pub processed: u64,
    /// Estimated total items, if known
    pub total: Option<u64>,
    pub status_message: Option<String>,
    pub eta_seconds: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// Set once the scan is known to be valid for downstream use
    pub scan_id: Option<ScanId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Task {
    /// Create a new queued task
    pub fn new(kind: TaskKind) -> Self {
        Self {
            task_id: TaskId::new(),
            kind,
            status: TaskStatus::Queued,
            progress: 0.0,
            processed: 0,
            total: None,
            status_message: None,
            eta_seconds: None,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            scan_id: None,
            error: None,
        }
    }

    /// Transition queued -> running
    pub fn start(&mut self) -> bool {
        if self.status != TaskStatus::Queued {
            return false;
        }
        self.status = TaskStatus::Running;
        self.started_at = Some(Utc::now());
        true
    }

    /// Transition running -> completed
    pub fn complete(&mut self) -> bool {
        if self.status != TaskStatus::Running {
            return false;
        }
        self.status = TaskStatus::Completed;
        self.progress = 1.0;
        self.eta_seconds = None;
        self.ended_at = Some(Utc::now());
        true
    }

    /// Transition to error from any non-terminal state
    pub fn fail(&mut self, error: impl Into<String>) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = TaskStatus::Error;
        self.error = Some(error.into());
        self.eta_seconds = None;
        self.ended_at = Some(Utc::now());
        true
    }

    /// Transition to canceled from any non-terminal state
    pub fn cancel(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = TaskStatus::Canceled;
        self.progress = self.progress.min(0.99);
        self.eta_seconds = None;
        self.ended_at = Some(Utc::now());
        true
    }
}

// ============================================================================
// Commit Outcomes
// ============================================================================

/// Result of one commit attempt of a scan into the graph store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommitOutcome {
    pub scan_id: ScanId,
    pub files_in_scan: u64,
    #[serde(default)]
    pub folders_in_scan: u64,
    /// Files found linked to the Scan node after the write
    pub matched_in_graph: u64,
    /// Relationships created by this attempt (0 on an idempotent re-commit)
    pub linked_edges_added: u64,
    pub neo4j_attempted: bool,
    pub neo4j_db_verified: bool,
    pub neo4j_db_files: u64,
    pub neo4j_db_folders: u64,
    pub neo4j_error: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

impl CommitOutcome {
    /// Outcome for an attempt that never reached the graph store.
    pub fn not_attempted(scan_id: ScanId, counts: RowCounts, reason: impl Into<String>) -> Self {
        Self {
            scan_id,
            files_in_scan: counts.files,
            folders_in_scan: counts.folders,
            matched_in_graph: 0,
            linked_edges_added: 0,
            neo4j_attempted: false,
            neo4j_db_verified: false,
            neo4j_db_files: 0,
            neo4j_db_folders: 0,
            neo4j_error: Some(reason.into()),
            attempted_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_lifecycle() {
        let mut task = Task::new(TaskKind::Scan);
        assert_eq!(task.status, TaskStatus::Queued);

        assert!(task.start());
        assert_eq!(task.status, TaskStatus::Running);
        assert!(task.started_at.is_some());

        assert!(task.complete());
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 1.0);
    }

    #[test]
    fn test_terminal_states_are_final() {
        let mut task = Task::new(TaskKind::Commit);
        task.start();
        task.progress = 0.5;
        assert!(task.cancel());

        assert!(!task.complete());
        assert!(!task.fail("late error"));
        assert!(!task.start());
        assert_eq!(task.status, TaskStatus::Canceled);
        assert!(task.progress < 1.0);
        assert!(task.error.is_none());
    }

    #[test]
    fn test_cancel_caps_progress() {
        let mut task = Task::new(TaskKind::Scan);
        task.start();
        task.progress = 1.0;
        task.cancel();
        assert!(task.progress < 1.0);
    }

    #[test]
    fn test_sort_key_orders_folders_first() {
        let scan = ScanId::from_string("s");
        let folder = IndexRow {
            scan_id: scan.clone(),
            path: "/r/zeta".to_string(),
            parent_path: Some("/r".to_string()),
            name: "zeta".to_string(),
            depth: 1,
            kind: EntryKind::Folder,
            size: 0,
            modified_time: None,
            extension: None,
            mime_type: None,
            fingerprint: None,
            synthesized: false,
        };
        let file = IndexRow {
            path: "/r/alpha.txt".to_string(),
            name: "alpha.txt".to_string(),
            kind: EntryKind::File,
            ..folder.clone()
        };
        assert!(folder.sort_key() < file.sort_key());
    }

    #[test]
    fn test_index_row_serializes_kind_as_type() {
        let row = IndexRow {
            scan_id: ScanId::from_string("s"),
            path: "/r/a.txt".to_string(),
            parent_path: Some("/r".to_string()),
            name: "a.txt".to_string(),
            depth: 1,
            kind: EntryKind::File,
            size: 3,
            modified_time: None,
            extension: Some("txt".to_string()),
            mime_type: None,
            fingerprint: None,
            synthesized: false,
        };
        let json = serde_json::to_value(&row).unwrap();
        assert_eq!(json["type"], "file");
        assert_eq!(json["scan_id"], "s");
    }

    #[test]
    fn test_scan_record_finish_once() {
        let mut record = ScanRecord::start("local", "/data", true);
        assert!(record.finish(ScanStatus::Canceled, None));
        assert!(!record.finish(ScanStatus::Completed, None));
        assert_eq!(record.status, ScanStatus::Canceled);
        assert!(!record.is_committable());
    }
}
