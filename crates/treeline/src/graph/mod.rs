//! Graph store seam and the commit protocol built on it.
//!
//! A committed scan becomes a `Scan` node, one `Folder`/`File` node per
//! index row keyed by `(scan_id, path)`, `CONTAINS` edges from each parent
//! folder to its children, and `SCANNED_IN` edges from every node to the
//! Scan node.

mod commit;
mod memory;
mod neo4j;

pub use commit::CommitProtocol;
pub use memory::MemoryGraph;
pub use neo4j::Neo4jGraph;

use crate::config::GraphConfig;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use treeline_protocol::{IndexRow, ScanId, ScanRecord};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    /// Connection refused, timed out, or the server is restarting
    #[error("Graph store unavailable: {0}")]
    Unavailable(String),

    #[error("Graph store rejected credentials: {0}")]
    Auth(String),

    #[error("Graph query failed: {0}")]
    Query(String),
}

/// Counters returned by a write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteStats {
    pub nodes_created: u64,
    pub nodes_deleted: u64,
    pub relationships_created: u64,
    pub relationships_deleted: u64,
}

impl WriteStats {
    pub fn merge(&mut self, other: WriteStats) {
        self.nodes_created += other.nodes_created;
        self.nodes_deleted += other.nodes_deleted;
        self.relationships_created += other.relationships_created;
        self.relationships_deleted += other.relationships_deleted;
    }
}

/// Nodes linked to a Scan node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GraphCounts {
    pub files: u64,
    pub folders: u64,
}

pub type GraphResult<T> = std::result::Result<T, GraphError>;

/// Bulk graph writes. Every write is match-or-create, so replaying a batch
/// never duplicates nodes or edges.
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Create constraints and indexes if they are missing.
    async fn ensure_schema(&self) -> GraphResult<()>;

    async fn merge_scan(&self, scan: &ScanRecord) -> GraphResult<WriteStats>;

    /// Folder rows, parents before children.
    async fn merge_folders(&self, scan_id: &ScanId, folders: &[IndexRow]) -> GraphResult<WriteStats>;

    async fn merge_files(&self, scan_id: &ScanId, files: &[IndexRow]) -> GraphResult<WriteStats>;

    async fn count_scan(&self, scan_id: &ScanId) -> GraphResult<GraphCounts>;

    /// Remove the Scan node, its edges, and nodes no other scan references.
    async fn delete_scan(&self, scan_id: &ScanId) -> GraphResult<WriteStats>;
}

/// Build the configured graph store, if any.
pub fn from_config(config: &GraphConfig, timeout: Duration) -> Result<Option<Arc<dyn GraphStore>>, GraphError> {
    match config {
        GraphConfig::Disabled => Ok(None),
        GraphConfig::Memory => Ok(Some(Arc::new(MemoryGraph::new()))),
        GraphConfig::Neo4j {
            url,
            user,
            password,
            database,
        } => Ok(Some(Arc::new(Neo4jGraph::new(
            url, user, password, database, timeout,
        )?))),
    }
}
