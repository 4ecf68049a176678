//! In-process graph store.
//!
//! Same merge semantics as the Neo4j adapter, used by tests and by
//! deployments that only want the index plus commit bookkeeping.

use super::{GraphCounts, GraphError, GraphResult, GraphStore, WriteStats};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use treeline_protocol::{EntryKind, IndexRow, ScanId, ScanRecord};

type NodeKey = (ScanId, String);

struct Node {
    kind: EntryKind,
    /// SCANNED_IN targets
    scans: BTreeSet<ScanId>,
}

#[derive(Default)]
struct GraphState {
    scans: HashSet<ScanId>,
    nodes: HashMap<NodeKey, Node>,
    /// CONTAINS edges, parent -> child
    contains: HashSet<(NodeKey, NodeKey)>,
}

#[derive(Default)]
pub struct MemoryGraph {
    state: Mutex<GraphState>,
    failure: Mutex<Option<GraphError>>,
}

impl MemoryGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with `failure` (or succeed again with `None`).
    pub fn set_failure(&self, failure: Option<GraphError>) {
        *self.failure.lock() = failure;
    }

    fn check(&self) -> GraphResult<()> {
        match self.failure.lock().clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn has_scan(&self, scan_id: &ScanId) -> bool {
        self.state.lock().scans.contains(scan_id)
    }

    pub fn node_count(&self) -> usize {
        self.state.lock().nodes.len()
    }

    /// CONTAINS plus SCANNED_IN edges.
    pub fn edge_count(&self) -> usize {
        let state = self.state.lock();
        state.contains.len() + state.nodes.values().map(|n| n.scans.len()).sum::<usize>()
    }

    pub fn contains_edge(&self, scan_id: &ScanId, parent: &str, child: &str) -> bool {
        let key = (
            (scan_id.clone(), parent.to_string()),
            (scan_id.clone(), child.to_string()),
        );
        self.state.lock().contains.contains(&key)
    }

    pub fn scanned_in_edges(&self, scan_id: &ScanId) -> usize {
        self.state
            .lock()
            .nodes
            .values()
            .filter(|n| n.scans.contains(scan_id))
            .count()
    }

    fn merge_rows(&self, scan_id: &ScanId, rows: &[IndexRow], kind: EntryKind) -> GraphResult<WriteStats> {
        self.check()?;
        let mut state = self.state.lock();
        if !state.scans.contains(scan_id) {
            return Err(GraphError::Query(format!("scan node {} does not exist", scan_id)));
        }

        let mut stats = WriteStats::default();
        for row in rows {
            let key = (scan_id.clone(), row.path.clone());
            let node = state.nodes.entry(key.clone()).or_insert_with(|| {
                stats.nodes_created += 1;
                Node {
                    kind,
                    scans: BTreeSet::new(),
                }
            });
            if node.scans.insert(scan_id.clone()) {
                stats.relationships_created += 1;
            }

            if let Some(parent) = &row.parent_path {
                let parent_key = (scan_id.clone(), parent.clone());
                let parent_is_folder = state
                    .nodes
                    .get(&parent_key)
                    .map_or(false, |n| n.kind == EntryKind::Folder);
                if parent_is_folder && state.contains.insert((parent_key, key)) {
                    stats.relationships_created += 1;
                }
            }
        }
        Ok(stats)
    }
}

#[async_trait]
impl GraphStore for MemoryGraph {
    async fn ensure_schema(&self) -> GraphResult<()> {
        self.check()
    }

    async fn merge_scan(&self, scan: &ScanRecord) -> GraphResult<WriteStats> {
        self.check()?;
        let created = self.state.lock().scans.insert(scan.id.clone());
        Ok(WriteStats {
            nodes_created: u64::from(created),
            ..Default::default()
        })
    }

    async fn merge_folders(&self, scan_id: &ScanId, folders: &[IndexRow]) -> GraphResult<WriteStats> {
        self.merge_rows(scan_id, folders, EntryKind::Folder)
    }

    async fn merge_files(&self, scan_id: &ScanId, files: &[IndexRow]) -> GraphResult<WriteStats> {
        self.merge_rows(scan_id, files, EntryKind::File)
    }

    async fn count_scan(&self, scan_id: &ScanId) -> GraphResult<GraphCounts> {
        self.check()?;
        let state = self.state.lock();
        let mut counts = GraphCounts::default();
        for node in state.nodes.values().filter(|n| n.scans.contains(scan_id)) {
            match node.kind {
                EntryKind::File => counts.files += 1,
                EntryKind::Folder => counts.folders += 1,
            }
        }
        Ok(counts)
    }

    async fn delete_scan(&self, scan_id: &ScanId) -> GraphResult<WriteStats> {
        self.check()?;
        let mut state = self.state.lock();
        let mut stats = WriteStats::default();

        let mut orphaned = HashSet::new();
        for (key, node) in state.nodes.iter_mut() {
            if node.scans.remove(scan_id) {
                stats.relationships_deleted += 1;
                if node.scans.is_empty() {
                    orphaned.insert(key.clone());
                }
            }
        }

        state.nodes.retain(|key, _| !orphaned.contains(key));
        stats.nodes_deleted += orphaned.len() as u64;

        let before = state.contains.len();
        state
            .contains
            .retain(|(parent, child)| !orphaned.contains(parent) && !orphaned.contains(child));
        stats.relationships_deleted += (before - state.contains.len()) as u64;

        if state.scans.remove(scan_id) {
            stats.nodes_deleted += 1;
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(scan: &ScanId, path: &str, parent: Option<&str>, kind: EntryKind) -> IndexRow {
        IndexRow {
            scan_id: scan.clone(),
            path: path.to_string(),
            parent_path: parent.map(str::to_string),
            name: path.rsplit('/').next().unwrap_or(path).to_string(),
            depth: path.matches('/').count() as u32 - 1,
            kind,
            size: 0,
            modified_time: None,
            extension: None,
            mime_type: None,
            fingerprint: None,
            synthesized: false,
        }
    }

    #[tokio::test]
    async fn test_merges_are_idempotent() {
        let graph = MemoryGraph::new();
        let scan = ScanRecord::start("local", "/r", true);
        let id = scan.id.clone();
        let folders = vec![
            row(&id, "/r", None, EntryKind::Folder),
            row(&id, "/r/sub", Some("/r"), EntryKind::Folder),
        ];
        let files = vec![row(&id, "/r/sub/a.txt", Some("/r/sub"), EntryKind::File)];

        for attempt in 0..2 {
            let scan_stats = graph.merge_scan(&scan).await.unwrap();
            let f = graph.merge_folders(&id, &folders).await.unwrap();
            let r = graph.merge_files(&id, &files).await.unwrap();
            if attempt == 0 {
                assert_eq!(scan_stats.nodes_created, 1);
                assert_eq!(f.nodes_created, 2);
                assert_eq!(f.relationships_created + r.relationships_created, 5);
            } else {
                assert_eq!(f.relationships_created + r.relationships_created, 0);
            }
        }

        assert_eq!(graph.node_count(), 3);
        assert_eq!(graph.edge_count(), 5);
        assert!(graph.contains_edge(&id, "/r", "/r/sub"));
        let counts = graph.count_scan(&id).await.unwrap();
        assert_eq!((counts.files, counts.folders), (1, 2));
    }

    #[tokio::test]
    async fn test_delete_removes_scan_subgraph_only() {
        let graph = MemoryGraph::new();
        let keep = ScanRecord::start("local", "/r", true);
        let gone = ScanRecord::start("local", "/r", true);
        for scan in [&keep, &gone] {
            graph.merge_scan(scan).await.unwrap();
            graph
                .merge_folders(&scan.id, &[row(&scan.id, "/r", None, EntryKind::Folder)])
                .await
                .unwrap();
            graph
                .merge_files(&scan.id, &[row(&scan.id, "/r/a.txt", Some("/r"), EntryKind::File)])
                .await
                .unwrap();
        }

        let stats = graph.delete_scan(&gone.id).await.unwrap();
        assert_eq!(stats.nodes_deleted, 3);
        assert!(!graph.has_scan(&gone.id));
        assert_eq!(graph.scanned_in_edges(&gone.id), 0);
        assert!(graph.has_scan(&keep.id));
        assert_eq!(graph.count_scan(&keep.id).await.unwrap().files, 1);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let graph = MemoryGraph::new();
        graph.set_failure(Some(GraphError::Unavailable("down".to_string())));
        assert!(matches!(
            graph.ensure_schema().await,
            Err(GraphError::Unavailable(_))
        ));
        graph.set_failure(None);
        assert!(graph.ensure_schema().await.is_ok());
    }
}
