//! Shared fixtures for the engine integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use filetime::FileTime;
use std::fs;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use treeline::protocol::paths::path_to_forward_slashes;
use treeline::graph::{GraphCounts, GraphResult, WriteStats};
use treeline::protocol::{IndexRow, ProviderEntry, ScanId, ScanRecord, Task, TaskId, TaskStatus};
use treeline::{
    Catalog, CancellationToken, Engine, EngineConfig, EntrySink, GraphStore, ListingStats,
    MemoryGraph, Provider, ProviderError, ProviderRegistry,
};

/// Every fixture file gets this modification time.
pub const PINNED_MTIME: i64 = 1_700_000_000;

// ============================================================================
// Scratch trees
// ============================================================================

pub struct TestTree {
    pub dir: TempDir,
    pub root: String,
}

impl TestTree {
    /// Create `files` (relative, `/`-separated) under a fresh temp dir.
    pub fn new(files: &[&str]) -> Self {
        let dir = TempDir::new().unwrap();
        for rel in files {
            let path = dir.path().join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, format!("contents of {}", rel)).unwrap();
            filetime::set_file_mtime(&path, FileTime::from_unix_time(PINNED_MTIME, 0)).unwrap();
        }
        let root = path_to_forward_slashes(dir.path());
        Self { dir, root }
    }

    pub fn path(&self, rel: &str) -> String {
        format!("{}/{}", self.root, rel)
    }
}

// ============================================================================
// Engines
// ============================================================================

pub fn engine_with(
    config: EngineConfig,
    graph: Option<Arc<MemoryGraph>>,
    extra: Vec<Arc<dyn Provider>>,
) -> Engine {
    let config = Arc::new(config);
    let mut providers = ProviderRegistry::from_config(&config).unwrap();
    for provider in extra {
        providers.register(provider).unwrap();
    }
    let graph = graph.map(|g| g as Arc<dyn GraphStore>);
    Engine::with_parts(config, Catalog::in_memory(), providers, graph)
}

pub fn engine(graph: Option<Arc<MemoryGraph>>) -> Engine {
    engine_with(EngineConfig::default(), graph, Vec::new())
}

/// Engine over any graph store, local provider only.
pub fn engine_on(config: EngineConfig, graph: Arc<dyn GraphStore>) -> Engine {
    let config = Arc::new(config);
    let providers = ProviderRegistry::from_config(&config).unwrap();
    Engine::with_parts(config, Catalog::in_memory(), providers, Some(graph))
}

/// Run a scan with `provider` to completion and return its scan id.
pub async fn scan_with(engine: &Engine, provider: &str, root: &str, recursive: bool) -> ScanId {
    let task_id = engine.start_scan(provider, root, recursive).await.unwrap();
    let task = engine.wait_task(&task_id).await.unwrap();
    assert_eq!(
        task.status,
        TaskStatus::Completed,
        "scan failed: {:?}",
        task.error
    );
    task.scan_id.expect("completed scan task carries its scan id")
}

pub async fn scan(engine: &Engine, root: &str, recursive: bool) -> ScanId {
    scan_with(engine, "local", root, recursive).await
}

/// Poll until the task reports at least `items` processed.
pub async fn wait_for_progress(engine: &Engine, task_id: &TaskId, items: u64) -> Task {
    for _ in 0..500 {
        let task = engine.get_task(task_id).await.unwrap();
        if task.processed >= items || task.status.is_terminal() {
            return task;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("task {} made no progress", task_id);
}

// ============================================================================
// Scripted providers
// ============================================================================

pub fn file_entry(path: &str, size: u64) -> ProviderEntry {
    ProviderEntry {
        path: path.to_string(),
        name: path.rsplit('/').next().unwrap_or(path).to_string(),
        is_dir: false,
        size,
        modified_time: None,
        etag: Some(format!("md5:{:x}", size)),
        mime_type: None,
    }
}

/// Lists a fixed set of entries, like an object store that never reports
/// intermediate folders.
pub struct ScriptedProvider {
    pub id: String,
    pub entries: Vec<ProviderEntry>,
}

impl Provider for ScriptedProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn list_entries(
        &self,
        _root: &str,
        _recursive: bool,
        sink: &mut EntrySink,
        _stop: &CancellationToken,
    ) -> Result<ListingStats, ProviderError> {
        for entry in &self.entries {
            if !sink.push(entry.clone()) {
                break;
            }
        }
        Ok(ListingStats {
            entries: self.entries.len() as u64,
            skipped: 0,
        })
    }
}

/// Emits `count` files slowly until stopped.
pub struct SlowProvider {
    pub id: String,
    pub count: u64,
    pub delay: Duration,
}

impl Provider for SlowProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn list_entries(
        &self,
        root: &str,
        _recursive: bool,
        sink: &mut EntrySink,
        stop: &CancellationToken,
    ) -> Result<ListingStats, ProviderError> {
        let mut stats = ListingStats::default();
        for i in 0..self.count {
            if stop.is_cancelled() {
                break;
            }
            if !sink.push(file_entry(&format!("{}/f{:05}.bin", root, i), i)) {
                break;
            }
            if !sink.flush() {
                break;
            }
            stats.entries += 1;
            std::thread::sleep(self.delay);
        }
        Ok(stats)
    }

    fn estimate_total(
        &self,
        _root: &str,
        _recursive: bool,
        _stop: &CancellationToken,
    ) -> Result<Option<u64>, ProviderError> {
        Ok(Some(self.count))
    }
}

pub fn slow_engine(max_tasks: usize) -> Engine {
    let config = EngineConfig {
        max_concurrent_tasks: max_tasks,
        batch_size: 1,
        ..Default::default()
    };
    let slow: Arc<dyn Provider> = Arc::new(SlowProvider {
        id: "slow".to_string(),
        count: 100_000,
        delay: Duration::from_millis(5),
    });
    engine_with(config, None, vec![slow])
}

// ============================================================================
// Slow graph store
// ============================================================================

/// A [`MemoryGraph`] whose batch writes each take `delay`.
pub struct SlowGraph {
    pub inner: Arc<MemoryGraph>,
    pub delay: Duration,
}

#[async_trait]
impl GraphStore for SlowGraph {
    async fn ensure_schema(&self) -> GraphResult<()> {
        self.inner.ensure_schema().await
    }

    async fn merge_scan(&self, scan: &ScanRecord) -> GraphResult<WriteStats> {
        self.inner.merge_scan(scan).await
    }

    async fn merge_folders(&self, scan_id: &ScanId, folders: &[IndexRow]) -> GraphResult<WriteStats> {
        tokio::time::sleep(self.delay).await;
        self.inner.merge_folders(scan_id, folders).await
    }

    async fn merge_files(&self, scan_id: &ScanId, files: &[IndexRow]) -> GraphResult<WriteStats> {
        tokio::time::sleep(self.delay).await;
        self.inner.merge_files(scan_id, files).await
    }

    async fn count_scan(&self, scan_id: &ScanId) -> GraphResult<GraphCounts> {
        self.inner.count_scan(scan_id).await
    }

    async fn delete_scan(&self, scan_id: &ScanId) -> GraphResult<WriteStats> {
        self.inner.delete_scan(scan_id).await
    }
}
