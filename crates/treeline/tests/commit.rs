//! Graph commit through the engine: idempotence, failure reporting, gating.

mod common;

use async_trait::async_trait;
use common::*;
use std::sync::Arc;
use std::time::Duration;
use treeline::graph::{GraphCounts, GraphResult, WriteStats};
use treeline::protocol::{IndexRow, ScanId, ScanRecord, ScanStatus, TaskKind, TaskStatus};
use treeline::{Catalog, Engine, EngineConfig, EngineError, GraphError, GraphStore, MemoryGraph, ProviderRegistry};

#[tokio::test(flavor = "multi_thread")]
async fn test_recommit_is_idempotent() {
    let tree = TestTree::new(&["a.txt", "sub/b.txt", "sub/c.txt"]);
    let graph = Arc::new(MemoryGraph::new());
    let engine = engine(Some(graph.clone()));
    let scan_id = scan(&engine, &tree.root, true).await;

    let first = engine.commit(&scan_id).await.unwrap();
    let nodes = graph.node_count();
    let edges = graph.edge_count();
    assert!(first.neo4j_db_verified);
    assert!(first.linked_edges_added > 0);

    let second = engine.commit(&scan_id).await.unwrap();
    assert!(second.neo4j_db_verified);
    assert_eq!(second.linked_edges_added, 0);
    assert_eq!(
        (second.neo4j_db_files, second.neo4j_db_folders),
        (first.neo4j_db_files, first.neo4j_db_folders)
    );
    assert_eq!(graph.node_count(), nodes);
    assert_eq!(graph.edge_count(), edges);

    assert_eq!(engine.last_commit(&scan_id).await.unwrap(), Some(second));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unavailable_graph_is_reported_on_the_outcome() {
    let tree = TestTree::new(&["a.txt"]);
    let graph = Arc::new(MemoryGraph::new());
    let engine = engine(Some(graph.clone()));
    let scan_id = scan(&engine, &tree.root, true).await;

    graph.set_failure(Some(GraphError::Unavailable("connection refused".to_string())));
    let outcome = engine.commit(&scan_id).await.unwrap();
    assert!(outcome.neo4j_attempted);
    assert!(!outcome.neo4j_db_verified);
    assert!(outcome.neo4j_error.unwrap().contains("unavailable"));
    assert_eq!(outcome.files_in_scan, 1);
    assert!(!engine.get_scan(&scan_id).await.unwrap().committed);

    graph.set_failure(None);
    let retried = engine.commit(&scan_id).await.unwrap();
    assert!(retried.neo4j_db_verified);
    assert!(engine.get_scan(&scan_id).await.unwrap().committed);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_disabled_graph_records_not_attempted() {
    let tree = TestTree::new(&["a.txt"]);
    let engine = engine(None);
    let scan_id = scan(&engine, &tree.root, true).await;

    let outcome = engine.commit(&scan_id).await.unwrap();
    assert!(!outcome.neo4j_attempted);
    assert!(!outcome.neo4j_db_verified);
    assert_eq!(outcome.files_in_scan, 1);
    assert!(!engine.get_scan(&scan_id).await.unwrap().committed);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_only_completed_scans_are_committable() {
    let graph = Arc::new(MemoryGraph::new());
    let engine = engine(Some(graph.clone()));

    assert!(matches!(
        engine.commit(&ScanId::from_string("missing")).await,
        Err(EngineError::ScanNotFound(_))
    ));

    let mut failed = ScanRecord::start("local", "/data", true);
    failed.finish(ScanStatus::Error, Some("provider went away".to_string()));
    engine.catalog().ledger.put_scan(&failed).await.unwrap();

    match engine.start_commit(&failed.id).await {
        Err(EngineError::ScanNotCommittable { status, .. }) => assert_eq!(status, ScanStatus::Error),
        other => panic!("expected ScanNotCommittable, got {:?}", other.map(|_| ())),
    }
    assert!(!graph.has_scan(&failed.id));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_commit_task_reports_phases_and_scan() {
    let tree = TestTree::new(&["a.txt", "sub/b.txt"]);
    let graph = Arc::new(MemoryGraph::new());
    let engine = engine(Some(graph.clone()));
    let scan_id = scan(&engine, &tree.root, true).await;

    let task_id = engine.start_commit(&scan_id).await.unwrap();
    let task = engine.wait_task(&task_id).await.unwrap();
    assert_eq!(task.kind, TaskKind::Commit);
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.scan_id.as_ref(), Some(&scan_id));
    assert_eq!(task.progress, 1.0);
    assert_eq!(task.total, Some(4));

    let outcome = engine.last_commit(&scan_id).await.unwrap().unwrap();
    assert!(outcome.neo4j_db_verified);
    assert!(graph.has_scan(&scan_id));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_auto_commit_follows_a_completed_scan() {
    let tree = TestTree::new(&["a.txt"]);
    let graph = Arc::new(MemoryGraph::new());
    let config = EngineConfig {
        auto_commit: true,
        ..Default::default()
    };
    let engine = engine_with(config, Some(graph.clone()), Vec::new());
    let scan_id = scan(&engine, &tree.root, true).await;

    for _ in 0..200 {
        if engine.get_scan(&scan_id).await.unwrap().committed {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(engine.get_scan(&scan_id).await.unwrap().committed);
    assert!(graph.has_scan(&scan_id));

    let kinds: Vec<TaskKind> = engine
        .list_tasks()
        .await
        .unwrap()
        .iter()
        .map(|t| t.kind)
        .collect();
    assert_eq!(kinds, vec![TaskKind::Commit, TaskKind::Scan]);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_scan_cannot_be_deleted_while_a_commit_writes() {
    let tree = TestTree::new(&["a.txt", "sub/b.txt"]);
    let graph = Arc::new(MemoryGraph::new());
    let slow = Arc::new(SlowGraph {
        inner: graph.clone(),
        delay: Duration::from_millis(500),
    });
    let engine = engine_on(EngineConfig::default(), slow);
    let scan_id = scan(&engine, &tree.root, true).await;

    let committing = {
        let engine = engine.clone();
        let scan_id = scan_id.clone();
        tokio::spawn(async move { engine.commit(&scan_id).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert!(matches!(
        engine.delete_scan(&scan_id).await,
        Err(EngineError::ScanBusy(_))
    ));
    assert!(matches!(
        engine.start_commit(&scan_id).await,
        Err(EngineError::ScanBusy(_))
    ));

    let outcome = committing.await.unwrap().unwrap();
    assert!(outcome.neo4j_db_verified);
    assert!(engine.get_scan(&scan_id).await.unwrap().committed);

    engine.delete_scan(&scan_id).await.unwrap();
    assert!(!graph.has_scan(&scan_id));
    assert_eq!(graph.node_count(), 0);
    assert!(matches!(
        engine.get_scan(&scan_id).await,
        Err(EngineError::ScanNotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_canceled_commit_is_recorded_and_retracted_on_delete() {
    let tree = TestTree::new(&["a.txt", "b.txt", "c.txt", "sub/d.txt", "sub/e.txt"]);
    let graph = Arc::new(MemoryGraph::new());
    let slow = Arc::new(SlowGraph {
        inner: graph.clone(),
        delay: Duration::from_millis(200),
    });
    let config = EngineConfig {
        graph_batch_size: 1,
        ..Default::default()
    };
    let engine = engine_on(config, slow);
    let scan_id = scan(&engine, &tree.root, true).await;

    let task_id = engine.start_commit(&scan_id).await.unwrap();
    wait_for_progress(&engine, &task_id, 1).await;
    assert!(engine.cancel_task(&task_id));
    let task = engine.wait_task(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Canceled);
    assert!(graph.has_scan(&scan_id));

    let outcome = engine.last_commit(&scan_id).await.unwrap().unwrap();
    assert!(outcome.neo4j_attempted);
    assert!(!outcome.neo4j_db_verified);
    assert_eq!(outcome.neo4j_error.as_deref(), Some("canceled"));
    assert!(!engine.get_scan(&scan_id).await.unwrap().committed);

    engine.delete_scan(&scan_id).await.unwrap();
    assert!(!graph.has_scan(&scan_id));
    assert_eq!(graph.node_count(), 0);
}

// ============================================================================
// Slow graph store
// ============================================================================

/// Never answers the schema call within the configured timeout.
struct StalledGraph;

#[async_trait]
impl GraphStore for StalledGraph {
    async fn ensure_schema(&self) -> GraphResult<()> {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(())
    }

    async fn merge_scan(&self, _scan: &ScanRecord) -> GraphResult<WriteStats> {
        Ok(WriteStats::default())
    }

    async fn merge_folders(&self, _scan_id: &ScanId, _folders: &[IndexRow]) -> GraphResult<WriteStats> {
        Ok(WriteStats::default())
    }

    async fn merge_files(&self, _scan_id: &ScanId, _files: &[IndexRow]) -> GraphResult<WriteStats> {
        Ok(WriteStats::default())
    }

    async fn count_scan(&self, _scan_id: &ScanId) -> GraphResult<GraphCounts> {
        Ok(GraphCounts::default())
    }

    async fn delete_scan(&self, _scan_id: &ScanId) -> GraphResult<WriteStats> {
        Ok(WriteStats::default())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_graph_timeout_fails_the_task_and_is_recorded() {
    let tree = TestTree::new(&["a.txt"]);
    let config = Arc::new(EngineConfig {
        graph_timeout_secs: 1,
        ..Default::default()
    });
    let providers = ProviderRegistry::from_config(&config).unwrap();
    let engine = Engine::with_parts(
        config,
        Catalog::in_memory(),
        providers,
        Some(Arc::new(StalledGraph)),
    );
    let scan_id = scan(&engine, &tree.root, true).await;

    let task_id = engine.start_commit(&scan_id).await.unwrap();
    let task = engine.wait_task(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Error);
    assert!(task.error.unwrap().contains("Timed out"));

    let outcome = engine.last_commit(&scan_id).await.unwrap().unwrap();
    assert!(outcome.neo4j_attempted);
    assert!(!outcome.neo4j_db_verified);
    assert!(outcome.neo4j_error.unwrap().contains("graph schema"));
}
