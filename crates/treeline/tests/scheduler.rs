//! Admission, cancellation and progress reporting of scan tasks.

mod common;

use common::*;
use std::time::Duration;
use treeline::protocol::{ScanStatus, TaskKind, TaskStatus};
use treeline::{EngineConfig, EngineError};

#[tokio::test(flavor = "multi_thread")]
async fn test_submissions_beyond_cap_are_rejected_until_a_slot_frees() {
    let engine = slow_engine(1);

    let first = engine.start_scan("slow", "/bucket", true).await.unwrap();
    wait_for_progress(&engine, &first, 1).await;
    assert_eq!(engine.running_tasks(), 1);

    match engine.start_scan("slow", "/bucket", true).await {
        Err(EngineError::AdmissionRejected { running, cap }) => {
            assert_eq!((running, cap), (1, 1));
        }
        other => panic!("expected admission rejection, got {:?}", other.map(|_| ())),
    }
    assert_eq!(engine.list_tasks().await.unwrap().len(), 1);

    assert!(engine.cancel_task(&first));
    engine.wait_task(&first).await.unwrap();

    let second = engine.start_scan("slow", "/bucket", true).await.unwrap();
    assert!(engine.cancel_task(&second));
    let task = engine.wait_task(&second).await.unwrap();
    assert_eq!(task.status, TaskStatus::Canceled);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_cancel_ends_canceled_below_full_progress() {
    let engine = slow_engine(2);

    let task_id = engine.start_scan("slow", "/bucket", true).await.unwrap();
    let running = wait_for_progress(&engine, &task_id, 5).await;
    assert_eq!(running.status, TaskStatus::Running);
    assert_eq!(running.kind, TaskKind::Scan);
    assert_eq!(running.total, Some(100_000));
    assert!(running.progress > 0.0);

    assert!(engine.cancel_task(&task_id));
    let task = engine.wait_task(&task_id).await.unwrap();
    assert_eq!(task.status, TaskStatus::Canceled);
    assert!(task.progress < 1.0);
    assert!(task.scan_id.is_none());
    assert!(task.ended_at.is_some());

    let scans = engine.list_scans().await.unwrap();
    assert_eq!(scans.len(), 1);
    assert_eq!(scans[0].status, ScanStatus::Canceled);
    assert!(!scans[0].committed);
    assert!(matches!(
        engine.commit(&scans[0].id).await,
        Err(EngineError::ScanNotCommittable { .. })
    ));

    // Already terminal
    assert!(!engine.cancel_task(&task_id));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_progress_is_monotonic_and_history_is_persisted() {
    let engine = slow_engine(1);
    let task_id = engine.start_scan("slow", "/bucket", true).await.unwrap();

    let mut last = 0.0;
    for target in [2, 6, 12] {
        let task = wait_for_progress(&engine, &task_id, target).await;
        assert!(task.progress >= last);
        assert!(task.progress < 1.0);
        last = task.progress;
    }
    engine.cancel_task(&task_id);
    engine.wait_task(&task_id).await.unwrap();

    let persisted = engine
        .catalog()
        .ledger
        .get_task(&task_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(persisted.status, TaskStatus::Canceled);
    assert_eq!(engine.running_tasks(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unknown_task_cannot_be_cancelled_or_fetched() {
    let engine = slow_engine(1);
    let missing = treeline::protocol::TaskId::from_string("no-such-task");
    assert!(!engine.cancel_task(&missing));
    assert!(matches!(
        engine.get_task(&missing).await,
        Err(EngineError::TaskNotFound(_))
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_scan_in_progress_cannot_be_deleted() {
    let engine = slow_engine(1);
    let task_id = engine.start_scan("slow", "/bucket", true).await.unwrap();
    wait_for_progress(&engine, &task_id, 1).await;

    let scan_id = engine.list_scans().await.unwrap()[0].id.clone();
    assert!(matches!(
        engine.delete_scan(&scan_id).await,
        Err(EngineError::ScanBusy(_))
    ));

    engine.cancel_task(&task_id);
    engine.wait_task(&task_id).await.unwrap();
    engine.delete_scan(&scan_id).await.unwrap();
    assert!(engine.list_scans().await.unwrap().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_aged_out_tasks_are_served_from_history() {
    let tree = TestTree::new(&["a.txt"]);
    let config = EngineConfig {
        finished_tasks_retained: 1,
        ..Default::default()
    };
    let engine = engine_with(config, None, Vec::new());

    let mut task_ids = Vec::new();
    for _ in 0..3 {
        let task_id = engine.start_scan("local", &tree.root, true).await.unwrap();
        engine.wait_task(&task_id).await.unwrap();
        task_ids.push(task_id);
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    let first = engine.get_task(&task_ids[0]).await.unwrap();
    assert_eq!(first.status, TaskStatus::Completed);
    assert!(first.scan_id.is_some());
    let waited = engine.wait_task(&task_ids[0]).await.unwrap();
    assert_eq!(waited.task_id, task_ids[0]);

    let all = engine.list_tasks().await.unwrap();
    assert_eq!(all.len(), 3);
    assert_eq!(all[0].task_id, task_ids[2]);
}
