//! Bounded task scheduler.
//!
//! A fixed number of slots; a submission that finds no free slot is
//! rejected immediately instead of queued. Every state change is mirrored
//! to the ledger so task history survives restarts, which is also where
//! finished tasks are read from once they age out of memory.

use super::TaskHandle;
use crate::error::{EngineError, Result};
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, warn};
use treeline_db::ScanLedger;
use treeline_protocol::{Task, TaskId, TaskKind, TaskStatus};

struct TaskEntry {
    handle: TaskHandle,
    status: watch::Sender<TaskStatus>,
}

pub struct Scheduler {
    permits: Arc<Semaphore>,
    cap: usize,
    tasks: Arc<DashMap<TaskId, Arc<TaskEntry>>>,
    ledger: Arc<dyn ScanLedger>,
    eta_smoothing: f64,
    /// Finished entries kept in memory
    retain_finished: usize,
}

impl Scheduler {
    pub fn new(
        cap: usize,
        ledger: Arc<dyn ScanLedger>,
        eta_smoothing: f64,
        retain_finished: usize,
    ) -> Self {
        let cap = cap.max(1);
        Self {
            permits: Arc::new(Semaphore::new(cap)),
            cap,
            tasks: Arc::new(DashMap::new()),
            ledger,
            eta_smoothing,
            retain_finished,
        }
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    /// Tasks currently holding a slot.
    pub fn running(&self) -> usize {
        self.cap - self.permits.available_permits()
    }

    /// Admit and start a job, or reject it if every slot is busy.
    pub async fn submit<F, Fut>(&self, kind: TaskKind, job: F) -> Result<TaskId>
    where
        F: FnOnce(TaskHandle) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let permit = match Arc::clone(&self.permits).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                let running = self.running();
                warn!(kind = %kind, running, cap = self.cap, "Task rejected, all slots busy");
                return Err(EngineError::AdmissionRejected {
                    running,
                    cap: self.cap,
                });
            }
        };

        let handle = TaskHandle::new(Task::new(kind), self.eta_smoothing);
        let task_id = handle.id().clone();
        self.ledger.record_task(&handle.snapshot()).await?;

        let (status_tx, _) = watch::channel(TaskStatus::Queued);
        let entry = Arc::new(TaskEntry {
            handle: handle.clone(),
            status: status_tx,
        });
        self.tasks.insert(task_id.clone(), Arc::clone(&entry));
        info!(task_id = %task_id, kind = %kind, "Task admitted");

        let ledger = Arc::clone(&self.ledger);
        let tasks = Arc::clone(&self.tasks);
        let retain_finished = self.retain_finished;
        tokio::spawn(async move {
            let result = if handle.start() {
                entry.status.send_replace(TaskStatus::Running);
                persist(&ledger, &handle.snapshot()).await;
                // Run on its own task so a panic becomes an error record
                match tokio::spawn(job(handle.clone())).await {
                    Ok(result) => result,
                    Err(join_err) => Err(EngineError::Internal(format!(
                        "task panicked: {}",
                        join_err
                    ))),
                }
            } else {
                drop(job);
                Err(EngineError::Cancelled)
            };

            // Free the slot before anyone can observe the terminal status
            drop(permit);
            let task = handle.finish(&result);
            match task.status {
                TaskStatus::Completed => info!(task_id = %task.task_id, kind = %task.kind, "Task completed"),
                TaskStatus::Canceled => info!(task_id = %task.task_id, kind = %task.kind, "Task canceled"),
                _ => error!(
                    task_id = %task.task_id,
                    kind = %task.kind,
                    error = task.error.as_deref().unwrap_or(""),
                    "Task failed"
                ),
            }
            persist(&ledger, &task).await;
            entry.status.send_replace(task.status);
            evict_finished(&tasks, retain_finished);
        });

        Ok(task_id)
    }

    /// Snapshot of an in-memory task.
    pub fn get(&self, task_id: &TaskId) -> Option<Task> {
        self.tasks.get(task_id).map(|e| e.handle.snapshot())
    }

    /// All in-memory tasks, newest first.
    pub fn list(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.iter().map(|e| e.handle.snapshot()).collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks
    }

    /// Request cooperative cancellation. False for unknown, finished, or
    /// sealed tasks.
    pub fn cancel(&self, task_id: &TaskId) -> bool {
        let Some(entry) = self.tasks.get(task_id).map(|e| Arc::clone(e.value())) else {
            return false;
        };
        let accepted = entry.handle.request_cancel();
        debug!(task_id = %task_id, accepted, "Cancel requested");
        accepted
    }

    /// Wait until a task reaches a terminal status.
    pub async fn wait(&self, task_id: &TaskId) -> Result<Task> {
        let entry = self
            .tasks
            .get(task_id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| EngineError::TaskNotFound(task_id.clone()))?;
        let mut rx = entry.status.subscribe();
        rx.wait_for(|status| status.is_terminal())
            .await
            .map_err(|_| EngineError::Internal("task status channel closed".to_string()))?;
        Ok(entry.handle.snapshot())
    }
}

/// Drop the oldest finished entries beyond `keep`. Their terminal state is
/// already in the ledger.
fn evict_finished(tasks: &DashMap<TaskId, Arc<TaskEntry>>, keep: usize) {
    let mut finished: Vec<(TaskId, Task)> = tasks
        .iter()
        .filter(|e| e.status.borrow().is_terminal())
        .map(|e| (e.key().clone(), e.handle.snapshot()))
        .collect();
    if finished.len() <= keep {
        return;
    }
    finished.sort_by(|a, b| (a.1.ended_at, a.1.created_at).cmp(&(b.1.ended_at, b.1.created_at)));
    let excess = finished.len() - keep;
    for (task_id, _) in finished.into_iter().take(excess) {
        tasks.remove(&task_id);
    }
    debug!(evicted = excess, kept = keep, "Evicted finished tasks from memory");
}

async fn persist(ledger: &Arc<dyn ScanLedger>, task: &Task) {
    if let Err(e) = ledger.record_task(task).await {
        warn!(task_id = %task.task_id, error = %e, "Failed to persist task state");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use treeline_db::MemoryLedger;

    fn scheduler(cap: usize) -> (Scheduler, Arc<MemoryLedger>) {
        let ledger = Arc::new(MemoryLedger::new());
        (Scheduler::new(cap, ledger.clone(), 0.2, 16), ledger)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_completed_task_is_persisted() {
        let (scheduler, ledger) = scheduler(1);
        let id = scheduler
            .submit(TaskKind::Scan, |handle| async move {
                handle.set_total(Some(2));
                handle.advance(2);
                Ok(())
            })
            .await
            .unwrap();

        let task = scheduler.wait(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.processed, 2);

        let stored = ledger.get_task(&id).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(scheduler.running(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_panicking_job_becomes_error() {
        let (scheduler, _ledger) = scheduler(1);
        let id = scheduler
            .submit(TaskKind::Commit, |_handle| async move {
                if true {
                    panic!("job blew up");
                }
                Ok(())
            })
            .await
            .unwrap();

        let task = scheduler.wait(&id).await.unwrap();
        assert_eq!(task.status, TaskStatus::Error);
        assert!(task.error.unwrap().contains("panicked"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_unknown_or_finished() {
        let (scheduler, _ledger) = scheduler(2);
        assert!(!scheduler.cancel(&TaskId::new()));

        let id = scheduler
            .submit(TaskKind::Scan, |_handle| async move { Ok(()) })
            .await
            .unwrap();
        scheduler.wait(&id).await.unwrap();
        assert!(!scheduler.cancel(&id));

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(scheduler.list().len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_finished_tasks_age_out_of_memory() {
        let ledger = Arc::new(MemoryLedger::new());
        let scheduler = Scheduler::new(1, ledger.clone(), 0.2, 2);

        let mut ids = Vec::new();
        for _ in 0..5 {
            let id = scheduler
                .submit(TaskKind::Scan, |_handle| async move { Ok(()) })
                .await
                .unwrap();
            scheduler.wait(&id).await.unwrap();
            // Eviction runs right after the terminal status is published
            for _ in 0..100 {
                if scheduler.list().len() <= 2 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            ids.push(id);
        }

        let kept: Vec<TaskId> = scheduler.list().into_iter().map(|t| t.task_id).collect();
        assert_eq!(kept.len(), 2);
        assert!(kept.contains(&ids[4]));
        assert!(kept.contains(&ids[3]));
        assert!(scheduler.get(&ids[0]).is_none());

        let stored = ledger.get_task(&ids[0]).await.unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Completed);
    }
}
