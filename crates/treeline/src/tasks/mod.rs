//! Task tracking for long-running scan and commit jobs.
//!
//! Each task record lives behind one lock. The worker mutates it only
//! through its [`TaskHandle`]; everyone else gets snapshot copies.

mod cancel;
mod scheduler;

pub use cancel::{CancelOnDrop, CancellationToken};
pub use scheduler::Scheduler;

use crate::error::Result;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use treeline_protocol::{ScanId, Task, TaskId};

/// Phase messages reported on `status_message`.
pub mod phase {
    pub const COUNTING: &str = "counting files";
    pub const PROCESSING: &str = "processing files";
    pub const RECORDING: &str = "recording fingerprints";
    pub const READING: &str = "reading index rows";
    pub const WRITING: &str = "writing rows to graph";
    pub const VERIFYING: &str = "verifying graph";
}

/// Highest progress a task can report before it completes.
const PROGRESS_CEILING: f64 = 0.99;

/// Exponential moving average of seconds per item.
#[derive(Debug, Clone)]
pub struct EtaEstimator {
    smoothing: f64,
    secs_per_item: Option<f64>,
    last_sample: Instant,
}

impl EtaEstimator {
    pub fn new(smoothing: f64) -> Self {
        Self {
            smoothing: smoothing.clamp(f64::EPSILON, 1.0),
            secs_per_item: None,
            last_sample: Instant::now(),
        }
    }

    /// Restart timing, e.g. when a new phase begins.
    pub fn reset(&mut self, now: Instant) {
        self.secs_per_item = None;
        self.last_sample = now;
    }

    /// Record that `items` finished since the previous observation.
    pub fn observe(&mut self, items: u64, now: Instant) {
        if items == 0 {
            return;
        }
        let elapsed = now.saturating_duration_since(self.last_sample).as_secs_f64();
        let sample = elapsed / items as f64;
        self.secs_per_item = Some(match self.secs_per_item {
            None => sample,
            Some(avg) => self.smoothing * sample + (1.0 - self.smoothing) * avg,
        });
        self.last_sample = now;
    }

    /// Seconds remaining, or `None` when the total is unknown or the work is
    /// essentially done.
    pub fn estimate(&self, processed: u64, total: Option<u64>) -> Option<f64> {
        let total = total?;
        let remaining = total.saturating_sub(processed);
        if remaining == 0 || total == 0 {
            return None;
        }
        if processed as f64 / total as f64 >= PROGRESS_CEILING {
            return None;
        }
        self.secs_per_item.map(|rate| rate * remaining as f64)
    }
}

/// The worker's view of its own task.
#[derive(Clone)]
pub struct TaskHandle {
    task_id: TaskId,
    slot: Arc<RwLock<Task>>,
    cancel: CancellationToken,
    sealed: Arc<AtomicBool>,
    eta: Arc<Mutex<EtaEstimator>>,
}

impl TaskHandle {
    pub(crate) fn new(task: Task, eta_smoothing: f64) -> Self {
        Self {
            task_id: task.task_id.clone(),
            slot: Arc::new(RwLock::new(task)),
            cancel: CancellationToken::new(),
            sealed: Arc::new(AtomicBool::new(false)),
            eta: Arc::new(Mutex::new(EtaEstimator::new(eta_smoothing))),
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn snapshot(&self) -> Task {
        self.slot.read().clone()
    }

    pub fn set_phase(&self, message: &str) {
        let mut task = self.slot.write();
        if !task.status.is_terminal() {
            task.status_message = Some(message.to_string());
        }
    }

    /// Begin counting against a new total. Resets processed items.
    pub fn set_total(&self, total: Option<u64>) {
        let mut task = self.slot.write();
        if task.status.is_terminal() {
            return;
        }
        task.total = total;
        task.processed = 0;
        task.eta_seconds = None;
        self.eta.lock().reset(Instant::now());
    }

    pub fn advance(&self, items: u64) {
        let mut task = self.slot.write();
        if task.status.is_terminal() {
            return;
        }
        task.processed += items;
        if let Some(total) = task.total.filter(|t| *t > 0) {
            let fraction = task.processed as f64 / total as f64;
            task.progress = task.progress.max(fraction.min(PROGRESS_CEILING));
        }
        let mut eta = self.eta.lock();
        eta.observe(items, Instant::now());
        task.eta_seconds = eta.estimate(task.processed, task.total);
    }

    pub fn set_scan_id(&self, scan_id: &ScanId) {
        let mut task = self.slot.write();
        if !task.status.is_terminal() {
            task.scan_id = Some(scan_id.clone());
        }
    }

    /// Point of no return. After a successful seal, cancellation is refused
    /// and the job runs to completion. Returns false if a cancel got there
    /// first.
    pub fn seal(&self) -> bool {
        let _task = self.slot.write();
        if self.cancel.is_cancelled() {
            return false;
        }
        self.sealed.store(true, Ordering::SeqCst);
        true
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::SeqCst)
    }

    pub(crate) fn start(&self) -> bool {
        self.slot.write().start()
    }

    /// Request cancellation. Refused for terminal or sealed tasks.
    pub(crate) fn request_cancel(&self) -> bool {
        let mut task = self.slot.write();
        if task.status.is_terminal() || self.is_sealed() {
            return false;
        }
        self.cancel.cancel();
        if task.status == treeline_protocol::TaskStatus::Queued {
            task.cancel();
        }
        true
    }

    /// Apply the job's result to the record and return the final snapshot.
    pub(crate) fn finish(&self, result: &Result<()>) -> Task {
        let mut task = self.slot.write();
        match result {
            Ok(()) if self.cancel.is_cancelled() && !self.is_sealed() => {
                task.cancel();
            }
            Ok(()) => {
                task.complete();
            }
            Err(e) if e.is_cancelled() => {
                task.cancel();
            }
            Err(e) => {
                task.fail(e.to_string());
            }
        }
        if task.status != treeline_protocol::TaskStatus::Completed {
            task.scan_id = None;
        }
        task.clone()
    }
}
