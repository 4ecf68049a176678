//! Engine facade.
//!
//! Ties configuration, storage, providers, the scheduler and the commit
//! protocol together behind the public API. Cheap to clone.

use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::graph::{self, CommitProtocol, GraphStore};
use crate::provider::ProviderRegistry;
use crate::scanner::ScanJob;
use crate::tasks::Scheduler;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};
use treeline_db::{Catalog, ChildFilter, IndexPage};
use treeline_protocol::{CommitOutcome, ScanId, ScanRecord, Task, TaskId, TaskKind, TaskStatus};

/// Reason recorded on work a previous process left unfinished
const INTERRUPTED: &str = "interrupted by restart";

/// What currently holds a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanUse {
    Scanning,
    Committing,
    Deleting,
}

type ActiveScans = Arc<DashMap<ScanId, ScanUse>>;

/// Exclusive hold on one scan, released on drop. Claimed before any work
/// starts, so two operations can never interleave on the same scan.
struct ScanClaim {
    active: ActiveScans,
    scan_id: ScanId,
}

impl ScanClaim {
    fn acquire(active: &ActiveScans, scan_id: &ScanId, usage: ScanUse) -> Result<Self> {
        match active.entry(scan_id.clone()) {
            Entry::Occupied(held) => {
                debug!(scan_id = %scan_id, held_by = ?held.get(), wanted = ?usage, "Scan busy");
                Err(EngineError::ScanBusy(scan_id.clone()))
            }
            Entry::Vacant(slot) => {
                slot.insert(usage);
                Ok(Self {
                    active: Arc::clone(active),
                    scan_id: scan_id.clone(),
                })
            }
        }
    }
}

impl Drop for ScanClaim {
    fn drop(&mut self) {
        self.active.remove(&self.scan_id);
    }
}

struct Inner {
    config: Arc<EngineConfig>,
    catalog: Catalog,
    providers: ProviderRegistry,
    scheduler: Scheduler,
    commits: CommitProtocol,
    /// Scans being scanned, committed or deleted
    active: ActiveScans,
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<Inner>,
}

impl Engine {
    /// Open storage, repair anything a crashed process left running, and
    /// build providers and the graph store from configuration.
    pub async fn open(config: Arc<EngineConfig>) -> Result<Self> {
        config.validate()?;
        let catalog = Catalog::open(&config.store).await?;

        let report = catalog.ledger.recover_interrupted(INTERRUPTED).await?;
        if report.tasks > 0 || report.scans > 0 {
            warn!(
                tasks = report.tasks,
                scans = report.scans,
                "Marked work from a previous run as failed"
            );
        }

        let providers = ProviderRegistry::from_config(&config)?;
        let graph = graph::from_config(&config.graph, config.graph_timeout())?;
        info!(
            providers = providers.ids().collect::<Vec<_>>().join(","),
            graph = graph.is_some(),
            max_tasks = config.max_concurrent_tasks,
            "Engine ready"
        );
        Ok(Self::with_parts(config, catalog, providers, graph))
    }

    /// Assemble an engine from already-built parts.
    pub fn with_parts(
        config: Arc<EngineConfig>,
        catalog: Catalog,
        providers: ProviderRegistry,
        graph: Option<Arc<dyn GraphStore>>,
    ) -> Self {
        let scheduler = Scheduler::new(
            config.max_concurrent_tasks,
            Arc::clone(&catalog.ledger),
            config.eta_smoothing,
            config.finished_tasks_retained,
        );
        let commits = CommitProtocol::new(
            &catalog,
            graph,
            config.graph_batch_size,
            config.graph_timeout(),
        );
        Self {
            inner: Arc::new(Inner {
                config,
                catalog,
                providers,
                scheduler,
                commits,
                active: Arc::new(DashMap::new()),
            }),
        }
    }

    fn claim(&self, scan_id: &ScanId, usage: ScanUse) -> Result<ScanClaim> {
        ScanClaim::acquire(&self.inner.active, scan_id, usage)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.inner.catalog
    }

    // ========================================================================
    // Scans
    // ========================================================================

    /// Start scanning `root` with the given provider. Returns the task id
    /// immediately; the scan runs in the background.
    pub async fn start_scan(&self, provider_id: &str, root: &str, recursive: bool) -> Result<TaskId> {
        let provider = self.inner.providers.get(provider_id)?;
        let root = provider.resolve_root(root);
        if root.is_empty() {
            return Err(EngineError::InvalidRoot("root must not be empty".to_string()));
        }

        let record = ScanRecord::start(provider_id, root, recursive);
        let scan_id = record.id.clone();
        let claim = self.claim(&scan_id, ScanUse::Scanning)?;
        let job = ScanJob::new(
            Arc::clone(&self.inner.config),
            self.inner.catalog.clone(),
            provider,
            record,
        );

        let task_id = self
            .inner
            .scheduler
            .submit(TaskKind::Scan, move |handle| async move {
                let _claim = claim;
                job.run(handle).await.map(|_| ())
            })
            .await?;

        if self.inner.config.auto_commit {
            self.spawn_auto_commit(task_id.clone(), scan_id);
        }
        Ok(task_id)
    }

    /// Commit once the scan task completes. The scan's slot is free by the
    /// time its terminal status is published.
    fn spawn_auto_commit(&self, scan_task: TaskId, scan_id: ScanId) {
        let engine = self.clone();
        tokio::spawn(async move {
            match engine.wait_task(&scan_task).await {
                Ok(task) if task.status == TaskStatus::Completed => {}
                Ok(_) => return,
                Err(e) => {
                    warn!(task_id = %scan_task, error = %e, "Auto-commit lost track of scan task");
                    return;
                }
            }
            match engine.start_commit(&scan_id).await {
                Ok(task_id) => info!(scan_id = %scan_id, task_id = %task_id, "Auto-commit started"),
                Err(e) => warn!(scan_id = %scan_id, error = %e, "Auto-commit not started"),
            }
        });
    }

    pub async fn get_scan(&self, scan_id: &ScanId) -> Result<ScanRecord> {
        self.inner
            .catalog
            .ledger
            .get_scan(scan_id)
            .await?
            .ok_or_else(|| EngineError::ScanNotFound(scan_id.clone()))
    }

    pub async fn list_scans(&self) -> Result<Vec<ScanRecord>> {
        Ok(self.inner.catalog.ledger.list_scans().await?)
    }

    /// One page of the children of `parent_path` (the scan root when `None`),
    /// folders first, then by name.
    pub async fn list_index(
        &self,
        scan_id: &ScanId,
        parent_path: Option<&str>,
        filter: &ChildFilter,
        page_token: Option<&str>,
        page_size: Option<usize>,
    ) -> Result<IndexPage> {
        let scan = self.get_scan(scan_id).await?;
        let parent = match parent_path {
            Some(p) => treeline_protocol::paths::normalize_root(p),
            None => scan.root_path,
        };
        let limit = self.inner.config.effective_page_size(page_size);
        Ok(self
            .inner
            .catalog
            .index
            .get_children(scan_id, &parent, filter, page_token, limit)
            .await?)
    }

    /// Remove a scan everywhere: graph subgraph first, then index rows and
    /// the scan record.
    pub async fn delete_scan(&self, scan_id: &ScanId) -> Result<()> {
        let _claim = self.claim(scan_id, ScanUse::Deleting)?;
        let scan = self.get_scan(scan_id).await?;
        let ledger = &self.inner.catalog.ledger;

        let reached_graph = scan.committed
            || ledger
                .last_commit(scan_id)
                .await?
                .map_or(false, |c| c.neo4j_attempted);
        if reached_graph {
            self.inner.commits.retract(scan_id).await?;
        }

        let rows = self.inner.catalog.index.delete_scan(scan_id).await?;
        ledger.delete_scan_record(scan_id).await?;
        info!(scan_id = %scan_id, rows, retracted = reached_graph, "Scan deleted");
        Ok(())
    }

    // ========================================================================
    // Commits
    // ========================================================================

    /// Commit a completed scan inline and return the outcome.
    pub async fn commit(&self, scan_id: &ScanId) -> Result<CommitOutcome> {
        let _claim = self.claim(scan_id, ScanUse::Committing)?;
        self.inner.commits.commit(scan_id, None).await
    }

    /// Commit a completed scan as a background task.
    pub async fn start_commit(&self, scan_id: &ScanId) -> Result<TaskId> {
        self.inner.commits.committable(scan_id).await?;
        let claim = self.claim(scan_id, ScanUse::Committing)?;

        let engine = self.clone();
        let scan_id = scan_id.clone();
        self.inner
            .scheduler
            .submit(TaskKind::Commit, move |handle| async move {
                let result = engine.inner.commits.commit(&scan_id, Some(&handle)).await;
                drop(claim);
                let outcome = result?;
                if outcome.neo4j_attempted && !outcome.neo4j_db_verified {
                    warn!(
                        scan_id = %scan_id,
                        error = outcome.neo4j_error.as_deref().unwrap_or(""),
                        "Commit finished unverified"
                    );
                }
                handle.set_scan_id(&scan_id);
                Ok(())
            })
            .await
    }

    pub async fn last_commit(&self, scan_id: &ScanId) -> Result<Option<CommitOutcome>> {
        Ok(self.inner.catalog.ledger.last_commit(scan_id).await?)
    }

    // ========================================================================
    // Tasks
    // ========================================================================

    /// Live snapshot, or the persisted record for tasks from earlier runs.
    pub async fn get_task(&self, task_id: &TaskId) -> Result<Task> {
        if let Some(task) = self.inner.scheduler.get(task_id) {
            return Ok(task);
        }
        self.inner
            .catalog
            .ledger
            .get_task(task_id)
            .await?
            .ok_or_else(|| EngineError::TaskNotFound(task_id.clone()))
    }

    pub fn cancel_task(&self, task_id: &TaskId) -> bool {
        self.inner.scheduler.cancel(task_id)
    }

    /// Wait for a task started by this process to finish. A task that
    /// already aged out of memory is answered from history.
    pub async fn wait_task(&self, task_id: &TaskId) -> Result<Task> {
        match self.inner.scheduler.wait(task_id).await {
            Err(EngineError::TaskNotFound(_)) => {
                match self.inner.catalog.ledger.get_task(task_id).await? {
                    Some(task) if task.status.is_terminal() => Ok(task),
                    _ => Err(EngineError::TaskNotFound(task_id.clone())),
                }
            }
            other => other,
        }
    }

    /// Task history, newest first. Live tasks shadow their persisted rows.
    pub async fn list_tasks(&self) -> Result<Vec<Task>> {
        let mut tasks = self.inner.scheduler.list();
        let live: std::collections::HashSet<TaskId> =
            tasks.iter().map(|t| t.task_id.clone()).collect();
        for task in self.inner.catalog.ledger.list_tasks().await? {
            if !live.contains(&task.task_id) {
                tasks.push(task);
            }
        }
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(tasks)
    }

    pub fn running_tasks(&self) -> usize {
        self.inner.scheduler.running()
    }
}
