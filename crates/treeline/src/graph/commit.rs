//! Commit protocol: index rows of one scan into the graph store.
//!
//! Folders go first (ordered by depth, so a parent is always merged before
//! its children), then files, each in bounded batches. The write is then
//! verified by counting what is linked to the Scan node. Graph failures are
//! recorded on the outcome rather than returned, so a caller always learns
//! what happened to the attempt.

use super::{GraphResult, GraphStore, WriteStats};
use crate::error::{EngineError, Result};
use crate::tasks::{phase, TaskHandle};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use treeline_db::{Catalog, IndexStore, ScanLedger};
use treeline_protocol::{CommitOutcome, IndexRow, ScanId, ScanRecord};

const CANCELED: &str = "canceled";

pub struct CommitProtocol {
    index: Arc<dyn IndexStore>,
    ledger: Arc<dyn ScanLedger>,
    graph: Option<Arc<dyn GraphStore>>,
    batch_size: usize,
    timeout: Duration,
}

async fn within<T>(
    limit: Duration,
    what: &'static str,
    call: impl Future<Output = GraphResult<T>>,
) -> Result<T> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(EngineError::Timeout { what, after: limit }),
    }
}

impl CommitProtocol {
    pub fn new(
        catalog: &Catalog,
        graph: Option<Arc<dyn GraphStore>>,
        batch_size: usize,
        timeout: Duration,
    ) -> Self {
        Self {
            index: Arc::clone(&catalog.index),
            ledger: Arc::clone(&catalog.ledger),
            graph,
            batch_size: batch_size.max(1),
            timeout,
        }
    }

    pub fn graph_enabled(&self) -> bool {
        self.graph.is_some()
    }

    /// The scan record, if it exists and has completed.
    pub async fn committable(&self, scan_id: &ScanId) -> Result<ScanRecord> {
        let scan = self
            .ledger
            .get_scan(scan_id)
            .await?
            .ok_or_else(|| EngineError::ScanNotFound(scan_id.clone()))?;
        if !scan.is_committable() {
            return Err(EngineError::ScanNotCommittable {
                scan_id: scan_id.clone(),
                status: scan.status,
            });
        }
        Ok(scan)
    }

    /// Commit a completed scan and record the outcome.
    pub async fn commit(&self, scan_id: &ScanId, handle: Option<&TaskHandle>) -> Result<CommitOutcome> {
        let scan = self.committable(scan_id).await?;
        let counts = self.index.count_rows(scan_id).await?;

        let Some(graph) = &self.graph else {
            let outcome = CommitOutcome::not_attempted(scan_id.clone(), counts, "graph store disabled");
            self.ledger.record_commit(&outcome).await?;
            info!(scan_id = %scan_id, "Graph store disabled, commit recorded as not attempted");
            return Ok(outcome);
        };

        if let Some(h) = handle {
            h.set_phase(phase::READING);
        }
        let (folders, files): (Vec<IndexRow>, Vec<IndexRow>) = self
            .index
            .scan_rows(scan_id)
            .await?
            .into_iter()
            .partition(IndexRow::is_folder);

        let mut outcome = CommitOutcome {
            scan_id: scan_id.clone(),
            files_in_scan: counts.files,
            folders_in_scan: counts.folders,
            matched_in_graph: 0,
            linked_edges_added: 0,
            neo4j_attempted: true,
            neo4j_db_verified: false,
            neo4j_db_files: 0,
            neo4j_db_folders: 0,
            neo4j_error: None,
            attempted_at: Utc::now(),
        };

        let mut timed_out = None;
        match self
            .write_and_verify(graph.as_ref(), &scan, &folders, &files, handle, &mut outcome)
            .await
        {
            Ok(()) => {}
            Err(EngineError::Cancelled) => return self.record_canceled(outcome).await,
            Err(e) => {
                warn!(scan_id = %scan_id, error = %e, "Graph commit failed");
                outcome.neo4j_error = Some(e.to_string());
                if let EngineError::Timeout { .. } = e {
                    timed_out = Some(e);
                }
            }
        }

        if let Some(h) = handle {
            if !h.seal() {
                return self.record_canceled(outcome).await;
            }
        }
        if outcome.neo4j_db_verified {
            self.ledger.mark_committed(scan_id, outcome.attempted_at).await?;
        }
        self.ledger.record_commit(&outcome).await?;

        info!(
            scan_id = %scan_id,
            verified = outcome.neo4j_db_verified,
            files = outcome.neo4j_db_files,
            folders = outcome.neo4j_db_folders,
            edges_added = outcome.linked_edges_added,
            "Commit attempt recorded"
        );
        match timed_out {
            Some(e) => Err(e),
            None => Ok(outcome),
        }
    }

    /// A canceled attempt may already have written batches, so it is
    /// recorded like any other before the cancellation is returned.
    async fn record_canceled(&self, mut outcome: CommitOutcome) -> Result<CommitOutcome> {
        outcome.neo4j_db_verified = false;
        outcome.neo4j_error = Some(CANCELED.to_string());
        self.ledger.record_commit(&outcome).await?;
        info!(scan_id = %outcome.scan_id, "Canceled commit attempt recorded");
        Err(EngineError::Cancelled)
    }

    async fn write_and_verify(
        &self,
        graph: &dyn GraphStore,
        scan: &ScanRecord,
        folders: &[IndexRow],
        files: &[IndexRow],
        handle: Option<&TaskHandle>,
        outcome: &mut CommitOutcome,
    ) -> Result<()> {
        let scan_id = &scan.id;
        within(self.timeout, "graph schema", graph.ensure_schema()).await?;

        let mut stats = WriteStats::default();
        stats.merge(within(self.timeout, "graph scan node", graph.merge_scan(scan)).await?);

        if let Some(h) = handle {
            h.set_phase(phase::WRITING);
            h.set_total(Some((folders.len() + files.len()) as u64));
        }
        for chunk in folders.chunks(self.batch_size) {
            stats.merge(within(self.timeout, "graph folder batch", graph.merge_folders(scan_id, chunk)).await?);
            checkpoint(handle, chunk.len())?;
        }
        for chunk in files.chunks(self.batch_size) {
            stats.merge(within(self.timeout, "graph file batch", graph.merge_files(scan_id, chunk)).await?);
            checkpoint(handle, chunk.len())?;
        }
        outcome.linked_edges_added = stats.relationships_created;

        if let Some(h) = handle {
            h.set_phase(phase::VERIFYING);
        }
        let counts = within(self.timeout, "graph verification", graph.count_scan(scan_id)).await?;
        outcome.neo4j_db_files = counts.files;
        outcome.neo4j_db_folders = counts.folders;
        outcome.matched_in_graph = counts.files;
        outcome.neo4j_db_verified =
            counts.files == outcome.files_in_scan && counts.folders == outcome.folders_in_scan;
        if !outcome.neo4j_db_verified {
            outcome.neo4j_error = Some(format!(
                "verification mismatch: index has {} files / {} folders, graph has {} / {}",
                outcome.files_in_scan, outcome.folders_in_scan, counts.files, counts.folders
            ));
        }
        Ok(())
    }

    /// Remove a scan's subgraph. `Ok(None)` when no graph store is configured.
    pub async fn retract(&self, scan_id: &ScanId) -> Result<Option<WriteStats>> {
        let Some(graph) = &self.graph else {
            return Ok(None);
        };
        let stats = within(self.timeout, "graph delete", graph.delete_scan(scan_id)).await?;
        info!(
            scan_id = %scan_id,
            nodes_deleted = stats.nodes_deleted,
            relationships_deleted = stats.relationships_deleted,
            "Scan retracted from graph"
        );
        Ok(Some(stats))
    }
}

fn checkpoint(handle: Option<&TaskHandle>, items: usize) -> Result<()> {
    if let Some(h) = handle {
        h.advance(items as u64);
        if h.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
    }
    Ok(())
}
