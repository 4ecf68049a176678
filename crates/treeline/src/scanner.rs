//! Streaming scan of one provider root into the index.
//!
//! The provider walks on a blocking thread and hands batches over a
//! bounded channel; this side resolves each entry against the fingerprint
//! cache, closes hierarchy gaps, and writes the batch in one insert. The
//! scan record only becomes `completed` after every batch is written and
//! the fingerprint cache has been replaced.

use crate::cache::SelectiveCache;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::hierarchy::{entry_row, HierarchySynthesizer, Placement};
use crate::provider::{EntrySink, Provider};
use crate::tasks::{phase, CancellationToken, TaskHandle};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use treeline_db::Catalog;
use treeline_protocol::{IndexRow, ProviderEntry, ScanRecord, ScanStatus};

/// Batches in flight between the walker and the writer
const CHANNEL_DEPTH: usize = 8;

const CANCEL_POLL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub entries: u64,
    pub rows_written: u64,
    pub rejected: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub synthesized: u64,
}

pub struct ScanJob {
    config: Arc<EngineConfig>,
    catalog: Catalog,
    provider: Arc<dyn Provider>,
    record: ScanRecord,
}

impl ScanJob {
    pub fn new(
        config: Arc<EngineConfig>,
        catalog: Catalog,
        provider: Arc<dyn Provider>,
        record: ScanRecord,
    ) -> Self {
        Self {
            config,
            catalog,
            provider,
            record,
        }
    }

    /// Run the scan, leaving the scan record in a terminal state whatever
    /// happens.
    pub async fn run(self, handle: TaskHandle) -> Result<ScanSummary> {
        let mut record = self.record.clone();
        let started = Instant::now();
        info!(
            scan_id = %record.id,
            provider = %record.provider_id,
            root = %record.root_path,
            recursive = record.recursive,
            "Starting scan"
        );

        let result = self.execute(&mut record, &handle).await;
        match &result {
            Ok(summary) => {
                info!(
                    scan_id = %record.id,
                    entries = summary.entries,
                    rows = summary.rows_written,
                    files = record.file_count,
                    folders = record.folder_count,
                    cache_hits = summary.cache_hits,
                    cache_misses = summary.cache_misses,
                    synthesized = summary.synthesized,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Scan complete"
                );
            }
            Err(e) => {
                let (status, message) = if e.is_cancelled() {
                    (ScanStatus::Canceled, None)
                } else {
                    (ScanStatus::Error, Some(e.to_string()))
                };
                if record.finish(status, message) {
                    if let Err(db_err) = self.catalog.ledger.put_scan(&record).await {
                        warn!(scan_id = %record.id, error = %db_err, "Failed to record scan failure");
                    }
                }
                warn!(scan_id = %record.id, status = %status, error = %e, "Scan ended early");
            }
        }
        result
    }

    async fn execute(&self, record: &mut ScanRecord, handle: &TaskHandle) -> Result<ScanSummary> {
        let scan_id = record.id.clone();
        let root = record.root_path.clone();
        let recursive = record.recursive;
        let index = &self.catalog.index;
        let mut summary = ScanSummary::default();

        self.catalog.ledger.put_scan(record).await?;
        let mut synth = HierarchySynthesizer::new(scan_id.clone(), root.clone());
        summary.rows_written += index.insert_rows(&scan_id, &[synth.root_row()]).await?;

        if self.config.count_before_scan {
            handle.set_phase(phase::COUNTING);
            let total = self.count_entries(&root, recursive, handle).await?;
            debug!(scan_id = %scan_id, total = ?total, "Pre-count finished");
            handle.set_total(total);
        }
        if handle.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        handle.set_phase(phase::PROCESSING);
        let mut cache =
            SelectiveCache::load(self.catalog.fingerprints.as_ref(), self.provider.id(), &root)
                .await?;

        let stop = CancellationToken::new();
        let _stop_walker = stop.drop_guard();
        let (tx, mut rx) = mpsc::channel::<Vec<ProviderEntry>>(CHANNEL_DEPTH);
        let walker = {
            let provider = Arc::clone(&self.provider);
            let root = root.clone();
            let stop = stop.clone();
            let batch_size = self.config.batch_size;
            tokio::task::spawn_blocking(move || {
                let mut sink = EntrySink::new(tx, batch_size);
                let stats = provider.list_entries(&root, recursive, &mut sink, &stop)?;
                sink.flush();
                Ok::<_, crate::provider::ProviderError>(stats)
            })
        };

        let provider_timeout = self.config.provider_timeout();
        loop {
            let next = tokio::select! {
                received = tokio::time::timeout(provider_timeout, rx.recv()) => received,
                _ = cancelled(handle) => return Err(EngineError::Cancelled),
            };
            let batch = match next {
                Ok(Some(batch)) => batch,
                Ok(None) => break,
                Err(_) => {
                    return Err(EngineError::Timeout {
                        what: "provider listing",
                        after: provider_timeout,
                    })
                }
            };

            let batch_len = batch.len() as u64;
            let rows = self.build_rows(&batch, &root, &mut synth, &mut cache);
            summary.entries += batch_len;
            summary.rows_written += index.insert_rows(&scan_id, &rows).await?;
            handle.advance(batch_len);

            if handle.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
        }

        let stats = walker
            .await
            .map_err(|e| EngineError::Internal(format!("provider walker panicked: {}", e)))??;
        if stats.skipped > 0 {
            debug!(scan_id = %scan_id, skipped = stats.skipped, "Provider skipped entries");
        }
        if synth.rejected() > 0 {
            warn!(scan_id = %scan_id, rejected = synth.rejected(), "Entries outside the scan root were ignored");
        }

        handle.set_phase(phase::RECORDING);
        let counts = index.count_rows(&scan_id).await?;
        record.file_count = counts.files;
        record.folder_count = counts.folders;
        record.cache_hits = cache.hits();
        record.cache_misses = cache.misses();
        record.synthesized_folders = synth.synthesized_count();
        summary.rejected = synth.rejected();
        summary.cache_hits = cache.hits();
        summary.cache_misses = cache.misses();
        summary.synthesized = synth.synthesized_count();

        if !handle.seal() {
            return Err(EngineError::Cancelled);
        }
        let recorded = cache.commit(self.catalog.fingerprints.as_ref()).await?;
        debug!(scan_id = %scan_id, fingerprints = recorded, "Fingerprint cache replaced");

        record.finish(ScanStatus::Completed, None);
        self.catalog.ledger.put_scan(record).await?;
        handle.set_scan_id(&scan_id);
        Ok(summary)
    }

    fn build_rows(
        &self,
        batch: &[ProviderEntry],
        root: &str,
        synth: &mut HierarchySynthesizer,
        cache: &mut SelectiveCache,
    ) -> Vec<IndexRow> {
        let scan_id = &self.record.id;
        let mut rows = Vec::with_capacity(batch.len());
        for entry in batch {
            match synth.locate(&entry.path) {
                Placement::Inside => {}
                Placement::Root => continue,
                Placement::Outside => {
                    synth.reject(&entry.path);
                    continue;
                }
            }
            let row = cache.resolve(scan_id, entry, || entry_row(scan_id, root, entry));
            rows.extend(synth.admit(row));
        }
        rows
    }

    /// Ask the provider for a total. A slow count is abandoned rather than
    /// failing the scan.
    async fn count_entries(
        &self,
        root: &str,
        recursive: bool,
        handle: &TaskHandle,
    ) -> Result<Option<u64>> {
        let stop = CancellationToken::new();
        let _stop_count = stop.drop_guard();
        let counting = {
            let provider = Arc::clone(&self.provider);
            let root = root.to_string();
            tokio::task::spawn_blocking(move || provider.estimate_total(&root, recursive, &stop))
        };

        let timeout = self.config.provider_timeout();
        tokio::select! {
            counted = tokio::time::timeout(timeout, counting) => match counted {
                Ok(joined) => Ok(joined
                    .map_err(|e| EngineError::Internal(format!("count panicked: {}", e)))??),
                Err(_) => {
                    warn!(root, after = ?timeout, "Pre-count timed out, continuing without a total");
                    Ok(None)
                }
            },
            _ = cancelled(handle) => Err(EngineError::Cancelled),
        }
    }
}

async fn cancelled(handle: &TaskHandle) {
    while !handle.is_cancelled() {
        tokio::time::sleep(CANCEL_POLL).await;
    }
}
