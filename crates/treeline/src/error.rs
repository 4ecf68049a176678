//! Engine error taxonomy.

use crate::graph::GraphError;
use crate::provider::ProviderError;
use std::time::Duration;
use thiserror::Error;
use treeline_db::DbError;
use treeline_protocol::{ScanId, ScanStatus, TaskId};

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    /// All task slots are busy; nothing was queued
    #[error("Admission rejected: {running} of {cap} task slots busy")]
    AdmissionRejected { running: usize, cap: usize },

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Index, ledger or fingerprint store failure; fatal to the task
    #[error("Index store error: {0}")]
    IndexWrite(#[from] DbError),

    #[error("Graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Timed out after {after:?} waiting for {what}")]
    Timeout { what: &'static str, after: Duration },

    #[error("Cancellation requested")]
    Cancelled,

    #[error("Scan not found: {0}")]
    ScanNotFound(ScanId),

    #[error("Scan {scan_id} is {status} and cannot be committed")]
    ScanNotCommittable { scan_id: ScanId, status: ScanStatus },

    #[error("Scan {0} is in use by a running task")]
    ScanBusy(ScanId),

    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Invalid root: {0}")]
    InvalidRoot(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl EngineError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Short guidance for callers deciding whether to retry.
    pub fn retry_hint(&self) -> Option<&'static str> {
        match self {
            Self::AdmissionRejected { .. } => Some("retry after a running task finishes"),
            Self::Timeout { .. } => Some("retry; the provider or graph store was slow to respond"),
            Self::ScanBusy(_) => Some("retry once the task using this scan has finished"),
            Self::Graph(GraphError::Unavailable(_)) => Some("retry once the graph store is reachable"),
            Self::Provider(ProviderError::Unavailable(_)) => Some("retry once the provider is reachable"),
            Self::ScanNotCommittable { .. } => Some("run a new scan; only completed scans can be committed"),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
