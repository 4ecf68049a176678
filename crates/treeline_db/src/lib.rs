//! Storage layer for Treeline.
//!
//! Three seams, two backends:
//!
//! - [`IndexStore`]: file/folder rows keyed by `(scan_id, path)`
//! - [`ScanLedger`]: scan records, task history, commit outcomes
//! - [`FingerprintStore`]: per-root change-detection cache
//!
//! [`Catalog::open`] bundles one backend behind all three.
//!
//! ```rust,ignore
//! use treeline_db::{Catalog, StoreBackend};
//!
//! let catalog = Catalog::open(&StoreBackend::Sqlite { path: "index.sqlite".into() }).await?;
//! let page = catalog.index.get_children(&scan_id, "/data", &Default::default(), None, 200).await?;
//! ```

mod error;
pub mod memory;
pub mod page;
pub mod sqlite;
mod traits;

pub use error::{DbError, Result};
pub use memory::{MemoryFingerprints, MemoryIndex, MemoryLedger};
pub use sqlite::IndexDb;
pub use traits::{
    CacheEntry, ChildFilter, FingerprintStore, IndexPage, IndexStore, RecoveryReport, ScanLedger,
};

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

/// Which backend holds the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreBackend {
    /// Lost on exit
    #[default]
    Memory,
    /// Durable SQLite file
    Sqlite { path: PathBuf },
}

/// The three storage seams, backed by one store.
#[derive(Clone)]
pub struct Catalog {
    pub index: Arc<dyn IndexStore>,
    pub ledger: Arc<dyn ScanLedger>,
    pub fingerprints: Arc<dyn FingerprintStore>,
}

impl Catalog {
    pub async fn open(backend: &StoreBackend) -> Result<Self> {
        match backend {
            StoreBackend::Memory => Ok(Self::in_memory()),
            StoreBackend::Sqlite { path } => {
                let db = Arc::new(IndexDb::open(path).await?);
                Ok(Self {
                    index: db.clone(),
                    ledger: db.clone(),
                    fingerprints: db,
                })
            }
        }
    }

    pub fn in_memory() -> Self {
        Self {
            index: Arc::new(MemoryIndex::new()),
            ledger: Arc::new(MemoryLedger::new()),
            fingerprints: Arc::new(MemoryFingerprints::new()),
        }
    }
}
