//! Treeline - incremental file-tree indexing with graph commit.
//!
//! Scans walk a provider root into an index of file and folder rows,
//! reusing unchanged rows from the previous scan of the same root. A
//! completed scan can then be committed idempotently to a graph store.

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod graph;
pub mod hierarchy;
pub mod provider;
pub mod scanner;
pub mod tasks;

pub use config::{EngineConfig, GraphConfig, ProviderConfig, ProviderKind};
pub use engine::Engine;
pub use error::{EngineError, Result};
pub use graph::{GraphError, GraphStore, MemoryGraph, Neo4jGraph};
pub use provider::{EntrySink, ListingStats, Provider, ProviderError, ProviderRegistry};
pub use tasks::{CancellationToken, TaskHandle};

pub use treeline_db::{Catalog, ChildFilter, IndexPage, StoreBackend};
pub use treeline_protocol as protocol;
