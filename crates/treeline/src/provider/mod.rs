//! Storage providers.
//!
//! A provider turns a root into a stream of normalized [`ProviderEntry`]
//! batches. Listing is blocking work; the scanner runs it on a blocking
//! thread and receives batches over a bounded channel, so a slow consumer
//! applies backpressure to the walk.

mod local;
mod mounted;
mod remote;

pub use local::LocalProvider;
pub use mounted::MountedProvider;
pub use remote::{parse_lsjson_line, RemoteSyncProvider};

use crate::config::{EngineConfig, ProviderKind};
use crate::error::{EngineError, Result};
use crate::tasks::CancellationToken;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;
use std::time::SystemTime;
use thiserror::Error;
use tokio::sync::mpsc;
use treeline_protocol::paths::normalize_root;
use treeline_protocol::ProviderEntry;

/// Typed provider failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("Malformed listing: {0}")]
    Malformed(String),
}

impl ProviderError {
    pub fn from_io(path: &str, err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(path.to_string()),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(path.to_string()),
            _ => Self::Unavailable(format!("{}: {}", path, err)),
        }
    }
}

/// Counters reported by a finished listing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListingStats {
    pub entries: u64,
    /// Unreadable or excluded entries
    pub skipped: u64,
}

/// Batching sender handed to a provider.
///
/// `push` returns false once the scanner has stopped listening; providers
/// must stop walking when that happens.
pub struct EntrySink {
    tx: mpsc::Sender<Vec<ProviderEntry>>,
    batch: Vec<ProviderEntry>,
    batch_size: usize,
    sent: u64,
}

impl EntrySink {
    pub fn new(tx: mpsc::Sender<Vec<ProviderEntry>>, batch_size: usize) -> Self {
        let batch_size = batch_size.max(1);
        Self {
            tx,
            batch: Vec::with_capacity(batch_size),
            batch_size,
            sent: 0,
        }
    }

    pub fn push(&mut self, entry: ProviderEntry) -> bool {
        self.batch.push(entry);
        if self.batch.len() >= self.batch_size {
            return self.flush();
        }
        true
    }

    /// Send whatever is buffered. Blocks while the channel is full.
    pub fn flush(&mut self) -> bool {
        if self.batch.is_empty() {
            return !self.tx.is_closed();
        }
        let batch = std::mem::replace(&mut self.batch, Vec::with_capacity(self.batch_size));
        let len = batch.len() as u64;
        if self.tx.blocking_send(batch).is_err() {
            return false;
        }
        self.sent += len;
        true
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }
}

/// A storage backend that can list a root.
pub trait Provider: Send + Sync {
    fn id(&self) -> &str;

    /// Canonical form of a user-supplied root for this provider.
    fn resolve_root(&self, root: &str) -> String {
        normalize_root(root)
    }

    /// Stream every entry under `root` into `sink`.
    ///
    /// Intermediate folders may be omitted. Runs on a blocking thread and
    /// must return promptly once `stop` is cancelled or `sink.push` fails.
    fn list_entries(
        &self,
        root: &str,
        recursive: bool,
        sink: &mut EntrySink,
        stop: &CancellationToken,
    ) -> std::result::Result<ListingStats, ProviderError>;

    /// Cheap entry count, if the provider can offer one.
    fn estimate_total(
        &self,
        _root: &str,
        _recursive: bool,
        _stop: &CancellationToken,
    ) -> std::result::Result<Option<u64>, ProviderError> {
        Ok(None)
    }
}

/// Providers by id, built once from configuration.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn Provider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let mut registry = Self::new();
        for provider in &config.providers {
            let built: Arc<dyn Provider> = match &provider.kind {
                ProviderKind::Local => Arc::new(LocalProvider::new(
                    &provider.id,
                    config.exclude_dir_names.clone(),
                )),
                ProviderKind::Mounted { mount_point } => Arc::new(MountedProvider::new(
                    &provider.id,
                    mount_point.clone(),
                    config.exclude_dir_names.clone(),
                )),
                ProviderKind::RemoteSync { remote, binary } => Arc::new(
                    RemoteSyncProvider::new(&provider.id, remote, binary),
                ),
            };
            registry.register(built)?;
        }
        Ok(registry)
    }

    pub fn register(&mut self, provider: Arc<dyn Provider>) -> Result<()> {
        let id = provider.id().to_string();
        if self.providers.contains_key(&id) {
            return Err(EngineError::config(format!("duplicate provider id: {}", id)));
        }
        self.providers.insert(id, provider);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn Provider>> {
        self.providers
            .get(id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownProvider(id.to_string()))
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }
}

/// Millisecond-precision UTC time from filesystem metadata.
pub(crate) fn system_time_to_utc(time: SystemTime) -> Option<DateTime<Utc>> {
    let millis = time
        .duration_since(SystemTime::UNIX_EPOCH)
        .ok()?
        .as_millis();
    Utc.timestamp_millis_opt(i64::try_from(millis).ok()?).single()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str) -> ProviderEntry {
        ProviderEntry {
            path: path.to_string(),
            name: path.to_string(),
            is_dir: false,
            size: 0,
            modified_time: None,
            etag: None,
            mime_type: None,
        }
    }

    #[test]
    fn test_sink_batches_and_reports_closed_receiver() {
        let (tx, mut rx) = mpsc::channel(4);
        let mut sink = EntrySink::new(tx, 2);

        assert!(sink.push(entry("a")));
        assert!(sink.push(entry("b")));
        assert!(sink.push(entry("c")));
        assert!(sink.flush());
        assert_eq!(sink.sent(), 3);

        assert_eq!(rx.try_recv().unwrap().len(), 2);
        assert_eq!(rx.try_recv().unwrap().len(), 1);

        drop(rx);
        assert!(sink.push(entry("d")));
        assert!(!sink.push(entry("e")));
    }

    #[test]
    fn test_io_errors_map_to_typed_failures() {
        let err = io::Error::new(io::ErrorKind::NotFound, "gone");
        assert_eq!(
            ProviderError::from_io("/x", &err),
            ProviderError::NotFound("/x".to_string())
        );
        let err = io::Error::new(io::ErrorKind::PermissionDenied, "no");
        assert!(matches!(
            ProviderError::from_io("/x", &err),
            ProviderError::PermissionDenied(_)
        ));
    }

    #[test]
    fn test_registry_from_default_config() {
        let registry = ProviderRegistry::from_config(&EngineConfig::default()).unwrap();
        assert!(registry.get("local").is_ok());
        assert!(matches!(
            registry.get("nope"),
            Err(EngineError::UnknownProvider(_))
        ));
    }
}
