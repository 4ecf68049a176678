//! Selective scan cache.
//!
//! Fingerprints from the last successful scan of a logical root decide
//! which entries can be copied forward instead of re-derived. The cache is
//! keyed by `(provider, root)`, never by scan, and is only replaced when a
//! scan completes.

use crate::error::Result;
use std::collections::HashMap;
use tracing::debug;
use treeline_db::{CacheEntry, FingerprintStore};
use treeline_protocol::paths::logical_root_key;
use treeline_protocol::{IndexRow, ProviderEntry, ScanId};

/// Cheap change-detection signature for one entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fingerprint {
    Etag(String),
    SizeMtime { size: u64, mtime_ms: Option<i64> },
}

impl Fingerprint {
    pub fn of(entry: &ProviderEntry) -> Self {
        match entry.etag.as_deref().filter(|e| !e.is_empty()) {
            Some(etag) => Self::Etag(etag.to_string()),
            None => Self::SizeMtime {
                size: entry.size,
                mtime_ms: entry.modified_time.map(|t| t.timestamp_millis()),
            },
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Self::Etag(etag) => format!("etag:{}", etag),
            Self::SizeMtime { size, mtime_ms } => match mtime_ms {
                Some(ms) => format!("sm:{}:{}", size, ms),
                None => format!("sm:{}:-", size),
            },
        }
    }
}

pub struct SelectiveCache {
    root_key: String,
    previous: HashMap<String, CacheEntry>,
    next: Vec<CacheEntry>,
    hits: u64,
    misses: u64,
}

impl SelectiveCache {
    /// Load the fingerprints recorded by the last completed scan of this root.
    pub async fn load(store: &dyn FingerprintStore, provider_id: &str, root: &str) -> Result<Self> {
        let root_key = logical_root_key(provider_id, root);
        let previous = store.load_root(&root_key).await?;
        debug!(provider_id, root, cached = previous.len(), "Loaded fingerprint cache");
        Ok(Self {
            root_key,
            previous,
            next: Vec::new(),
            hits: 0,
            misses: 0,
        })
    }

    /// Row for `entry`: copied from the previous scan when the fingerprint
    /// matches, otherwise produced by `derive`.
    pub fn resolve<F>(&mut self, scan_id: &ScanId, entry: &ProviderEntry, derive: F) -> IndexRow
    where
        F: FnOnce() -> IndexRow,
    {
        let fingerprint = Fingerprint::of(entry).encode();
        let cached = self
            .previous
            .get(&entry.path)
            .filter(|c| c.fingerprint == fingerprint && c.row.is_folder() == entry.is_dir);

        let row = match cached {
            Some(c) => {
                self.hits += 1;
                c.row.clone().with_scan(scan_id)
            }
            None => {
                self.misses += 1;
                derive()
            }
        };

        self.next.push(CacheEntry {
            fingerprint,
            row: row.clone(),
        });
        row
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn misses(&self) -> u64 {
        self.misses
    }

    /// Replace the root's fingerprints with this scan's. Call only after the
    /// scan has succeeded.
    pub async fn commit(self, store: &dyn FingerprintStore) -> Result<usize> {
        let count = self.next.len();
        store.replace_root(&self.root_key, self.next).await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hierarchy::entry_row;
    use chrono::{TimeZone, Utc};
    use treeline_db::MemoryFingerprints;

    fn entry(path: &str, size: u64, etag: Option<&str>) -> ProviderEntry {
        ProviderEntry {
            path: path.to_string(),
            name: path.rsplit('/').next().unwrap().to_string(),
            is_dir: false,
            size,
            modified_time: Some(Utc.timestamp_millis_opt(1_700_000_000_000).unwrap()),
            etag: etag.map(str::to_string),
            mime_type: None,
        }
    }

    #[test]
    fn test_fingerprint_encoding() {
        assert_eq!(
            Fingerprint::of(&entry("/r/a", 5, Some("md5:abc"))).encode(),
            "etag:md5:abc"
        );
        assert_eq!(
            Fingerprint::of(&entry("/r/a", 5, None)).encode(),
            "sm:5:1700000000000"
        );
        let mut no_mtime = entry("/r/a", 5, None);
        no_mtime.modified_time = None;
        assert_eq!(Fingerprint::of(&no_mtime).encode(), "sm:5:-");
    }

    #[tokio::test]
    async fn test_hits_copy_forward_and_misses_derive() {
        let store = MemoryFingerprints::new();
        let first = ScanId::from_string("first");
        let second = ScanId::from_string("second");

        let mut cache = SelectiveCache::load(&store, "local", "/r").await.unwrap();
        for e in [entry("/r/a.txt", 1, None), entry("/r/b.txt", 2, None)] {
            cache.resolve(&first, &e, || entry_row(&first, "/r", &e));
        }
        assert_eq!((cache.hits(), cache.misses()), (0, 2));
        cache.commit(&store).await.unwrap();

        let mut cache = SelectiveCache::load(&store, "local", "/r").await.unwrap();
        let unchanged = entry("/r/a.txt", 1, None);
        let row = cache.resolve(&second, &unchanged, || panic!("should be a cache hit"));
        assert_eq!(row.scan_id, second);
        assert_eq!(row.path, "/r/a.txt");

        let changed = entry("/r/b.txt", 3, None);
        let row = cache.resolve(&second, &changed, || entry_row(&second, "/r", &changed));
        assert_eq!(row.size, 3);
        assert_eq!((cache.hits(), cache.misses()), (1, 1));
    }

    #[tokio::test]
    async fn test_cache_is_scoped_by_logical_root() {
        let store = MemoryFingerprints::new();
        let scan = ScanId::from_string("s");
        let e = entry("/r/a.txt", 1, None);

        let mut cache = SelectiveCache::load(&store, "local", "/r").await.unwrap();
        cache.resolve(&scan, &e, || entry_row(&scan, "/r", &e));
        cache.commit(&store).await.unwrap();

        let mut other = SelectiveCache::load(&store, "nas", "/r").await.unwrap();
        other.resolve(&scan, &e, || entry_row(&scan, "/r", &e));
        assert_eq!(other.hits(), 0);
    }
}
