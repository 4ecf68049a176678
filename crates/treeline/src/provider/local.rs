//! Local filesystem provider.

use super::{system_time_to_utc, EntrySink, ListingStats, Provider, ProviderError};
use crate::tasks::CancellationToken;
use ignore::{DirEntry, Walk, WalkBuilder};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};
use treeline_protocol::paths::{file_name, path_to_forward_slashes};
use treeline_protocol::ProviderEntry;

/// Walks a local directory tree. Symlinks are never followed or reported.
pub struct LocalProvider {
    id: String,
    exclude_dir_names: Arc<[String]>,
}

impl LocalProvider {
    pub fn new(id: &str, exclude_dir_names: Vec<String>) -> Self {
        Self {
            id: id.to_string(),
            exclude_dir_names: Arc::from(exclude_dir_names),
        }
    }

    fn check_root(root: &str) -> Result<(), ProviderError> {
        let meta = std::fs::metadata(root).map_err(|e| ProviderError::from_io(root, &e))?;
        if !meta.is_dir() {
            return Err(ProviderError::NotFound(format!("{} is not a directory", root)));
        }
        Ok(())
    }

    fn walker(&self, root: &str, recursive: bool) -> Walk {
        let excludes = Arc::clone(&self.exclude_dir_names);
        let mut builder = WalkBuilder::new(Path::new(root));
        builder
            .hidden(false)
            .parents(false)
            .ignore(false)
            .git_ignore(false)
            .git_global(false)
            .git_exclude(false)
            .follow_links(false)
            .filter_entry(move |entry| {
                if entry.depth() == 0 || !entry.file_type().map_or(false, |ft| ft.is_dir()) {
                    return true;
                }
                let name = entry.file_name().to_string_lossy();
                !excludes.iter().any(|ex| *ex == name)
            });
        if !recursive {
            builder.max_depth(Some(1));
        }
        builder.build()
    }

    pub(crate) fn walk(
        &self,
        root: &str,
        recursive: bool,
        sink: &mut EntrySink,
        stop: &CancellationToken,
    ) -> Result<ListingStats, ProviderError> {
        Self::check_root(root)?;
        let mut stats = ListingStats::default();

        for result in self.walker(root, recursive) {
            if stop.is_cancelled() {
                debug!(root, "Listing stopped");
                break;
            }
            let entry = match result {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(root, error = %err, "Skipping unreadable entry");
                    stats.skipped += 1;
                    continue;
                }
            };
            if entry.depth() == 0 {
                continue;
            }
            if entry.path_is_symlink() {
                stats.skipped += 1;
                continue;
            }
            let Some(normalized) = to_provider_entry(&entry) else {
                stats.skipped += 1;
                continue;
            };
            stats.entries += 1;
            if !sink.push(normalized) {
                debug!(root, "Receiver closed, stopping walk");
                break;
            }
        }

        Ok(stats)
    }

    pub(crate) fn count(
        &self,
        root: &str,
        recursive: bool,
        stop: &CancellationToken,
    ) -> Result<Option<u64>, ProviderError> {
        Self::check_root(root)?;
        let mut total = 0u64;
        for entry in self.walker(root, recursive).flatten() {
            if stop.is_cancelled() {
                return Ok(None);
            }
            if entry.depth() > 0 && !entry.path_is_symlink() {
                total += 1;
            }
        }
        Ok(Some(total))
    }
}

fn to_provider_entry(entry: &DirEntry) -> Option<ProviderEntry> {
    let metadata = match entry.metadata() {
        Ok(m) => m,
        Err(err) => {
            warn!(path = %entry.path().display(), error = %err, "Skipping entry without metadata");
            return None;
        }
    };
    let path = path_to_forward_slashes(entry.path());
    let is_dir = metadata.is_dir();
    Some(ProviderEntry {
        name: file_name(&path).to_string(),
        size: if is_dir { 0 } else { metadata.len() },
        modified_time: metadata.modified().ok().and_then(system_time_to_utc),
        is_dir,
        etag: None,
        mime_type: None,
        path,
    })
}

impl Provider for LocalProvider {
    fn id(&self) -> &str {
        &self.id
    }

    fn list_entries(
        &self,
        root: &str,
        recursive: bool,
        sink: &mut EntrySink,
        stop: &CancellationToken,
    ) -> Result<ListingStats, ProviderError> {
        self.walk(root, recursive, sink, stop)
    }

    fn estimate_total(
        &self,
        root: &str,
        recursive: bool,
        stop: &CancellationToken,
    ) -> Result<Option<u64>, ProviderError> {
        self.count(root, recursive, stop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tokio::sync::mpsc;

    fn collect(provider: &LocalProvider, root: &str, recursive: bool) -> Vec<ProviderEntry> {
        let (tx, mut rx) = mpsc::channel(64);
        let mut sink = EntrySink::new(tx, 3);
        provider
            .list_entries(root, recursive, &mut sink, &CancellationToken::new())
            .unwrap();
        sink.flush();
        drop(sink);

        let mut out = Vec::new();
        while let Ok(batch) = rx.try_recv() {
            out.extend(batch);
        }
        out.sort_by(|a, b| a.path.cmp(&b.path));
        out
    }

    fn tree() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        fs::create_dir_all(dir.path().join("sub/deeper")).unwrap();
        fs::write(dir.path().join("sub/b.txt"), b"hi").unwrap();
        fs::write(dir.path().join("sub/deeper/c.csv"), b"x,y").unwrap();
        fs::create_dir_all(dir.path().join("node_modules/pkg")).unwrap();
        fs::write(dir.path().join("node_modules/pkg/index.js"), b"").unwrap();
        dir
    }

    fn root_of(dir: &tempfile::TempDir) -> String {
        path_to_forward_slashes(dir.path())
    }

    #[test]
    fn test_non_recursive_lists_direct_children() {
        let dir = tree();
        let root = root_of(&dir);
        let provider = LocalProvider::new("local", vec!["node_modules".to_string()]);

        let entries = collect(&provider, &root, false);
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.txt", "sub"]);
        assert!(entries[1].is_dir);
        assert_eq!(entries[0].size, 5);
        assert!(entries[0].modified_time.is_some());
    }

    #[test]
    fn test_recursive_skips_excluded_dirs() {
        let dir = tree();
        let root = root_of(&dir);
        let provider = LocalProvider::new("local", vec!["node_modules".to_string()]);

        let entries = collect(&provider, &root, true);
        let rel: Vec<_> = entries
            .iter()
            .map(|e| e.path.strip_prefix(&root).unwrap().to_string())
            .collect();
        assert_eq!(
            rel,
            vec!["/a.txt", "/sub", "/sub/b.txt", "/sub/deeper", "/sub/deeper/c.csv"]
        );

        let total = provider
            .estimate_total(&root, true, &CancellationToken::new())
            .unwrap();
        assert_eq!(total, Some(5));
    }

    #[test]
    fn test_missing_root_is_not_found() {
        let provider = LocalProvider::new("local", Vec::new());
        let (tx, _rx) = mpsc::channel(1);
        let mut sink = EntrySink::new(tx, 1);
        let err = provider
            .list_entries("/definitely/not/here", true, &mut sink, &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, ProviderError::NotFound(_)));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_are_skipped() {
        let dir = tree();
        std::os::unix::fs::symlink(dir.path().join("a.txt"), dir.path().join("link.txt")).unwrap();
        let provider = LocalProvider::new("local", Vec::new());
        let entries = collect(&provider, &root_of(&dir), false);
        assert!(entries.iter().all(|e| e.name != "link.txt"));
    }
}
