//! Provider for a mounted network share.
//!
//! Listing is identical to the local provider; the difference is that a
//! missing mount point means the share is unavailable, not that the root
//! does not exist.

use super::{EntrySink, ListingStats, LocalProvider, Provider, ProviderError};
use crate::tasks::CancellationToken;
use std::path::PathBuf;
use treeline_protocol::paths::{normalize_root, path_to_forward_slashes, relative_to};

pub struct MountedProvider {
    id: String,
    mount_point: PathBuf,
    inner: LocalProvider,
}

impl MountedProvider {
    pub fn new(id: &str, mount_point: PathBuf, exclude_dir_names: Vec<String>) -> Self {
        Self {
            id: id.to_string(),
            inner: LocalProvider::new(id, exclude_dir_names),
            mount_point,
        }
    }

    fn check_mount(&self, root: &str) -> Result<(), ProviderError> {
        let mount = normalize_root(&path_to_forward_slashes(&self.mount_point));
        match std::fs::metadata(&self.mount_point) {
            Ok(meta) if meta.is_dir() => {}
            _ => {
                return Err(ProviderError::Unavailable(format!(
                    "mount point {} is not available",
                    mount
                )))
            }
        }
        if relative_to(root, &mount).is_none() {
            return Err(ProviderError::NotFound(format!(
                "{} is outside mount point {}",
                root, mount
            )));
        }
        Ok(())
    }
}

impl Provider for MountedProvider {
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
        self.check_mount(root)?;
        self.inner.walk(root, recursive, sink, stop)
    }

    fn estimate_total(
        &self,
        root: &str,
        recursive: bool,
        stop: &CancellationToken,
    ) -> Result<Option<u64>, ProviderError> {
        self.check_mount(root)?;
        self.inner.count(root, recursive, stop)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_missing_mount_is_unavailable() {
        let provider = MountedProvider::new("nas", PathBuf::from("/mnt/not-mounted-here"), Vec::new());
        let (tx, _rx) = mpsc::channel(1);
        let mut sink = EntrySink::new(tx, 1);
        let err = provider
            .list_entries("/mnt/not-mounted-here/share", true, &mut sink, &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable(_)));
    }

    #[test]
    fn test_root_outside_mount_is_not_found() {
        let mount = tempfile::tempdir().unwrap();
        let other = tempfile::tempdir().unwrap();
        let provider = MountedProvider::new("nas", mount.path().to_path_buf(), Vec::new());

        let root = path_to_forward_slashes(other.path());
        let err = provider
            .estimate_total(&root, true, &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, ProviderError::NotFound(_)));
    }

    #[test]
    fn test_lists_inside_mount() {
        let mount = tempfile::tempdir().unwrap();
        std::fs::create_dir(mount.path().join("share")).unwrap();
        std::fs::write(mount.path().join("share/a.txt"), b"a").unwrap();
        let provider = MountedProvider::new("nas", mount.path().to_path_buf(), Vec::new());

        let root = path_to_forward_slashes(&mount.path().join("share"));
        let total = provider
            .estimate_total(&root, true, &CancellationToken::new())
            .unwrap();
        assert_eq!(total, Some(1));
    }
}
