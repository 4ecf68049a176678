//! Row derivation and hierarchy synthesis.
//!
//! Providers may skip intermediate folders (object stores usually do), but
//! every row in the index needs a folder parent inside the scan. The
//! synthesizer tracks which folders exist so far and emits placeholder rows
//! for the gaps, always ahead of the row that needed them.

use std::collections::HashSet;
use tracing::debug;
use treeline_protocol::paths::{
    ancestors_within, depth_within, extension_of, file_name, parent_within, relative_to,
};
use treeline_protocol::{EntryKind, IndexRow, ProviderEntry, ScanId};

/// Where a provider path falls relative to the scan root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Inside,
    Root,
    Outside,
}

/// Derive the index row for a provider entry inside `root`.
pub fn entry_row(scan_id: &ScanId, root: &str, entry: &ProviderEntry) -> IndexRow {
    let kind = if entry.is_dir {
        EntryKind::Folder
    } else {
        EntryKind::File
    };
    let name = if entry.name.is_empty() {
        file_name(&entry.path).to_string()
    } else {
        entry.name.clone()
    };
    let extension = match kind {
        EntryKind::File => extension_of(&name),
        EntryKind::Folder => None,
    };
    let mime_type = match kind {
        EntryKind::File => entry.mime_type.clone().or_else(|| {
            extension
                .as_deref()
                .and_then(|ext| mime_guess::from_ext(ext).first_raw())
                .map(str::to_string)
        }),
        EntryKind::Folder => None,
    };

    IndexRow {
        scan_id: scan_id.clone(),
        parent_path: parent_within(&entry.path, root).or_else(|| Some(root.to_string())),
        depth: depth_within(&entry.path, root).unwrap_or(1),
        path: entry.path.clone(),
        name,
        kind,
        size: if entry.is_dir { 0 } else { entry.size },
        modified_time: entry.modified_time,
        extension,
        mime_type,
        fingerprint: entry.etag.clone(),
        synthesized: false,
    }
}

pub struct HierarchySynthesizer {
    scan_id: ScanId,
    root: String,
    /// Folder paths already emitted, synthesized or not
    known: HashSet<String>,
    /// Folders emitted as placeholders and not yet seen explicitly
    synthesized: HashSet<String>,
    rejected: u64,
}

impl HierarchySynthesizer {
    pub fn new(scan_id: ScanId, root: impl Into<String>) -> Self {
        let root = root.into();
        let mut known = HashSet::new();
        known.insert(root.clone());
        Self {
            scan_id,
            root,
            known,
            synthesized: HashSet::new(),
            rejected: 0,
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn locate(&self, path: &str) -> Placement {
        match relative_to(path, &self.root) {
            Some("") => Placement::Root,
            Some(_) => Placement::Inside,
            None => Placement::Outside,
        }
    }

    /// Count an entry that fell outside the root.
    pub fn reject(&mut self, path: &str) {
        debug!(path, root = %self.root, "Rejecting entry outside scan root");
        self.rejected += 1;
    }

    pub fn rejected(&self) -> u64 {
        self.rejected
    }

    /// Rows not yet upgraded by an explicit listing of the same folder.
    pub fn synthesized_count(&self) -> u64 {
        self.synthesized.len() as u64
    }

    /// The scan's root folder row.
    pub fn root_row(&self) -> IndexRow {
        IndexRow {
            scan_id: self.scan_id.clone(),
            path: self.root.clone(),
            parent_path: None,
            name: file_name(&self.root).to_string(),
            depth: 0,
            kind: EntryKind::Folder,
            size: 0,
            modified_time: None,
            extension: None,
            mime_type: None,
            fingerprint: None,
            synthesized: false,
        }
    }

    fn placeholder(&self, path: &str) -> IndexRow {
        IndexRow {
            scan_id: self.scan_id.clone(),
            path: path.to_string(),
            parent_path: parent_within(path, &self.root),
            name: file_name(path).to_string(),
            depth: depth_within(path, &self.root).unwrap_or(1),
            kind: EntryKind::Folder,
            size: 0,
            modified_time: None,
            extension: None,
            mime_type: None,
            fingerprint: None,
            synthesized: true,
        }
    }

    /// Rows to write for `row`: any missing ancestors (shallowest first),
    /// then the row itself. `row` must lie inside the root.
    pub fn admit(&mut self, row: IndexRow) -> Vec<IndexRow> {
        let mut out = Vec::new();
        for ancestor in ancestors_within(&row.path, &self.root) {
            if self.known.contains(&ancestor) {
                continue;
            }
            out.push(self.placeholder(&ancestor));
            self.synthesized.insert(ancestor.clone());
            self.known.insert(ancestor);
        }

        if row.is_folder() && !self.known.insert(row.path.clone()) {
            self.synthesized.remove(&row.path);
        }

        debug_assert!(row
            .parent_path
            .as_ref()
            .map_or(false, |p| self.known.contains(p)));
        out.push(row);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(path: &str, is_dir: bool) -> ProviderEntry {
        ProviderEntry {
            path: path.to_string(),
            name: file_name(path).to_string(),
            is_dir,
            size: if is_dir { 0 } else { 10 },
            modified_time: None,
            etag: None,
            mime_type: None,
        }
    }

    fn admit_all(synth: &mut HierarchySynthesizer, entries: &[ProviderEntry]) -> Vec<IndexRow> {
        let scan_id = ScanId::from_string("s");
        let root = synth.root().to_string();
        entries
            .iter()
            .flat_map(|e| synth.admit(entry_row(&scan_id, &root, e)))
            .collect()
    }

    #[test]
    fn test_entry_row_derives_fields() {
        let scan_id = ScanId::from_string("s");
        let row = entry_row(&scan_id, "/data", &entry("/data/sub/Report.CSV", false));
        assert_eq!(row.parent_path.as_deref(), Some("/data/sub"));
        assert_eq!(row.depth, 2);
        assert_eq!(row.extension.as_deref(), Some("csv"));
        assert_eq!(row.mime_type.as_deref(), Some("text/csv"));
        assert!(!row.synthesized);

        let folder = entry_row(&scan_id, "/data", &entry("/data/sub.d", true));
        assert_eq!(folder.kind, EntryKind::Folder);
        assert!(folder.extension.is_none());
        assert!(folder.mime_type.is_none());
    }

    #[test]
    fn test_leaf_only_listing_gets_every_ancestor() {
        let mut synth = HierarchySynthesizer::new(ScanId::from_string("s"), "/r");
        let rows = admit_all(&mut synth, &[entry("/r/a/b/c/leaf.txt", false)]);

        let paths: Vec<_> = rows.iter().map(|r| r.path.as_str()).collect();
        assert_eq!(paths, vec!["/r/a", "/r/a/b", "/r/a/b/c", "/r/a/b/c/leaf.txt"]);
        assert!(rows[..3].iter().all(|r| r.synthesized && r.is_folder() && r.size == 0));
        assert_eq!(rows[0].parent_path.as_deref(), Some("/r"));
        assert_eq!(rows[2].depth, 3);
        assert_eq!(synth.synthesized_count(), 3);
    }

    #[test]
    fn test_out_of_order_arrival_upgrades_placeholder() {
        let mut synth = HierarchySynthesizer::new(ScanId::from_string("s"), "/r");
        let rows = admit_all(
            &mut synth,
            &[entry("/r/a/x.txt", false), entry("/r/a", true), entry("/r/a/y.txt", false)],
        );
        let paths: Vec<_> = rows.iter().map(|r| (r.path.as_str(), r.synthesized)).collect();
        assert_eq!(
            paths,
            vec![
                ("/r/a", true),
                ("/r/a/x.txt", false),
                ("/r/a", false),
                ("/r/a/y.txt", false)
            ]
        );
        assert_eq!(synth.synthesized_count(), 0);
    }

    #[test]
    fn test_reprocessing_is_idempotent() {
        let mut synth = HierarchySynthesizer::new(ScanId::from_string("s"), "/r");
        admit_all(&mut synth, &[entry("/r/a/b/x.txt", false)]);
        let again = admit_all(&mut synth, &[entry("/r/a/b/x.txt", false)]);
        assert_eq!(again.len(), 1);
    }

    #[test]
    fn test_locate_respects_root_boundary() {
        let synth = HierarchySynthesizer::new(ScanId::from_string("s"), "/data");
        assert_eq!(synth.locate("/data/x"), Placement::Inside);
        assert_eq!(synth.locate("/data"), Placement::Root);
        assert_eq!(synth.locate("/database/x"), Placement::Outside);

        let remote = HierarchySynthesizer::new(ScanId::from_string("s"), "gdrive:");
        assert_eq!(remote.locate("gdrive:a/b"), Placement::Inside);
        let rows = {
            let mut remote = remote;
            admit_all(&mut remote, &[entry("gdrive:a/b", false)])
        };
        assert_eq!(rows[0].path, "gdrive:a");
        assert_eq!(rows[0].parent_path.as_deref(), Some("gdrive:"));
    }

    #[test]
    fn test_root_row() {
        let synth = HierarchySynthesizer::new(ScanId::from_string("s"), "/data/projects");
        let root = synth.root_row();
        assert_eq!(root.name, "projects");
        assert_eq!(root.depth, 0);
        assert!(root.parent_path.is_none());
    }
}
