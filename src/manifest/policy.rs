//! Access policy tree consulted when the native layer could not resolve a
//! manifest path itself (trusted-tool reports) and shipped to external helpers.

use super::path_table::{normalize_path, parent_path, PathId, PathTable};
use std::collections::HashMap;

crate::flag_set! {
    /// Per-node policy bits of the access manifest
    pub struct FileAccessPolicy: u16 {
        const ALLOW_READ = 0x0001;
        const ALLOW_WRITE = 0x0002;
        const ALLOW_READ_IF_NONEXISTENT = 0x0004;
        const ALLOW_CREATE_DIRECTORY = 0x0008;
        const REPORT_ACCESS = 0x0010;
        const REPORT_ACCESS_IF_EXISTENT = 0x0020;
        const REPORT_ACCESS_IF_NONEXISTENT = 0x0040;
        const OVERRIDE_ALLOW_WRITE_FOR_EXISTING_FILES = 0x0080;
        const REPORT_DIRECTORY_ENUMERATION = 0x0100;
    }
}

impl FileAccessPolicy {
    /// Whether accesses under this policy are reported back at all
    pub fn reports_anything(self) -> bool {
        self.intersects(
            FileAccessPolicy::REPORT_ACCESS
                | FileAccessPolicy::REPORT_ACCESS_IF_EXISTENT
                | FileAccessPolicy::REPORT_ACCESS_IF_NONEXISTENT,
        )
    }
}

/// Policy attached to one path of the manifest.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ManifestNode {
    /// Policy for the path itself
    pub node_policy: FileAccessPolicy,
    /// Policy inherited by descendants without a node of their own; `None`
    /// when the node covers only itself
    pub cone_policy: Option<FileAccessPolicy>,
}

/// Read-only (once built) policy tree keyed by path-table ids.
#[derive(Clone, Debug, PartialEq)]
pub struct AccessManifest {
    path_table: PathTable,
    nodes: HashMap<PathId, ManifestNode>,
    /// Policy applied when no node covers a path
    pub default_policy: FileAccessPolicy,
    /// Report accesses that the native layer classified as unexpected
    pub report_unexpected_file_accesses: bool,
    /// Report every file access, not only unexpected ones
    pub report_file_accesses: bool,
    /// Native layer fails the pip on the first unexpected access
    pub fail_unexpected_file_accesses: bool,
    /// Observe child processes of the primary process
    pub monitor_child_processes: bool,
}

impl Default for AccessManifest {
    fn default() -> Self {
        Self::new()
    }
}

impl AccessManifest {
    pub fn new() -> Self {
        Self {
            path_table: PathTable::new(),
            nodes: HashMap::new(),
            default_policy: FileAccessPolicy::NONE,
            report_unexpected_file_accesses: true,
            report_file_accesses: false,
            fail_unexpected_file_accesses: false,
            monitor_child_processes: true,
        }
    }

    pub fn path_table(&self) -> &PathTable {
        &self.path_table
    }

    pub fn path_table_mut(&mut self) -> &mut PathTable {
        &mut self.path_table
    }

    /// Policy for exactly `path`; descendants are governed by ancestors.
    pub fn add_path(&mut self, path: &str, policy: FileAccessPolicy) -> PathId {
        let id = self.path_table.add_path(path);
        self.nodes.insert(
            id,
            ManifestNode {
                node_policy: policy,
                cone_policy: None,
            },
        );
        id
    }

    /// Policy for `path` and every descendant without a node of its own.
    pub fn add_scope(&mut self, path: &str, policy: FileAccessPolicy) -> PathId {
        let id = self.path_table.add_path(path);
        self.nodes.insert(
            id,
            ManifestNode {
                node_policy: policy,
                cone_policy: Some(policy),
            },
        );
        id
    }

    pub(crate) fn insert_node(&mut self, id: PathId, node: ManifestNode) {
        self.nodes.insert(id, node);
    }

    pub fn node(&self, id: PathId) -> Option<&ManifestNode> {
        self.nodes.get(&id)
    }

    /// Nodes sorted by id, for deterministic serialization.
    pub fn nodes_sorted(&self) -> Vec<(PathId, ManifestNode)> {
        let mut nodes: Vec<_> = self.nodes.iter().map(|(id, n)| (*id, *n)).collect();
        nodes.sort_by_key(|(id, _)| *id);
        nodes
    }

    /// Find the manifest node governing `path`.
    ///
    /// Returns the id of the matched node (the path itself or its closest
    /// scoped ancestor) and the effective policy for `path`.
    pub fn find_manifest_path_for(&self, path: &str) -> Option<(PathId, FileAccessPolicy)> {
        let path = normalize_path(path);
        if let Some(id) = self.path_table.lookup(path) {
            if let Some(node) = self.nodes.get(&id) {
                return Some((id, node.node_policy));
            }
        }

        let mut current = parent_path(path);
        while let Some(ancestor) = current {
            if let Some(id) = self.path_table.lookup(ancestor) {
                if let Some(cone) = self.nodes.get(&id).and_then(|n| n.cone_policy) {
                    return Some((id, cone));
                }
            }
            current = parent_path(ancestor);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_node_wins_over_scope() {
        let mut manifest = AccessManifest::new();
        let scope = manifest.add_scope("/src", FileAccessPolicy::ALLOW_READ);
        let file = manifest.add_path(
            "/src/gen.h",
            FileAccessPolicy::ALLOW_WRITE | FileAccessPolicy::REPORT_ACCESS,
        );

        let (id, policy) = manifest.find_manifest_path_for("/src/gen.h").unwrap();
        assert_eq!(id, file);
        assert!(policy.contains(FileAccessPolicy::ALLOW_WRITE));

        let (id, policy) = manifest.find_manifest_path_for("/src/deep/a.c").unwrap();
        assert_eq!(id, scope);
        assert_eq!(policy, FileAccessPolicy::ALLOW_READ);
        assert!(!policy.reports_anything());
    }

    #[test]
    fn unknown_path_has_no_manifest_node() {
        let mut manifest = AccessManifest::new();
        manifest.add_scope("/src", FileAccessPolicy::ALLOW_READ);
        assert!(manifest.find_manifest_path_for("/tmp/x").is_none());
    }

    #[test]
    fn add_path_does_not_cover_descendants() {
        let mut manifest = AccessManifest::new();
        manifest.add_path("/out", FileAccessPolicy::ALLOW_CREATE_DIRECTORY);
        assert!(manifest.find_manifest_path_for("/out/a.o").is_none());
    }
}
