//! File access manifest: path table and policy tree.

pub mod path_table;
pub mod policy;

pub use path_table::{normalize_path, parent_path, PathId, PathTable};
pub use policy::{AccessManifest, FileAccessPolicy, ManifestNode};
