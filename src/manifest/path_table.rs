//! Interned canonical paths referenced by id from wire reports and blobs.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Index into a [`PathTable`]. Zero is reserved for "no path".
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct PathId(u32);

impl PathId {
    pub const INVALID: PathId = PathId(0);

    pub const fn from_raw(raw: u32) -> Self {
        PathId(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Debug for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PathId({})", self.0)
    }
}

fn is_separator(c: char) -> bool {
    c == '/' || c == '\\'
}

/// Length of the root prefix of `path` (`/`, `\`, or a drive root like `C:\`).
fn root_len(path: &str) -> usize {
    let bytes = path.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        if bytes.len() >= 3 && is_separator(bytes[2] as char) {
            3
        } else {
            2
        }
    } else if !bytes.is_empty() && is_separator(bytes[0] as char) {
        1
    } else {
        0
    }
}

/// Strip trailing separators while keeping a bare root intact.
pub fn normalize_path(path: &str) -> &str {
    let root = root_len(path);
    let mut end = path.len();
    while end > root && path[..end].ends_with(is_separator) {
        end -= 1;
    }
    &path[..end]
}

/// Parent of a normalized path, or `None` at a root.
pub fn parent_path(path: &str) -> Option<&str> {
    let path = normalize_path(path);
    let root = root_len(path);
    if path.len() <= root {
        return None;
    }
    match path[root..].rfind(is_separator) {
        Some(idx) => Some(&path[..root + idx]),
        None if root > 0 => Some(&path[..root]),
        None => None,
    }
}

/// Append-only table of canonical path strings.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct PathTable {
    paths: Vec<String>,
    index: HashMap<String, PathId>,
}

impl PathTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern `path` and return its id; repeated calls return the same id.
    pub fn add_path(&mut self, path: &str) -> PathId {
        let canonical = normalize_path(path);
        if let Some(id) = self.index.get(canonical) {
            return *id;
        }
        self.paths.push(canonical.to_string());
        let id = PathId(self.paths.len() as u32);
        self.index.insert(canonical.to_string(), id);
        id
    }

    pub fn lookup(&self, path: &str) -> Option<PathId> {
        self.index.get(normalize_path(path)).copied()
    }

    pub fn get(&self, id: PathId) -> Option<&str> {
        if !id.is_valid() {
            return None;
        }
        self.paths.get(id.0 as usize - 1).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Paths in id order (id = position + 1).
    pub fn iter(&self) -> impl Iterator<Item = (PathId, &str)> {
        self.paths
            .iter()
            .enumerate()
            .map(|(i, p)| (PathId(i as u32 + 1), p.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_stable_and_normalizes_trailing_separators() {
        let mut table = PathTable::new();
        let a = table.add_path("/out/bin/");
        let b = table.add_path("/out/bin");
        assert_eq!(a, b);
        assert_eq!(table.get(a), Some("/out/bin"));
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(PathId::INVALID), None);
    }

    #[test]
    fn parent_walks_unix_and_drive_paths() {
        assert_eq!(parent_path("/a/b/c"), Some("/a/b"));
        assert_eq!(parent_path("/a"), Some("/"));
        assert_eq!(parent_path("/"), None);
        assert_eq!(parent_path(r"C:\foo\bar.txt"), Some(r"C:\foo"));
        assert_eq!(parent_path(r"C:\foo"), Some(r"C:\"));
        assert_eq!(parent_path(r"C:\"), None);
        assert_eq!(parent_path("relative"), None);
    }
}
