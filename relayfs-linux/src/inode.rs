//! Inode numbers for the low-level FUSE protocol.
//!
//! The kernel addresses nodes by number while the relay works on virtual
//! paths, so the bridge keeps the mapping between the two. Numbers are handed
//! out on lookup and dropped once the kernel forgets them.

use std::collections::HashMap;
use std::ffi::OsStr;

use relayfs_core::{RelayError, Result, VirtualPath};

/// Inode number of the mount root.
pub const ROOT_INO: u64 = 1;

#[derive(Debug)]
struct Node {
    /// `None` once the name was unlinked while the kernel still holds the node.
    path: Option<VirtualPath>,
    lookups: u64,
}

/// Bidirectional inode number / virtual path table.
#[derive(Debug)]
pub struct InodeTable {
    nodes: HashMap<u64, Node>,
    by_path: HashMap<VirtualPath, u64>,
    next_ino: u64,
}

impl InodeTable {
    pub fn new() -> Self {
        let mut nodes = HashMap::new();
        let mut by_path = HashMap::new();
        nodes.insert(
            ROOT_INO,
            Node {
                path: Some(VirtualPath::root()),
                lookups: 1,
            },
        );
        by_path.insert(VirtualPath::root(), ROOT_INO);
        Self {
            nodes,
            by_path,
            next_ino: ROOT_INO + 1,
        }
    }

    /// Virtual path of `ino`.
    pub fn path(&self, ino: u64) -> Result<&VirtualPath> {
        self.nodes
            .get(&ino)
            .and_then(|node| node.path.as_ref())
            .ok_or(RelayError::NotFound)
    }

    /// Virtual path of `name` inside directory `parent`.
    pub fn child(&self, parent: u64, name: &OsStr) -> Result<VirtualPath> {
        self.path(parent)?.join(name)
    }

    /// Inode number for `path`, counting one kernel lookup.
    pub fn lookup(&mut self, path: &VirtualPath) -> u64 {
        if let Some(&ino) = self.by_path.get(path) {
            if let Some(node) = self.nodes.get_mut(&ino) {
                node.lookups += 1;
            }
            return ino;
        }
        let ino = self.next_ino;
        self.next_ino += 1;
        self.nodes.insert(
            ino,
            Node {
                path: Some(path.clone()),
                lookups: 1,
            },
        );
        self.by_path.insert(path.clone(), ino);
        ino
    }

    /// Inode number already assigned to `path`, without counting a lookup.
    pub fn peek(&self, path: &VirtualPath) -> Option<u64> {
        self.by_path.get(path).copied()
    }

    /// Drops `count` kernel references; the number is released at zero.
    pub fn forget(&mut self, ino: u64, count: u64) {
        if ino == ROOT_INO {
            return;
        }
        let Some(node) = self.nodes.get_mut(&ino) else {
            return;
        };
        node.lookups = node.lookups.saturating_sub(count);
        if node.lookups == 0 {
            if let Some(node) = self.nodes.remove(&ino) {
                if let Some(path) = node.path {
                    if self.by_path.get(&path) == Some(&ino) {
                        self.by_path.remove(&path);
                    }
                }
            }
        }
    }

    /// Detaches the name `path` from its node.
    pub fn unlink(&mut self, path: &VirtualPath) {
        if let Some(ino) = self.by_path.remove(path) {
            if let Some(node) = self.nodes.get_mut(&ino) {
                node.path = None;
            }
        }
    }

    /// Re-points `from` and everything beneath it to `to`.
    ///
    /// A node previously named `to` (replaced by the rename) is detached.
    pub fn rename(&mut self, from: &VirtualPath, to: &VirtualPath) {
        if from == to {
            return;
        }
        self.unlink(to);

        let moved: Vec<(VirtualPath, u64)> = self
            .by_path
            .iter()
            .filter(|(path, _)| path.starts_with(from))
            .map(|(path, &ino)| (path.clone(), ino))
            .collect();
        for (old, ino) in moved {
            let Some(new) = old.rebase(from, to) else {
                continue;
            };
            self.by_path.remove(&old);
            self.by_path.insert(new.clone(), ino);
            if let Some(node) = self.nodes.get_mut(&ino) {
                node.path = Some(new);
            }
        }
    }

    /// Number of live inode numbers, the root included.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vpath(s: &str) -> VirtualPath {
        VirtualPath::new(s).unwrap()
    }

    #[test]
    fn test_root_is_preassigned() {
        let table = InodeTable::new();
        assert_eq!(table.path(ROOT_INO).unwrap(), &VirtualPath::root());
        assert_eq!(table.child(ROOT_INO, OsStr::new("a")).unwrap(), vpath("/a"));
        assert_eq!(table.path(99).unwrap_err(), RelayError::NotFound);
    }

    #[test]
    fn test_dot_lookups_stay_inside_the_mount() {
        let mut table = InodeTable::new();
        let dir = table.lookup(&vpath("/dir"));
        for parent in [ROOT_INO, dir] {
            for name in [".", ".."] {
                let err = table.child(parent, OsStr::new(name)).unwrap_err();
                assert_eq!(err.errno(), libc::EINVAL);
            }
        }
    }

    #[test]
    fn test_lookup_is_stable_and_counted() {
        let mut table = InodeTable::new();
        let a = table.lookup(&vpath("/a"));
        assert_eq!(table.lookup(&vpath("/a")), a);
        assert_ne!(table.lookup(&vpath("/b")), a);

        table.forget(a, 1);
        assert_eq!(table.path(a).unwrap(), &vpath("/a"));
        table.forget(a, 1);
        assert!(table.path(a).is_err());
        assert_eq!(table.peek(&vpath("/a")), None);

        // A fresh lookup gets a fresh number.
        assert_ne!(table.lookup(&vpath("/a")), a);
    }

    #[test]
    fn test_root_is_never_forgotten() {
        let mut table = InodeTable::new();
        table.forget(ROOT_INO, 100);
        assert!(table.path(ROOT_INO).is_ok());
    }

    #[test]
    fn test_rename_moves_descendants() {
        let mut table = InodeTable::new();
        let dir = table.lookup(&vpath("/dir"));
        let file = table.lookup(&vpath("/dir/sub/file"));
        let sibling = table.lookup(&vpath("/dirt"));

        table.rename(&vpath("/dir"), &vpath("/moved"));
        assert_eq!(table.path(dir).unwrap(), &vpath("/moved"));
        assert_eq!(table.path(file).unwrap(), &vpath("/moved/sub/file"));
        assert_eq!(table.path(sibling).unwrap(), &vpath("/dirt"));
        assert_eq!(table.peek(&vpath("/moved/sub/file")), Some(file));
        assert_eq!(table.peek(&vpath("/dir")), None);
    }

    #[test]
    fn test_rename_over_existing_detaches_target() {
        let mut table = InodeTable::new();
        let a = table.lookup(&vpath("/a"));
        let b = table.lookup(&vpath("/b"));

        table.rename(&vpath("/a"), &vpath("/b"));
        assert_eq!(table.path(a).unwrap(), &vpath("/b"));
        assert!(table.path(b).is_err());

        // Forgetting the detached node must not disturb the new owner of the name.
        table.forget(b, 1);
        assert_eq!(table.peek(&vpath("/b")), Some(a));
    }

    #[test]
    fn test_unlink_detaches_name() {
        let mut table = InodeTable::new();
        let a = table.lookup(&vpath("/a"));
        table.unlink(&vpath("/a"));
        assert!(table.path(a).is_err());
        assert_eq!(table.len(), 2);

        table.forget(a, 1);
        assert_eq!(table.len(), 1);
    }
}
