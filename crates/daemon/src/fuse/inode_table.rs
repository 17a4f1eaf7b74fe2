//! Bidirectional inode ↔ path mapping for the kernel bridge
//!
//! Inode numbers are the engine's entry ids, so the same file keeps its
//! inode across renames. The table only remembers which path an inode was
//! last seen at; renames and removals done through the bridge keep it
//! current, and entries changed behind its back are caught by comparing ids.

use std::collections::HashMap;

use common::path;

#[derive(Debug)]
pub struct InodeTable {
    path_to_inode: HashMap<String, u64>,
    inode_to_path: HashMap<u64, String>,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    /// Root inode number (always 1 in FUSE)
    pub const ROOT_INODE: u64 = 1;

    pub fn new() -> Self {
        let mut table = Self {
            path_to_inode: HashMap::new(),
            inode_to_path: HashMap::new(),
        };
        table.remember(Self::ROOT_INODE, path::ROOT);
        table
    }

    /// Record that `inode` lives at `path`, replacing older mappings of
    /// either side.
    pub fn remember(&mut self, inode: u64, path: &str) {
        if let Some(old_path) = self.inode_to_path.insert(inode, path.to_string()) {
            if old_path != path {
                self.path_to_inode.remove(&old_path);
            }
        }
        if let Some(old_inode) = self.path_to_inode.insert(path.to_string(), inode) {
            if old_inode != inode {
                self.inode_to_path.remove(&old_inode);
            }
        }
    }

    pub fn get_inode(&self, path: &str) -> Option<u64> {
        self.path_to_inode.get(path).copied()
    }

    pub fn get_path(&self, inode: u64) -> Option<&str> {
        self.inode_to_path.get(&inode).map(String::as_str)
    }

    /// Drop the mapping of `inode` (kernel forget). The root is kept.
    pub fn forget(&mut self, inode: u64) -> Option<String> {
        if inode == Self::ROOT_INODE {
            return None;
        }
        let path = self.inode_to_path.remove(&inode)?;
        self.path_to_inode.remove(&path);
        Some(path)
    }

    /// Drop `path` and everything below it.
    pub fn remove_tree(&mut self, root: &str) {
        let doomed: Vec<String> = self
            .path_to_inode
            .keys()
            .filter(|p| p.as_str() == root || path::is_within(p, root))
            .cloned()
            .collect();
        for p in doomed {
            if let Some(inode) = self.path_to_inode.remove(&p) {
                self.inode_to_path.remove(&inode);
            }
        }
    }

    /// Move `from` and its subtree to `to`. Whatever was mapped at `to`
    /// before is dropped.
    pub fn rename(&mut self, from: &str, to: &str) {
        self.remove_tree(to);
        let moved: Vec<(String, u64)> = self
            .path_to_inode
            .iter()
            .filter(|(p, _)| p.as_str() == from || path::is_within(p, from))
            .map(|(p, &inode)| (p.clone(), inode))
            .collect();
        for (old, inode) in moved {
            self.path_to_inode.remove(&old);
            let new = path::rebase(&old, from, to);
            self.inode_to_path.insert(inode, new.clone());
            self.path_to_inode.insert(new, inode);
        }
    }

    pub fn len(&self) -> usize {
        self.inode_to_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inode_to_path.is_empty()
    }
}
