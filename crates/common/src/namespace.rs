//! In-memory namespace tree.
//!
//! Entries live in a path-keyed index of shared nodes. Each node carries its
//! own attribute lock, and directories additionally own an ordered list of
//! child names behind a separate lock. Structural mutations (insert, remove,
//! rename) take the children lock of every affected directory, always in
//! path order, before touching the index. Attribute updates lock only the
//! entry itself.
//!
//! Every mutation stamps the entry with a fresh epoch. The refresher captures
//! the epoch before listing the bucket and leaves alone anything stamped
//! later, and local removals leave a tombstone so a stale listing cannot
//! resurrect them.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::error::FsError;
use crate::path::{self, ROOT};

pub const ROOT_ID: u64 = 1;

const DEFAULT_FILE_MODE: u32 = 0o644;
const DEFAULT_DIR_MODE: u32 = 0o755;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    File,
    Directory,
}

/// Local write-back state of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryState {
    /// Identical to what the bucket holds.
    Clean,
    /// Changed locally, upload not yet armed.
    Dirty,
    /// Upload armed, waiting for the debounce window.
    Scheduled,
    /// Upload in flight.
    Uploading,
    /// Retries exhausted; the local copy is kept until the next write.
    UploadFailed,
}

impl EntryState {
    pub fn is_clean(self) -> bool {
        self == EntryState::Clean
    }
}

#[derive(Debug, Clone)]
pub struct EntryAttr {
    pub size: u64,
    pub mtime: SystemTime,
    pub atime: SystemTime,
    pub ctime: SystemTime,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub state: EntryState,
    /// Bumped by every local content change.
    pub generation: u64,
    /// Key currently holding this entry's content remotely.
    pub remote_key: Option<String>,
    /// Last remote modification time observed by the refresher. `None` right
    /// after our own upload, so the next listing adopts whatever it sees.
    pub remote_mtime: Option<SystemTime>,
    /// Namespace epoch of the last change.
    pub epoch: u64,
    pub xattrs: BTreeMap<String, Vec<u8>>,
    pub last_error: Option<String>,
    /// Path the node is currently linked at; `None` once removed. Kept under
    /// the entry lock so background work can detect moves without touching
    /// the index.
    pub linked: Option<String>,
}

impl EntryAttr {
    fn with_mode(mode: u32, state: EntryState) -> Self {
        let now = SystemTime::now();
        Self {
            size: 0,
            mtime: now,
            atime: now,
            ctime: now,
            mode,
            uid: current_uid(),
            gid: current_gid(),
            state,
            generation: 0,
            remote_key: None,
            remote_mtime: None,
            epoch: 0,
            xattrs: BTreeMap::new(),
            last_error: None,
            linked: None,
        }
    }

    /// A file created locally, not yet uploaded.
    pub fn new_file(mode: Option<u32>) -> Self {
        Self {
            generation: 1,
            ..Self::with_mode(mode.unwrap_or(DEFAULT_FILE_MODE), EntryState::Dirty)
        }
    }

    /// A directory created locally, marker not yet uploaded.
    pub fn new_dir(mode: Option<u32>) -> Self {
        Self::with_mode(mode.unwrap_or(DEFAULT_DIR_MODE), EntryState::Dirty)
    }

    /// Record a local content change of `size` bytes. Returns the new
    /// generation; an upload that started on an older one will not mark the
    /// entry clean.
    pub fn mark_dirty(&mut self, size: u64) -> u64 {
        let now = SystemTime::now();
        self.size = size;
        self.mtime = now;
        self.ctime = now;
        self.generation += 1;
        self.state = EntryState::Dirty;
        self.last_error = None;
        self.generation
    }

    /// A file observed in the bucket.
    pub fn remote_file(key: String, size: u64, modified: SystemTime) -> Self {
        Self {
            size,
            mtime: modified,
            ctime: modified,
            remote_key: Some(key),
            remote_mtime: Some(modified),
            ..Self::with_mode(DEFAULT_FILE_MODE, EntryState::Clean)
        }
    }

    /// A directory observed in the bucket (explicitly or implied by keys).
    pub fn remote_dir() -> Self {
        Self::with_mode(DEFAULT_DIR_MODE, EntryState::Clean)
    }
}

fn current_uid() -> u32 {
    // SAFETY: getuid has no preconditions and cannot fail.
    unsafe { libc::getuid() }
}

fn current_gid() -> u32 {
    // SAFETY: getgid has no preconditions and cannot fail.
    unsafe { libc::getgid() }
}

#[derive(Debug)]
pub struct Node {
    id: u64,
    kind: EntryKind,
    attr: Mutex<EntryAttr>,
    children: Mutex<Vec<String>>,
}

impl Node {
    fn new(id: u64, kind: EntryKind, attr: EntryAttr) -> Self {
        Self {
            id,
            kind,
            attr: Mutex::new(attr),
            children: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> EntryKind {
        self.kind
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn attr(&self) -> EntryAttr {
        self.attr.lock().clone()
    }

    pub fn state(&self) -> EntryState {
        self.attr.lock().state
    }
}

/// Point-in-time copy of an entry.
#[derive(Debug, Clone)]
pub struct NamespaceEntry {
    pub path: String,
    pub id: u64,
    pub kind: EntryKind,
    pub attr: EntryAttr,
}

impl NamespaceEntry {
    fn of(path: &str, node: &Node) -> Self {
        Self {
            path: path.to_string(),
            id: node.id,
            kind: node.kind,
            attr: node.attr(),
        }
    }

    fn locked(path: &str, node: &Node, attr: &EntryAttr) -> Self {
        Self {
            path: path.to_string(),
            id: node.id,
            kind: node.kind,
            attr: attr.clone(),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    pub fn size(&self) -> u64 {
        self.attr.size
    }

    pub fn state(&self) -> EntryState {
        self.attr.state
    }
}

/// An entry that changed path as part of a rename.
#[derive(Debug, Clone)]
pub struct MovedEntry {
    pub from: String,
    pub to: String,
    pub entry: NamespaceEntry,
}

#[derive(Debug, Clone, Default)]
pub struct RenameOutcome {
    /// The renamed entry first, then its descendants.
    pub moved: Vec<MovedEntry>,
    /// Entry that previously occupied the destination.
    pub replaced: Option<NamespaceEntry>,
}

#[derive(Debug)]
pub struct Namespace {
    nodes: RwLock<HashMap<String, Arc<Node>>>,
    tombstones: Mutex<HashMap<String, u64>>,
    next_id: AtomicU64,
    epoch: AtomicU64,
}

impl Default for Namespace {
    fn default() -> Self {
        Self::new()
    }
}

impl Namespace {
    pub fn new() -> Self {
        let root_attr = EntryAttr {
            linked: Some(ROOT.to_string()),
            ..EntryAttr::remote_dir()
        };
        let root = Arc::new(Node::new(ROOT_ID, EntryKind::Directory, root_attr));
        let mut nodes = HashMap::new();
        nodes.insert(ROOT.to_string(), root);
        Self {
            nodes: RwLock::new(nodes),
            tombstones: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(ROOT_ID + 1),
            epoch: AtomicU64::new(0),
        }
    }

    /// Current epoch. Every later mutation is stamped with a larger value.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn bump_epoch(&self) -> u64 {
        self.epoch.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        // The root always exists.
        self.len() <= 1
    }

    pub fn node(&self, path: &str) -> Option<Arc<Node>> {
        self.nodes.read().get(path).cloned()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.nodes.read().contains_key(path)
    }

    pub fn resolve(&self, path: &str) -> Result<NamespaceEntry, FsError> {
        let node = self
            .node(path)
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        Ok(NamespaceEntry::of(path, &node))
    }

    /// Whether `path` currently maps to exactly this node.
    pub fn is_current(&self, path: &str, node: &Arc<Node>) -> bool {
        self.nodes
            .read()
            .get(path)
            .is_some_and(|current| Arc::ptr_eq(current, node))
    }

    /// Child names of a directory, in insertion order.
    pub fn children(&self, path: &str) -> Result<Vec<String>, FsError> {
        let node = self.dir_node(path)?;
        let names = node.children.lock().clone();
        Ok(names)
    }

    /// Snapshot of every entry.
    pub fn entries(&self) -> Vec<(String, Arc<Node>)> {
        self.nodes
            .read()
            .iter()
            .map(|(path, node)| (path.clone(), node.clone()))
            .collect()
    }

    fn dir_node(&self, path: &str) -> Result<Arc<Node>, FsError> {
        let node = self
            .node(path)
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        if !node.is_dir() {
            return Err(FsError::NotADirectory(path.to_string()));
        }
        Ok(node)
    }

    pub fn insert(
        &self,
        path: &str,
        kind: EntryKind,
        attr: EntryAttr,
    ) -> Result<NamespaceEntry, FsError> {
        if path == ROOT {
            return Err(FsError::AlreadyExists(path.to_string()));
        }
        let parent_path = path::parent(path);
        let parent = self.dir_node(parent_path)?;
        let mut siblings = parent.children.lock();
        let mut nodes = self.nodes.write();

        if !nodes
            .get(parent_path)
            .is_some_and(|current| Arc::ptr_eq(current, &parent))
        {
            return Err(FsError::NotFound(parent_path.to_string()));
        }
        if nodes.contains_key(path) {
            return Err(FsError::AlreadyExists(path.to_string()));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let attr = EntryAttr {
            epoch: self.bump_epoch(),
            linked: Some(path.to_string()),
            ..attr
        };
        let node = Arc::new(Node::new(id, kind, attr));
        nodes.insert(path.to_string(), node.clone());
        siblings.push(path::file_name(path).to_string());

        Ok(NamespaceEntry::of(path, &node))
    }

    /// Create every missing ancestor directory of `path` as a clean entry.
    pub fn ensure_parents(&self, path: &str) -> Result<(), FsError> {
        let mut missing = Vec::new();
        let mut current = path::parent(path);
        while current != ROOT && !self.contains(current) {
            missing.push(current.to_string());
            current = path::parent(current);
        }
        for dir in missing.into_iter().rev() {
            match self.insert(&dir, EntryKind::Directory, EntryAttr::remote_dir()) {
                Ok(_) | Err(FsError::AlreadyExists(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    pub fn remove(&self, path: &str) -> Result<NamespaceEntry, FsError> {
        self.remove_where(path, |_| true)?
            .ok_or_else(|| FsError::NotFound(path.to_string()))
    }

    /// Remove `path` if `keep_going` approves the entry as it is now.
    /// Returns `Ok(None)` when the predicate declined. Leaves a tombstone.
    ///
    /// The predicate runs with the index locked, so path-keyed state can be
    /// dropped there without racing a new entry at the same path.
    pub fn remove_where(
        &self,
        path: &str,
        keep_going: impl FnOnce(&NamespaceEntry) -> bool,
    ) -> Result<Option<NamespaceEntry>, FsError> {
        self.remove_inner(path, keep_going, true)
    }

    /// Like [`Namespace::remove_where`], for entries whose remote counterpart
    /// disappeared. No tombstone is recorded.
    pub fn remove_observed(
        &self,
        path: &str,
        keep_going: impl FnOnce(&NamespaceEntry) -> bool,
    ) -> Result<Option<NamespaceEntry>, FsError> {
        self.remove_inner(path, keep_going, false)
    }

    fn remove_inner(
        &self,
        path: &str,
        keep_going: impl FnOnce(&NamespaceEntry) -> bool,
        tombstone: bool,
    ) -> Result<Option<NamespaceEntry>, FsError> {
        if path == ROOT {
            return Err(FsError::InvalidPath(path.to_string()));
        }
        let parent_path = path::parent(path);
        let parent = self.dir_node(parent_path)?;
        let mut siblings = parent.children.lock();
        let node = self
            .node(path)
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        let own_children = node.is_dir().then(|| node.children.lock());
        if own_children.as_ref().is_some_and(|c| !c.is_empty()) {
            return Err(FsError::DirectoryNotEmpty(path.to_string()));
        }

        let mut nodes = self.nodes.write();
        if !nodes
            .get(path)
            .is_some_and(|current| Arc::ptr_eq(current, &node))
        {
            return Err(FsError::NotFound(path.to_string()));
        }
        let entry = NamespaceEntry::of(path, &node);
        if !keep_going(&entry) {
            return Ok(None);
        }

        nodes.remove(path);
        let name = path::file_name(path);
        siblings.retain(|n| n != name);
        let epoch = self.bump_epoch();
        {
            let mut attr = node.attr.lock();
            attr.linked = None;
            attr.epoch = epoch;
        }
        drop(nodes);
        drop(own_children);

        if tombstone {
            self.tombstones.lock().insert(path.to_string(), epoch);
        }
        Ok(Some(entry))
    }

    /// Whether `path` was removed locally after `epoch`.
    pub fn removed_since(&self, path: &str, epoch: u64) -> bool {
        self.tombstones
            .lock()
            .get(path)
            .is_some_and(|removed| *removed > epoch)
    }

    /// Restamp the tombstone of a removed `path` now that its remote object
    /// is gone. Listings that started before this call may still report the
    /// object. No-op when the path has been recreated.
    pub fn confirm_remote_removal(&self, path: &str) {
        if self.contains(path) {
            return;
        }
        let epoch = self.bump_epoch();
        self.tombstones.lock().insert(path.to_string(), epoch);
    }

    /// Forget tombstones that no listing started at or after `epoch` can see.
    pub fn prune_tombstones(&self, epoch: u64) {
        self.tombstones.lock().retain(|_, removed| *removed > epoch);
    }

    /// Atomically move `from` (and its subtree, for a directory) to `to`.
    ///
    /// A file may replace a file and a directory may replace an empty
    /// directory. Moving a directory into itself is rejected.
    pub fn rename(&self, from: &str, to: &str) -> Result<RenameOutcome, FsError> {
        self.rename_with(from, to, |_| {})
    }

    /// [`Namespace::rename`], running `moved_hook` while the index and every
    /// affected entry are still locked, so state keyed by path can follow the
    /// entries atomically. The hook must not call back into the namespace.
    pub fn rename_with(
        &self,
        from: &str,
        to: &str,
        moved_hook: impl FnOnce(&RenameOutcome),
    ) -> Result<RenameOutcome, FsError> {
        if from == ROOT || to == ROOT {
            return Err(FsError::InvalidPath(format!("{from} -> {to}")));
        }
        if from == to {
            let entry = self.resolve(from)?;
            return Ok(RenameOutcome {
                moved: vec![MovedEntry {
                    from: from.to_string(),
                    to: to.to_string(),
                    entry,
                }],
                replaced: None,
            });
        }
        if path::is_within(to, from) {
            return Err(FsError::InvalidPath(format!(
                "cannot move {from} into itself ({to})"
            )));
        }
        if path::is_within(from, to) {
            return Err(FsError::DirectoryNotEmpty(to.to_string()));
        }

        let from_parent_path = path::parent(from);
        let to_parent_path = path::parent(to);
        let from_parent = self.dir_node(from_parent_path)?;
        let to_parent = self.dir_node(to_parent_path)?;

        let (mut from_siblings, mut to_siblings) =
            lock_pair(from_parent_path, &from_parent, to_parent_path, &to_parent);
        let mut nodes = self.nodes.write();

        let parents_current = nodes
            .get(from_parent_path)
            .is_some_and(|n| Arc::ptr_eq(n, &from_parent))
            && nodes
                .get(to_parent_path)
                .is_some_and(|n| Arc::ptr_eq(n, &to_parent));
        if !parents_current {
            return Err(FsError::NotFound(from_parent_path.to_string()));
        }

        let node = nodes
            .get(from)
            .cloned()
            .ok_or_else(|| FsError::NotFound(from.to_string()))?;

        let replaced_node = match nodes.get(to).cloned() {
            Some(existing) => {
                match (node.is_dir(), existing.is_dir()) {
                    (true, false) => return Err(FsError::NotADirectory(to.to_string())),
                    (false, true) => return Err(FsError::IsADirectory(to.to_string())),
                    (true, true) => {
                        let has_children = nodes.keys().any(|k| path::is_within(k, to));
                        if has_children {
                            return Err(FsError::DirectoryNotEmpty(to.to_string()));
                        }
                    }
                    (false, false) => {}
                }
                nodes.remove(to);
                Some(existing)
            }
            None => None,
        };

        let mut subtree: Vec<String> = nodes
            .keys()
            .filter(|k| path::is_within(k, from))
            .cloned()
            .collect();
        subtree.sort_by_key(|k| path::depth(k));

        let mut moving = Vec::with_capacity(subtree.len() + 1);
        for old_path in std::iter::once(from.to_string()).chain(subtree) {
            if let Some(node) = nodes.remove(&old_path) {
                let new_path = path::rebase(&old_path, from, to);
                moving.push((old_path, new_path, node));
            }
        }
        for (_, new_path, node) in &moving {
            nodes.insert(new_path.clone(), node.clone());
        }

        // Every affected entry stays locked until the hook returns, so no
        // attribute update can observe the new path before state keyed by
        // path has followed it.
        let replaced_guard = replaced_node.as_ref().map(|n| n.attr.lock());
        let replaced = replaced_node
            .as_ref()
            .zip(replaced_guard.as_ref())
            .map(|(n, attr)| NamespaceEntry::locked(to, n, attr));
        let mut guards: Vec<MutexGuard<'_, EntryAttr>> =
            moving.iter().map(|(_, _, n)| n.attr.lock()).collect();
        let mut moved = Vec::with_capacity(moving.len());
        for ((old_path, new_path, node), attr) in moving.iter().zip(guards.iter_mut()) {
            attr.epoch = self.bump_epoch();
            attr.linked = Some(new_path.clone());
            moved.push(MovedEntry {
                from: old_path.clone(),
                to: new_path.clone(),
                entry: NamespaceEntry::locked(new_path, node, attr),
            });
        }
        if let Some(mut attr) = replaced_guard {
            attr.linked = None;
            attr.epoch = self.bump_epoch();
            drop(attr);
        }

        let old_name = path::file_name(from);
        let new_name = path::file_name(to).to_string();
        match to_siblings.as_mut() {
            Some(to_siblings) => {
                from_siblings.retain(|n| n != old_name);
                if !to_siblings.contains(&new_name) {
                    to_siblings.push(new_name);
                }
            }
            None => {
                // Same parent: rename in place, dropping a replaced duplicate.
                from_siblings.retain(|n| *n != new_name);
                if let Some(slot) = from_siblings.iter_mut().find(|n| n.as_str() == old_name) {
                    *slot = new_name;
                }
            }
        }

        let outcome = RenameOutcome { moved, replaced };
        moved_hook(&outcome);
        drop(guards);
        drop(nodes);

        let epoch = self.epoch();
        let mut tombstones = self.tombstones.lock();
        for m in &outcome.moved {
            tombstones.insert(m.from.clone(), epoch);
        }
        drop(tombstones);

        Ok(outcome)
    }

    /// Apply `f` to the attributes of `path` under the entry lock.
    pub fn update<R>(
        &self,
        path: &str,
        f: impl FnOnce(&mut EntryAttr) -> R,
    ) -> Result<R, FsError> {
        let node = self
            .node(path)
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        Ok(self.update_node(&node, f))
    }

    pub fn update_node<R>(&self, node: &Node, f: impl FnOnce(&mut EntryAttr) -> R) -> R {
        let mut attr = node.attr.lock();
        let result = f(&mut attr);
        attr.epoch = self.bump_epoch();
        result
    }

    /// Apply `f` without stamping a new epoch, for changes that mirror the
    /// bucket rather than local activity.
    pub fn observe_node<R>(&self, node: &Node, f: impl FnOnce(&mut EntryAttr) -> R) -> R {
        let mut attr = node.attr.lock();
        f(&mut attr)
    }

    /// Flag `node` clean if its content generation is still `generation`
    /// (or unconditionally when `None`). Returns whether it was marked.
    pub fn mark_clean(&self, node: &Node, generation: Option<u64>) -> bool {
        self.update_node(node, |attr| {
            if generation.is_some_and(|g| g != attr.generation) {
                return false;
            }
            attr.state = EntryState::Clean;
            attr.last_error = None;
            true
        })
    }
}

type ChildrenGuard<'a> = MutexGuard<'a, Vec<String>>;

/// Lock two directories' children in path order. When both paths name the
/// same directory only the first guard is returned.
fn lock_pair<'a>(
    a_path: &str,
    a: &'a Node,
    b_path: &str,
    b: &'a Node,
) -> (ChildrenGuard<'a>, Option<ChildrenGuard<'a>>) {
    if a_path == b_path {
        return (a.children.lock(), None);
    }
    if a_path < b_path {
        let first = a.children.lock();
        let second = b.children.lock();
        (first, Some(second))
    } else {
        let second = b.children.lock();
        let first = a.children.lock();
        (first, Some(second))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(ns: &Namespace, path: &str) -> NamespaceEntry {
        ns.insert(path, EntryKind::File, EntryAttr::new_file(None))
            .unwrap()
    }

    fn dir(ns: &Namespace, path: &str) -> NamespaceEntry {
        ns.insert(path, EntryKind::Directory, EntryAttr::new_dir(None))
            .unwrap()
    }

    #[test]
    fn test_root_exists() {
        let ns = Namespace::new();
        let root = ns.resolve("/").unwrap();
        assert_eq!(root.id, ROOT_ID);
        assert!(root.is_dir());
        assert!(ns.is_empty());
    }

    #[test]
    fn test_insert_resolve_and_children_order() {
        let ns = Namespace::new();
        dir(&ns, "/docs");
        file(&ns, "/docs/b.txt");
        file(&ns, "/docs/a.txt");

        assert_eq!(ns.children("/docs").unwrap(), vec!["b.txt", "a.txt"]);
        assert_eq!(ns.resolve("/docs/a.txt").unwrap().state(), EntryState::Dirty);
        assert!(matches!(
            ns.insert("/docs/a.txt", EntryKind::File, EntryAttr::new_file(None)),
            Err(FsError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_insert_requires_directory_parent() {
        let ns = Namespace::new();
        file(&ns, "/a.txt");
        assert!(matches!(
            ns.insert("/missing/x", EntryKind::File, EntryAttr::new_file(None)),
            Err(FsError::NotFound(_))
        ));
        assert!(matches!(
            ns.insert("/a.txt/x", EntryKind::File, EntryAttr::new_file(None)),
            Err(FsError::NotADirectory(_))
        ));
    }

    #[test]
    fn test_ensure_parents() {
        let ns = Namespace::new();
        ns.ensure_parents("/a/b/c/file.txt").unwrap();
        assert!(ns.resolve("/a/b/c").unwrap().is_dir());
        assert_eq!(ns.resolve("/a").unwrap().state(), EntryState::Clean);
        assert_eq!(ns.children("/a/b").unwrap(), vec!["c"]);
    }

    #[test]
    fn test_remove_non_empty_directory_fails() {
        let ns = Namespace::new();
        dir(&ns, "/d");
        file(&ns, "/d/f");
        assert!(matches!(
            ns.remove("/d"),
            Err(FsError::DirectoryNotEmpty(_))
        ));
        ns.remove("/d/f").unwrap();
        ns.remove("/d").unwrap();
        assert!(ns.children("/").unwrap().is_empty());
        assert!(matches!(ns.remove("/"), Err(FsError::InvalidPath(_))));
    }

    #[test]
    fn test_remove_leaves_tombstone() {
        let ns = Namespace::new();
        file(&ns, "/a");
        let before = ns.epoch();
        ns.remove("/a").unwrap();
        assert!(ns.removed_since("/a", before));
        assert!(!ns.removed_since("/a", ns.epoch()));
        ns.prune_tombstones(ns.epoch());
        assert!(!ns.removed_since("/a", before));
    }

    #[test]
    fn test_confirmed_removal_outlives_listings_started_before_it() {
        let ns = Namespace::new();
        file(&ns, "/a");
        ns.remove("/a").unwrap();
        let listing_started = ns.epoch();

        ns.confirm_remote_removal("/a");
        ns.prune_tombstones(listing_started);
        assert!(ns.removed_since("/a", listing_started));

        ns.prune_tombstones(ns.epoch());
        assert!(!ns.removed_since("/a", listing_started));
    }

    #[test]
    fn test_confirmed_removal_skips_recreated_path() {
        let ns = Namespace::new();
        file(&ns, "/a");
        ns.remove("/a").unwrap();
        file(&ns, "/a");
        let now = ns.epoch();
        ns.confirm_remote_removal("/a");
        assert_eq!(ns.epoch(), now);
        assert!(!ns.removed_since("/a", now));
    }

    #[test]
    fn test_remove_where_respects_predicate() {
        let ns = Namespace::new();
        file(&ns, "/a");
        let removed = ns.remove_observed("/a", |entry| entry.state().is_clean()).unwrap();
        assert!(removed.is_none());
        assert!(ns.contains("/a"));
    }

    #[test]
    fn test_rename_file_and_replace() {
        let ns = Namespace::new();
        let a = file(&ns, "/a");
        let b = file(&ns, "/b");

        let outcome = ns.rename("/a", "/b").unwrap();
        assert_eq!(outcome.moved.len(), 1);
        assert_eq!(outcome.replaced.as_ref().map(|e| e.id), Some(b.id));
        assert_eq!(ns.resolve("/b").unwrap().id, a.id);
        assert!(!ns.contains("/a"));
        assert_eq!(ns.children("/").unwrap(), vec!["b"]);
    }

    #[test]
    fn test_rename_directory_moves_subtree() {
        let ns = Namespace::new();
        dir(&ns, "/src");
        dir(&ns, "/src/inner");
        file(&ns, "/src/inner/f.txt");
        dir(&ns, "/dst");

        let outcome = ns.rename("/src", "/dst/moved").unwrap();
        let moved: Vec<_> = outcome.moved.iter().map(|m| m.to.as_str()).collect();
        assert_eq!(
            moved,
            vec!["/dst/moved", "/dst/moved/inner", "/dst/moved/inner/f.txt"]
        );
        assert!(ns.resolve("/dst/moved/inner/f.txt").is_ok());
        assert!(!ns.contains("/src/inner"));
        assert_eq!(ns.children("/dst").unwrap(), vec!["moved"]);
        assert_eq!(ns.children("/dst/moved").unwrap(), vec!["inner"]);
        assert!(ns.removed_since("/src/inner/f.txt", 0));
    }

    #[test]
    fn test_rename_invalid_cases() {
        let ns = Namespace::new();
        dir(&ns, "/d");
        dir(&ns, "/d/sub");
        file(&ns, "/f");
        dir(&ns, "/full");
        file(&ns, "/full/x");

        assert!(matches!(
            ns.rename("/d", "/d/sub/inside"),
            Err(FsError::InvalidPath(_))
        ));
        assert!(matches!(
            ns.rename("/f", "/d"),
            Err(FsError::IsADirectory(_))
        ));
        assert!(matches!(
            ns.rename("/d", "/f"),
            Err(FsError::NotADirectory(_))
        ));
        assert!(matches!(
            ns.rename("/d", "/full"),
            Err(FsError::DirectoryNotEmpty(_))
        ));
        assert!(matches!(
            ns.rename("/missing", "/x"),
            Err(FsError::NotFound(_))
        ));
    }

    #[test]
    fn test_linked_path_follows_node() {
        let ns = Namespace::new();
        dir(&ns, "/d");
        file(&ns, "/d/f");
        let node = ns.node("/d/f").unwrap();
        assert_eq!(node.attr().linked.as_deref(), Some("/d/f"));

        ns.rename("/d", "/e").unwrap();
        assert_eq!(node.attr().linked.as_deref(), Some("/e/f"));

        ns.remove("/e/f").unwrap();
        assert_eq!(node.attr().linked, None);
    }

    #[test]
    fn test_rename_hook_runs_before_return() {
        let ns = Namespace::new();
        file(&ns, "/a");
        let mut seen = Vec::new();
        ns.rename_with("/a", "/b", |outcome| {
            seen.extend(outcome.moved.iter().map(|m| m.to.clone()));
        })
        .unwrap();
        assert_eq!(seen, vec!["/b"]);
    }

    #[test]
    fn test_rename_in_place_keeps_order() {
        let ns = Namespace::new();
        file(&ns, "/a");
        file(&ns, "/b");
        file(&ns, "/c");
        ns.rename("/b", "/z").unwrap();
        assert_eq!(ns.children("/").unwrap(), vec!["a", "z", "c"]);
    }

    #[test]
    fn test_update_bumps_epoch_and_mark_clean_checks_generation() {
        let ns = Namespace::new();
        file(&ns, "/a");
        let before = ns.resolve("/a").unwrap().attr.epoch;
        let generation = ns.update("/a", |attr| attr.mark_dirty(3)).unwrap();
        assert_eq!(ns.resolve("/a").unwrap().size(), 3);
        assert!(ns.resolve("/a").unwrap().attr.epoch > before);

        let node = ns.node("/a").unwrap();
        assert!(!ns.mark_clean(&node, Some(generation - 1)));
        assert_eq!(node.state(), EntryState::Dirty);
        assert!(ns.mark_clean(&node, Some(generation)));
        assert_eq!(node.state(), EntryState::Clean);
    }
}
