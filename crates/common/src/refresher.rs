//! Directory refresher.
//!
//! Periodically lists the mounted prefix and folds the result into the
//! namespace. Remote additions appear locally, newer remote content replaces
//! clean cached content, and clean entries that vanished remotely are
//! removed. Anything with local changes wins: it is never reverted or
//! removed, and a newer remote version of it is only reported.
//!
//! A listing is a snapshot of the past. The namespace epoch is captured
//! before listing, and entries touched locally after that point (or removed
//! locally after it) are left alone.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use object_store::{RemoteObject, RemoteStore};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::cache::DiskCache;
use crate::error::FsError;
use crate::events::{EventSender, FsEvent};
use crate::namespace::{EntryAttr, EntryKind, Namespace};
use crate::path::{self, KeyMapper, RemoteKey, ROOT};
use crate::uploader::Uploader;

/// One listing of the mounted prefix, mapped onto paths.
#[derive(Debug, Clone, Default)]
pub struct RemoteSnapshot {
    pub files: BTreeMap<String, RemoteObject>,
    /// Explicit (marker) and implied (ancestor of a key) directories.
    pub dirs: BTreeSet<String>,
    /// Namespace epoch captured before the listing was requested.
    pub epoch: u64,
}

impl RemoteSnapshot {
    pub fn from_listing(keys: &KeyMapper, objects: Vec<RemoteObject>, epoch: u64) -> Self {
        let mut files = BTreeMap::new();
        let mut dirs = BTreeSet::new();
        for object in objects {
            match keys.classify(&object.key) {
                Some(RemoteKey::File(path)) => {
                    add_ancestors(&mut dirs, &path);
                    files.insert(path, object);
                }
                Some(RemoteKey::Directory(dir)) => {
                    add_ancestors(&mut dirs, &dir);
                    if dir != ROOT {
                        dirs.insert(dir);
                    }
                }
                None => debug!(key = %object.key, "ignoring unmappable key"),
            }
        }

        // A key that is both an object and a key prefix shows as a directory.
        files.retain(|path, object| {
            let shadowed = dirs.contains(path);
            if shadowed {
                warn!(path, key = %object.key, "object shadowed by directory of the same name");
            }
            !shadowed
        });

        Self { files, dirs, epoch }
    }
}

fn add_ancestors(dirs: &mut BTreeSet<String>, path: &str) {
    let mut current = path::parent(path);
    while current != ROOT {
        if !dirs.insert(current.to_string()) {
            break;
        }
        current = path::parent(current);
    }
}

/// What one reconcile pass changed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconcileStats {
    pub inserted: usize,
    pub refreshed: usize,
    pub removed: usize,
    /// Remote changes ignored because the local entry has changes of its own.
    pub conflicts: usize,
    /// Entries left alone because they changed locally during the listing
    /// or still have remote work queued.
    pub skipped: usize,
}

impl ReconcileStats {
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

enum FileOutcome {
    Unchanged,
    Updated,
    Conflict,
    Skipped,
}

#[derive(Debug)]
pub struct Refresher {
    namespace: Arc<Namespace>,
    cache: Arc<DiskCache>,
    uploader: Arc<Uploader>,
    store: Arc<dyn RemoteStore>,
    keys: KeyMapper,
    events: EventSender,
    /// Serialises passes started by the timer and on demand.
    running: tokio::sync::Mutex<()>,
}

impl Refresher {
    pub fn new(
        namespace: Arc<Namespace>,
        cache: Arc<DiskCache>,
        uploader: Arc<Uploader>,
        store: Arc<dyn RemoteStore>,
        keys: KeyMapper,
        events: EventSender,
    ) -> Self {
        Self {
            namespace,
            cache,
            uploader,
            store,
            keys,
            events,
            running: tokio::sync::Mutex::new(()),
        }
    }

    /// List the bucket and reconcile. A failed listing changes nothing.
    pub async fn refresh_once(&self) -> Result<ReconcileStats, FsError> {
        let _running = self.running.lock().await;
        let epoch = self.namespace.epoch();
        let objects = self.store.list(self.keys.list_prefix()).await?;
        let snapshot = RemoteSnapshot::from_listing(&self.keys, objects, epoch);
        let stats = self.reconcile(&snapshot);
        if stats.is_empty() {
            debug!(objects = snapshot.files.len(), "refresh found no changes");
        } else {
            info!(
                inserted = stats.inserted,
                refreshed = stats.refreshed,
                removed = stats.removed,
                conflicts = stats.conflicts,
                skipped = stats.skipped,
                "refresh applied remote changes"
            );
        }
        Ok(stats)
    }

    /// Fold `snapshot` into the namespace.
    pub fn reconcile(&self, snapshot: &RemoteSnapshot) -> ReconcileStats {
        let mut stats = ReconcileStats::default();
        let epoch = snapshot.epoch;

        // Sorted, so parents come before their children.
        for dir in &snapshot.dirs {
            match self.namespace.node(dir) {
                Some(node) if node.is_dir() => {}
                Some(_) => {
                    warn!(path = %dir, "remote directory collides with a local file");
                    stats.conflicts += 1;
                }
                None if self.namespace.removed_since(dir, epoch) => stats.skipped += 1,
                None => {
                    if self.insert_remote(dir, EntryKind::Directory, EntryAttr::remote_dir()) {
                        stats.inserted += 1;
                    } else {
                        stats.skipped += 1;
                    }
                }
            }
        }

        for (path, object) in &snapshot.files {
            match self.reconcile_file(path, object, epoch) {
                Some(FileOutcome::Unchanged) => {}
                Some(FileOutcome::Updated) => {
                    stats.refreshed += 1;
                    self.events.emit(FsEvent::RemoteChanged { path: path.clone() });
                }
                Some(FileOutcome::Conflict) => {
                    let conflict = FsError::ConflictIgnored(path.clone());
                    warn!(path, remote_modified = ?object.modified, "{conflict}");
                    stats.conflicts += 1;
                }
                Some(FileOutcome::Skipped) => stats.skipped += 1,
                None => {
                    stats.inserted += 1;
                    self.events.emit(FsEvent::RemoteAdded { path: path.clone() });
                }
            }
        }

        self.remove_vanished(snapshot, &mut stats);
        self.namespace.prune_tombstones(epoch);
        stats
    }

    fn insert_remote(&self, path: &str, kind: EntryKind, attr: EntryAttr) -> bool {
        let inserted = self
            .namespace
            .ensure_parents(path)
            .and_then(|()| self.namespace.insert(path, kind, attr));
        match inserted {
            Ok(_) => true,
            Err(err) => {
                debug!(path, error = %err, "remote entry not inserted");
                false
            }
        }
    }

    /// `None` when the file was inserted.
    fn reconcile_file(&self, path: &str, object: &RemoteObject, epoch: u64) -> Option<FileOutcome> {
        if self.uploader.has_outstanding(&object.key) {
            return Some(FileOutcome::Skipped);
        }

        let Some(node) = self.namespace.node(path) else {
            if self.namespace.removed_since(path, epoch) {
                return Some(FileOutcome::Skipped);
            }
            let attr = EntryAttr::remote_file(object.key.clone(), object.size, object.modified);
            return if self.insert_remote(path, EntryKind::File, attr) {
                None
            } else {
                Some(FileOutcome::Skipped)
            };
        };
        if node.is_dir() {
            warn!(path, "remote file collides with a local directory");
            return Some(FileOutcome::Conflict);
        }

        let outcome = self.namespace.observe_node(&node, |attr| {
            if attr.epoch > epoch || attr.linked.as_deref() != Some(path) {
                return FileOutcome::Skipped;
            }
            if !attr.state.is_clean() {
                return match attr.remote_mtime {
                    Some(seen) if object.modified > seen => FileOutcome::Conflict,
                    Some(_) => FileOutcome::Unchanged,
                    None => {
                        attr.remote_mtime = Some(object.modified);
                        FileOutcome::Unchanged
                    }
                };
            }

            let changed = match attr.remote_mtime {
                // First listing after our own upload: adopt what the bucket
                // reports. Only a size mismatch means someone else wrote.
                None => attr.size != object.size,
                Some(seen) => object.modified > seen,
            };
            attr.remote_mtime = Some(object.modified);
            attr.remote_key = Some(object.key.clone());
            if !changed {
                return FileOutcome::Unchanged;
            }
            attr.size = object.size;
            attr.mtime = object.modified;
            attr.ctime = SystemTime::now();
            self.cache.invalidate(path);
            FileOutcome::Updated
        });
        Some(outcome)
    }

    /// Remove clean local entries with no remote counterpart, deepest first.
    fn remove_vanished(&self, snapshot: &RemoteSnapshot, stats: &mut ReconcileStats) {
        let mut candidates: Vec<(String, bool)> = self
            .namespace
            .entries()
            .into_iter()
            .filter(|(path, node)| {
                path != ROOT
                    && if node.is_dir() {
                        !snapshot.dirs.contains(path)
                    } else {
                        !snapshot.files.contains_key(path)
                    }
            })
            .map(|(path, node)| (path, node.is_dir()))
            .collect();
        candidates.sort_by(|(a, _), (b, _)| path::depth(b).cmp(&path::depth(a)).then(a.cmp(b)));

        for (path, is_dir) in candidates {
            let key = if is_dir {
                self.keys.marker_key(&path)
            } else {
                self.keys.file_key(&path)
            };
            if self.uploader.has_outstanding(&key) {
                continue;
            }
            let removed = self.namespace.remove_observed(&path, |entry| {
                let vanished = entry.is_dir() == is_dir
                    && entry.state().is_clean()
                    && entry.attr.epoch <= snapshot.epoch;
                if vanished && !is_dir {
                    self.cache.remove(&path);
                }
                vanished
            });
            match removed {
                Ok(Some(_)) => {
                    debug!(path, "removed entry deleted remotely");
                    stats.removed += 1;
                    self.events.emit(FsEvent::RemoteRemoved { path });
                }
                Ok(None) => {}
                // Still holds local children; kept.
                Err(FsError::DirectoryNotEmpty(_)) => {}
                Err(err) => debug!(path, error = %err, "vanished entry not removed"),
            }
        }
    }

    /// Run passes every `period` until the task is aborted. The first pass
    /// happens one period from now.
    pub fn spawn(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = self.refresh_once().await {
                    warn!(error = %err, "directory refresh failed");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::UNIX_EPOCH;

    use super::*;

    fn object(key: &str, size: u64) -> RemoteObject {
        RemoteObject {
            key: key.to_string(),
            size,
            modified: UNIX_EPOCH + Duration::from_secs(100),
        }
    }

    #[test]
    fn test_snapshot_maps_files_markers_and_implied_dirs() {
        let keys = KeyMapper::new("p");
        let snapshot = RemoteSnapshot::from_listing(
            &keys,
            vec![
                object("p/a/b/c.txt", 3),
                object("p/empty/.bucketfs-dir", 0),
                object("p/folder/", 0),
                object("p/top.txt", 1),
                object("elsewhere/x", 1),
            ],
            7,
        );
        assert_eq!(
            snapshot.files.keys().collect::<Vec<_>>(),
            vec!["/a/b/c.txt", "/top.txt"]
        );
        assert_eq!(
            snapshot.dirs.iter().collect::<Vec<_>>(),
            vec!["/a", "/a/b", "/empty", "/folder"]
        );
        assert_eq!(snapshot.epoch, 7);
    }

    #[test]
    fn test_snapshot_directory_shadows_object() {
        let keys = KeyMapper::new("");
        let snapshot =
            RemoteSnapshot::from_listing(&keys, vec![object("a", 1), object("a/b", 1)], 0);
        assert!(snapshot.dirs.contains("/a"));
        assert!(!snapshot.files.contains_key("/a"));
        assert!(snapshot.files.contains_key("/a/b"));
    }
}
