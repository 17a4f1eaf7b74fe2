//! The mounted filesystem.
//!
//! [`BucketFs`] implements every filesystem call on top of the namespace,
//! the disk cache and the write-back pipeline. Calls only wait on the bucket
//! for read-through misses, flushes and unmount; everything else is answered
//! from local state.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use object_store::RemoteStore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::cache::{CacheUsage, DiskCache};
use crate::config::MountConfig;
use crate::error::FsError;
use crate::events::{EventReceiver, EventSender};
use crate::handles::HandleTable;
use crate::namespace::{EntryAttr, EntryKind, Namespace, NamespaceEntry, Node, RenameOutcome};
use crate::path::{self, KeyMapper};
use crate::refresher::{ReconcileStats, Refresher};
use crate::uploader::{Retarget, UploadStats, Uploader, UploaderSettings};

/// Failed uploads are copied here (below the cache dir) at unmount.
const UNSYNCED_DIR: &str = "unsynced";
const EVENT_CAPACITY: usize = 1024;
const BLOCK_SIZE: u32 = 4096;
const NAME_MAX: u32 = 255;
/// Fetch-then-modify rounds before giving up on content that keeps being
/// evicted or invalidated in between.
const CONTENT_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub id: u64,
    pub kind: EntryKind,
}

/// Attribute changes requested by `setattr`. `None` leaves a field alone.
#[derive(Debug, Clone, Default)]
pub struct SetAttr {
    pub size: Option<u64>,
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub atime: Option<SystemTime>,
    pub mtime: Option<SystemTime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsStats {
    pub block_size: u32,
    pub blocks: u64,
    pub blocks_free: u64,
    pub files: u64,
    pub name_max: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnmountReport {
    /// Files whose changes never reached the bucket.
    pub failed: Vec<String>,
    /// Where their content was preserved, if anything was.
    pub preserved_to: Option<PathBuf>,
    pub uploads: UploadStats,
}

#[derive(Debug)]
pub struct BucketFs {
    config: MountConfig,
    cache_dir: PathBuf,
    keys: KeyMapper,
    namespace: Arc<Namespace>,
    cache: Arc<DiskCache>,
    uploader: Arc<Uploader>,
    refresher: Arc<Refresher>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
    handles: HandleTable,
    events: Mutex<Option<EventReceiver>>,
    unmounted: tokio::sync::Mutex<Option<UnmountReport>>,
}

impl BucketFs {
    /// Bring a mount up: open the cache, start the pipeline, load the
    /// initial listing and start periodic refreshes.
    ///
    /// A failed initial listing is not fatal; the mount starts empty and the
    /// next refresh fills it in.
    pub async fn mount(config: MountConfig, store: Arc<dyn RemoteStore>) -> Result<Self, FsError> {
        config.validate()?;
        let cache_dir = config.resolved_cache_dir()?;
        std::fs::create_dir_all(&cache_dir)?;

        let keys = KeyMapper::new(&config.prefix);
        let namespace = Arc::new(Namespace::new());
        let cache = Arc::new(DiskCache::open(
            &cache_dir,
            config.cache_size_bytes(),
            config.memory_cache_bytes(),
            store.clone(),
        )?);
        let (events, events_rx) = EventSender::new(EVENT_CAPACITY);
        let uploader = Arc::new(Uploader::start(
            namespace.clone(),
            cache.clone(),
            store.clone(),
            keys.clone(),
            UploaderSettings {
                workers: config.workers,
                delay: config.upload_delay(),
                retry: config.retry_policy(),
            },
            events.clone(),
        ));
        let refresher = Arc::new(Refresher::new(
            namespace.clone(),
            cache.clone(),
            uploader.clone(),
            store,
            keys.clone(),
            events,
        ));

        match refresher.refresh_once().await {
            Ok(stats) => info!(entries = stats.inserted, "initial listing loaded"),
            Err(err) => warn!(error = %err, "initial listing failed, starting with an empty view"),
        }
        let refresh_task = config
            .update_period()
            .map(|period| refresher.clone().spawn(period));

        info!(
            bucket = %config.bucket,
            prefix = %config.prefix,
            cache_dir = %cache_dir.display(),
            "bucket mounted"
        );
        Ok(Self {
            config,
            cache_dir,
            keys,
            namespace,
            cache,
            uploader,
            refresher,
            refresh_task: Mutex::new(refresh_task),
            handles: HandleTable::new(),
            events: Mutex::new(Some(events_rx)),
            unmounted: tokio::sync::Mutex::new(None),
        })
    }

    pub fn config(&self) -> &MountConfig {
        &self.config
    }

    /// The engine event stream. Can be taken once.
    pub fn take_events(&self) -> Option<EventReceiver> {
        self.events.lock().take()
    }

    fn file_node(&self, path: &str) -> Result<Arc<Node>, FsError> {
        let node = self
            .namespace
            .node(path)
            .ok_or_else(|| FsError::NotFound(path.to_string()))?;
        if node.is_dir() {
            return Err(FsError::IsADirectory(path.to_string()));
        }
        Ok(node)
    }

    fn exhausted(&self, needed: u64) -> FsError {
        FsError::CacheExhausted {
            needed,
            used: self.cache.used(),
            limit: self.cache.limit(),
        }
    }

    pub fn lookup(&self, parent: &str, name: &str) -> Result<NamespaceEntry, FsError> {
        let parent = path::normalize(parent)?;
        let path = path::join(&parent, name)?;
        self.namespace.resolve(&path)
    }

    pub fn getattr(&self, path: &str) -> Result<NamespaceEntry, FsError> {
        self.namespace.resolve(&path::normalize(path)?)
    }

    /// Read up to `len` bytes at `offset`. Reads at or past the end of the
    /// file return nothing.
    pub async fn read(&self, path: &str, offset: u64, len: usize) -> Result<Bytes, FsError> {
        let path = path::normalize(path)?;
        for _ in 0..CONTENT_ATTEMPTS {
            let node = self.file_node(&path)?;
            let attr = node.attr();
            if len == 0 || offset >= attr.size {
                return Ok(Bytes::new());
            }
            self.cache.fetch(&path, attr.remote_key.as_deref()).await?;
            if let Some(data) = self.cache.read(&path, offset, len)? {
                return Ok(data);
            }
            debug!(path, "content dropped between fetch and read, retrying");
        }
        Err(self.exhausted(len as u64))
    }

    /// Make the content of `path` local, then apply `modify` to it under the
    /// entry lock. `modify` gets the path the entry is linked at and returns
    /// the new size, or `None` if the content vanished from the cache.
    async fn modify_content(
        &self,
        path: &str,
        fetch_first: bool,
        modify: impl Fn(&str) -> Result<Option<u64>, FsError>,
    ) -> Result<(), FsError> {
        for _ in 0..CONTENT_ATTEMPTS {
            let node = self.file_node(path)?;
            if fetch_first {
                let remote = node.attr().remote_key;
                self.cache.fetch(path, remote.as_deref()).await?;
            }
            let applied = self.namespace.update_node(&node, |attr| {
                let current = attr
                    .linked
                    .clone()
                    .ok_or_else(|| FsError::NotFound(path.to_string()))?;
                let Some(size) = modify(&current)? else {
                    return Ok(false);
                };
                attr.mark_dirty(size);
                self.uploader.arm_upload(&current, attr);
                Ok::<_, FsError>(true)
            })?;
            if applied {
                self.cache.evict_if_needed();
                return Ok(());
            }
            debug!(path, "content dropped before local change, retrying");
        }
        Err(self.exhausted(0))
    }

    /// Write `data` at `offset`, zero-filling any gap. Never waits on the
    /// bucket unless the file's content has to be fetched first.
    pub async fn write(&self, path: &str, offset: u64, data: &[u8]) -> Result<usize, FsError> {
        let path = path::normalize(path)?;
        self.modify_content(&path, true, |current| {
            self.cache.write_at(current, offset, data)
        })
        .await?;
        Ok(data.len())
    }

    pub async fn truncate(&self, path: &str, size: u64) -> Result<(), FsError> {
        let path = path::normalize(path)?;
        self.modify_content(&path, size != 0, |current| {
            Ok(self.cache.truncate(current, size)?.then_some(size))
        })
        .await
    }

    pub fn create(&self, path: &str, mode: Option<u32>) -> Result<NamespaceEntry, FsError> {
        let path = path::normalize(path)?;
        self.namespace
            .insert(&path, EntryKind::File, EntryAttr::new_file(mode))?;
        if let Err(err) = self.cache.create_empty(&path) {
            if let Err(rollback) = self.namespace.remove(&path) {
                warn!(path, error = %rollback, "failed to roll back file creation");
            }
            return Err(err);
        }
        self.uploader.schedule_upload(&path);
        debug!(path, "created file");
        self.namespace.resolve(&path)
    }

    pub fn mkdir(&self, path: &str, mode: Option<u32>) -> Result<NamespaceEntry, FsError> {
        let path = path::normalize(path)?;
        self.namespace
            .insert(&path, EntryKind::Directory, EntryAttr::new_dir(mode))?;
        self.uploader.schedule_marker(&path);
        debug!(path, "created directory");
        self.namespace.resolve(&path)
    }

    pub fn unlink(&self, path: &str) -> Result<(), FsError> {
        let path = path::normalize(path)?;
        self.file_node(&path)?;
        let removed = self.namespace.remove_where(&path, |entry| {
            if entry.is_dir() {
                return false;
            }
            self.cache.remove(&path);
            self.uploader
                .discard_file(&path, entry.attr.remote_key.as_deref());
            true
        })?;
        match removed {
            Some(_) => {
                debug!(path, "unlinked");
                Ok(())
            }
            None => Err(FsError::IsADirectory(path)),
        }
    }

    pub fn rmdir(&self, path: &str) -> Result<(), FsError> {
        let path = path::normalize(path)?;
        let node = self
            .namespace
            .node(&path)
            .ok_or_else(|| FsError::NotFound(path.clone()))?;
        if !node.is_dir() {
            return Err(FsError::NotADirectory(path));
        }
        let removed = self.namespace.remove_where(&path, |entry| {
            if !entry.is_dir() {
                return false;
            }
            self.uploader.discard_dir(&path);
            true
        })?;
        match removed {
            Some(_) => {
                debug!(path, "removed directory");
                Ok(())
            }
            None => Err(FsError::NotADirectory(path)),
        }
    }

    /// Move an entry (and its subtree). Cached content moves along, and the
    /// remote side is retargeted in one step.
    pub fn rename(&self, from: &str, to: &str) -> Result<(), FsError> {
        let from = path::normalize(from)?;
        let to = path::normalize(to)?;
        let outcome = self
            .namespace
            .rename_with(&from, &to, |outcome| self.follow_rename(outcome))?;
        debug!(from, to, moved = outcome.moved.len(), "renamed");
        Ok(())
    }

    /// Runs with the namespace locked for the rename.
    fn follow_rename(&self, outcome: &RenameOutcome) {
        let mut moves = Vec::with_capacity(outcome.moved.len() + 1);
        if let Some(replaced) = outcome.replaced.as_ref().filter(|r| !r.is_dir()) {
            self.cache.remove(&replaced.path);
            moves.push(Retarget::Discard {
                key: self.keys.file_key(&replaced.path),
                remote: replaced.attr.remote_key.clone(),
            });
        }
        for moved in outcome.moved.iter().filter(|m| m.from != m.to) {
            if moved.entry.is_dir() {
                moves.push(Retarget::Directory {
                    from_marker: self.keys.marker_key(&moved.from),
                    to_marker: self.keys.marker_key(&moved.to),
                });
                continue;
            }
            self.cache.rename(&moved.from, &moved.to);
            let from_key = self.keys.file_key(&moved.from);
            let to_key = self.keys.file_key(&moved.to);
            let attr = &moved.entry.attr;
            moves.push(match &attr.remote_key {
                Some(source) if attr.state.is_clean() => Retarget::CleanFile {
                    from_key,
                    to_key,
                    source: source.clone(),
                },
                stale => Retarget::DirtyFile {
                    from_key,
                    to_key,
                    stale: stale.clone(),
                },
            });
        }
        self.uploader.retarget(&moves);
    }

    /// Children of a directory, in creation order. Never touches the bucket.
    pub fn readdir(&self, path: &str) -> Result<Vec<DirEntry>, FsError> {
        let path = path::normalize(path)?;
        let names = self.namespace.children(&path)?;
        let mut entries = Vec::with_capacity(names.len());
        for name in names {
            let child = path::join(&path, &name)?;
            // Removed since the listing was taken.
            let Some(node) = self.namespace.node(&child) else {
                continue;
            };
            entries.push(DirEntry {
                name,
                id: node.id(),
                kind: node.kind(),
            });
        }
        Ok(entries)
    }

    /// Open a file or directory, truncating a file first when asked to.
    pub async fn open(&self, path: &str, truncate: bool) -> Result<u64, FsError> {
        let path = path::normalize(path)?;
        let node = self
            .namespace
            .node(&path)
            .ok_or_else(|| FsError::NotFound(path.clone()))?;
        if truncate && !node.is_dir() && node.attr().size > 0 {
            self.truncate(&path, 0).await?;
        }
        Ok(self.handles.open(node))
    }

    pub fn release(&self, fh: u64) -> Result<(), FsError> {
        self.handles.release(fh).map(|_| ())
    }

    /// Current path of the entry behind an open handle.
    pub fn handle_path(&self, fh: u64) -> Result<String, FsError> {
        let handle = self.handles.get(fh)?;
        let linked = handle.node.attr().linked;
        linked.ok_or_else(|| FsError::NotFound(format!("handle {fh}")))
    }

    /// Push any pending upload of `path` out now and wait for it.
    pub async fn flush(&self, path: &str) -> Result<(), FsError> {
        let path = path::normalize(path)?;
        if self.namespace.node(&path).is_some_and(|n| n.is_dir()) {
            return Ok(());
        }
        self.uploader.flush(&path).await
    }

    pub async fn fsync(&self, path: &str) -> Result<(), FsError> {
        self.flush(path).await
    }

    /// Apply pass-through metadata, and resize when `size` is set.
    pub async fn setattr(&self, path: &str, changes: SetAttr) -> Result<NamespaceEntry, FsError> {
        let path = path::normalize(path)?;
        if let Some(size) = changes.size {
            self.truncate(&path, size).await?;
        }
        self.namespace.update(&path, |attr| {
            if let Some(mode) = changes.mode {
                attr.mode = mode;
            }
            if let Some(uid) = changes.uid {
                attr.uid = uid;
            }
            if let Some(gid) = changes.gid {
                attr.gid = gid;
            }
            if let Some(atime) = changes.atime {
                attr.atime = atime;
            }
            if let Some(mtime) = changes.mtime {
                attr.mtime = mtime;
            }
            attr.ctime = SystemTime::now();
        })?;
        self.namespace.resolve(&path)
    }

    pub fn getxattr(&self, path: &str, name: &str) -> Result<Vec<u8>, FsError> {
        let path = path::normalize(path)?;
        let entry = self.namespace.resolve(&path)?;
        entry
            .attr
            .xattrs
            .get(name)
            .cloned()
            .ok_or_else(|| FsError::NoAttribute(name.to_string()))
    }

    pub fn setxattr(&self, path: &str, name: &str, value: &[u8]) -> Result<(), FsError> {
        let path = path::normalize(path)?;
        self.namespace.update(&path, |attr| {
            attr.xattrs.insert(name.to_string(), value.to_vec());
            attr.ctime = SystemTime::now();
        })
    }

    pub fn listxattr(&self, path: &str) -> Result<Vec<String>, FsError> {
        let path = path::normalize(path)?;
        let entry = self.namespace.resolve(&path)?;
        Ok(entry.attr.xattrs.into_keys().collect())
    }

    pub fn removexattr(&self, path: &str, name: &str) -> Result<(), FsError> {
        let path = path::normalize(path)?;
        self.namespace
            .update(&path, |attr| attr.xattrs.remove(name))?
            .map(|_| ())
            .ok_or_else(|| FsError::NoAttribute(name.to_string()))
    }

    /// Capacity as seen through the cache bound.
    pub fn statfs(&self) -> FsStats {
        let block = u64::from(BLOCK_SIZE);
        FsStats {
            block_size: BLOCK_SIZE,
            blocks: self.cache.limit() / block,
            blocks_free: self.cache.limit().saturating_sub(self.cache.used()) / block,
            files: self.namespace.len() as u64,
            name_max: NAME_MAX,
        }
    }

    pub fn cache_usage(&self) -> CacheUsage {
        self.cache.usage()
    }

    pub fn upload_stats(&self) -> UploadStats {
        self.uploader.stats()
    }

    /// Run a refresh pass now instead of waiting for the timer.
    pub async fn refresh_now(&self) -> Result<ReconcileStats, FsError> {
        self.refresher.refresh_once().await
    }

    /// Stop refreshing, push every pending change out and report what could
    /// not be uploaded. The content of such files is copied below
    /// `<cache_dir>/unsynced/`. Calling it again returns the first report.
    pub async fn unmount(&self) -> Result<UnmountReport, FsError> {
        let mut unmounted = self.unmounted.lock().await;
        if let Some(report) = unmounted.as_ref() {
            return Ok(report.clone());
        }

        let refresh_task = self.refresh_task.lock().take();
        if let Some(task) = refresh_task {
            task.abort();
        }
        self.uploader.shutdown().await;

        let unsynced = self.cache_dir.join(UNSYNCED_DIR);
        let mut failed: Vec<String> = self
            .namespace
            .entries()
            .into_iter()
            .filter(|(_, node)| !node.is_dir() && !node.state().is_clean())
            .map(|(path, _)| path)
            .collect();
        failed.sort();

        let mut preserved = false;
        for path in &failed {
            match self.cache.preserve(path, &unsynced) {
                Ok(Some(dest)) => {
                    preserved = true;
                    warn!(path, saved_to = %dest.display(), "changes not uploaded, local copy kept");
                }
                Ok(None) => warn!(path, "changes not uploaded and no local copy left"),
                Err(err) => error!(path, error = %err, "failed to preserve local copy"),
            }
        }

        let report = UnmountReport {
            preserved_to: preserved.then_some(unsynced),
            failed,
            uploads: self.uploader.stats(),
        };
        info!(
            failed = report.failed.len(),
            uploads = report.uploads.uploads,
            "bucket unmounted"
        );
        *unmounted = Some(report.clone());
        Ok(report)
    }
}

impl Drop for BucketFs {
    fn drop(&mut self) {
        if let Some(task) = self.refresh_task.lock().take() {
            task.abort();
        }
    }
}
