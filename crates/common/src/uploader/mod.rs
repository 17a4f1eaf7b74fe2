//! Write-back uploader.
//!
//! Local changes are turned into remote tasks (upload, delete, copy, marker)
//! queued per object key. Uploads are debounced: every write pushes the due
//! time of the file's pending upload back by the configured delay. A fixed
//! pool of workers executes due tasks, retrying transient failures with
//! exponential backoff; an entry whose task runs out of attempts is marked
//! upload-failed and keeps its local content until it is written again.
//!
//! Workers never hold a namespace or cache lock across a remote call. Whether
//! a finished task still applies is decided under the entry lock by looking
//! at the entry's linked path and content generation.

mod queue;
mod task;

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use object_store::{RemoteStore, StoreError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

pub use queue::Retarget;
pub use task::{TaskKind, TaskOutcome, UploadTask};

use queue::{Finish, Next, TaskQueue};

use crate::cache::DiskCache;
use crate::config::RetryPolicy;
use crate::error::FsError;
use crate::events::{EventSender, FsEvent};
use crate::namespace::{EntryAttr, EntryState, Namespace, Node};
use crate::path::{KeyMapper, RemoteKey};

#[derive(Debug, Clone, Copy)]
pub struct UploaderSettings {
    pub workers: usize,
    pub delay: Duration,
    pub retry: RetryPolicy,
}

/// Counters for the write-back pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadStats {
    pub uploads: u64,
    pub deletes: u64,
    pub copies: u64,
    pub markers: u64,
    pub retries: u64,
    pub failures: u64,
    pub pending: usize,
    pub in_flight: usize,
}

#[derive(Debug, Default)]
struct Counters {
    uploads: AtomicU64,
    deletes: AtomicU64,
    copies: AtomicU64,
    markers: AtomicU64,
    retries: AtomicU64,
    failures: AtomicU64,
}

impl Counters {
    fn completed(&self, kind: &TaskKind) {
        let counter = match kind {
            TaskKind::Upload => &self.uploads,
            TaskKind::Delete => &self.deletes,
            TaskKind::Copy { .. } => &self.copies,
            TaskKind::Marker => &self.markers,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// What a single run of a task achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Applied {
    Done,
    /// Written, but the entry moved or vanished while the call was running.
    Orphaned,
    Skipped,
}

#[derive(Debug)]
struct TaskError {
    message: String,
    transient: bool,
}

impl From<StoreError> for TaskError {
    fn from(err: StoreError) -> Self {
        Self {
            transient: err.is_transient(),
            message: err.to_string(),
        }
    }
}

impl From<FsError> for TaskError {
    fn from(err: FsError) -> Self {
        Self {
            transient: matches!(err, FsError::LocalIo(_) | FsError::RemoteUnavailable(_)),
            message: err.to_string(),
        }
    }
}

#[derive(Debug)]
struct Inner {
    queue: Mutex<TaskQueue>,
    /// Signalled whenever the queue changes.
    wake: Notify,
    /// Signalled whenever a task finishes.
    settled: Notify,
    namespace: Arc<Namespace>,
    cache: Arc<DiskCache>,
    store: Arc<dyn RemoteStore>,
    keys: KeyMapper,
    settings: UploaderSettings,
    events: EventSender,
    counters: Counters,
}

#[derive(Debug)]
pub struct Uploader {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Uploader {
    /// Start the worker pool. Must be called within a tokio runtime.
    pub fn start(
        namespace: Arc<Namespace>,
        cache: Arc<DiskCache>,
        store: Arc<dyn RemoteStore>,
        keys: KeyMapper,
        settings: UploaderSettings,
        events: EventSender,
    ) -> Self {
        let inner = Arc::new(Inner {
            queue: Mutex::new(TaskQueue::default()),
            wake: Notify::new(),
            settled: Notify::new(),
            namespace,
            cache,
            store,
            keys,
            settings,
            events,
            counters: Counters::default(),
        });
        let workers = (0..settings.workers.max(1))
            .map(|worker| tokio::spawn(run_worker(inner.clone(), worker)))
            .collect();
        info!(
            workers = settings.workers,
            delay_ms = settings.delay.as_millis() as u64,
            "uploader started"
        );
        Self {
            inner,
            workers: Mutex::new(workers),
        }
    }

    fn debounced(&self) -> Instant {
        Instant::now() + self.inner.settings.delay
    }

    fn changed(&self) {
        self.inner.wake.notify_waiters();
    }

    /// Queue (or push back) the upload of a changed file.
    pub fn schedule_upload(&self, path: &str) {
        let _ = self
            .inner
            .namespace
            .update(path, |attr| self.arm_upload(path, attr));
    }

    /// [`Uploader::schedule_upload`] for callers already holding the entry
    /// lock. Queueing under that lock keeps the task keyed by the path the
    /// entry is linked at.
    pub fn arm_upload(&self, path: &str, attr: &mut EntryAttr) {
        let key = self.inner.keys.file_key(path);
        self.arm(&key, TaskKind::Upload, attr);
    }

    /// Queue the marker object of a newly created directory.
    pub fn schedule_marker(&self, dir: &str) {
        let key = self.inner.keys.marker_key(dir);
        let _ = self
            .inner
            .namespace
            .update(dir, |attr| self.arm(&key, TaskKind::Marker, attr));
    }

    fn arm(&self, key: &str, kind: TaskKind, attr: &mut EntryAttr) {
        let due = self.debounced();
        self.inner.queue.lock().schedule(key, kind, due);
        if matches!(attr.state, EntryState::Dirty | EntryState::UploadFailed) {
            attr.state = EntryState::Scheduled;
        }
        self.changed();
    }

    /// Remove the remote object of an unlinked file. `remote` is the key its
    /// content was last stored under, if it was ever stored.
    pub fn discard_file(&self, path: &str, remote: Option<&str>) {
        let key = self.inner.keys.file_key(path);
        let due = self.debounced();
        self.inner.queue.lock().discard(&key, remote, due);
        self.changed();
    }

    /// Remove the marker of a removed directory.
    pub fn discard_dir(&self, dir: &str) {
        let key = self.inner.keys.marker_key(dir);
        let due = self.debounced();
        self.inner
            .queue
            .lock()
            .schedule(&key, TaskKind::Delete, due);
        self.changed();
    }

    /// Apply the remote side of a rename in one step.
    pub fn retarget(&self, moves: &[Retarget]) {
        if moves.is_empty() {
            return;
        }
        let due = self.debounced();
        self.inner.queue.lock().retarget(moves, due);
        self.changed();
    }

    /// Whether any queued or running task touches `key`.
    pub fn has_outstanding(&self, key: &str) -> bool {
        self.inner.queue.lock().is_referenced(key)
    }

    /// Upload `path` now and wait for the outcome. Entries that previously
    /// failed are retried. Returns immediately when nothing is outstanding.
    pub async fn flush(&self, path: &str) -> Result<(), FsError> {
        let key = self.inner.keys.file_key(path);
        let (tx, rx) = oneshot::channel();
        let attached = self
            .inner
            .queue
            .lock()
            .attach_waiter(&key, tx, Instant::now());
        if let Err(tx) = attached {
            let failed = self
                .inner
                .namespace
                .node(path)
                .is_some_and(|node| node.state() == EntryState::UploadFailed);
            if !failed {
                return Ok(());
            }
            debug!(path, "re-arming failed upload");
            let _ = self.inner.namespace.update(path, |attr| {
                self.inner
                    .queue
                    .lock()
                    .schedule_now(&key, TaskKind::Upload, tx, Instant::now());
                if attr.state == EntryState::UploadFailed {
                    attr.state = EntryState::Scheduled;
                }
            });
        }
        self.changed();

        match rx.await {
            Ok(TaskOutcome::Failed(reason)) => Err(FsError::UploadFailed {
                path: path.to_string(),
                reason,
            }),
            Ok(TaskOutcome::Completed | TaskOutcome::Superseded) | Err(_) => Ok(()),
        }
    }

    /// Run every queued task now, ignoring debounce and backoff, and wait
    /// until nothing is left. Retries still count against the attempt limit.
    pub async fn drain(&self) {
        self.inner.queue.lock().set_draining();
        self.changed();
        loop {
            let settled = self.inner.settled.notified();
            tokio::pin!(settled);
            settled.as_mut().enable();
            let idle = self.inner.queue.lock().is_idle();
            if idle {
                break;
            }
            settled.await;
        }
    }

    /// Drain, then stop the workers.
    pub async fn shutdown(&self) {
        self.drain().await;
        self.inner.queue.lock().close();
        self.changed();
        let workers: Vec<_> = self.workers.lock().drain(..).collect();
        for worker in workers {
            if let Err(err) = worker.await {
                warn!(error = %err, "upload worker ended abnormally");
            }
        }
        info!("uploader stopped");
    }

    pub fn stats(&self) -> UploadStats {
        let (pending, in_flight) = {
            let queue = self.inner.queue.lock();
            (queue.pending_len(), queue.in_flight_len())
        };
        let c = &self.inner.counters;
        UploadStats {
            uploads: c.uploads.load(Ordering::Relaxed),
            deletes: c.deletes.load(Ordering::Relaxed),
            copies: c.copies.load(Ordering::Relaxed),
            markers: c.markers.load(Ordering::Relaxed),
            retries: c.retries.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            pending,
            in_flight,
        }
    }
}

impl Drop for Uploader {
    fn drop(&mut self) {
        for worker in self.workers.lock().drain(..) {
            worker.abort();
        }
    }
}

async fn run_worker(inner: Arc<Inner>, worker: usize) {
    debug!(worker, "upload worker started");
    loop {
        let wake = inner.wake.notified();
        tokio::pin!(wake);
        wake.as_mut().enable();

        let next = inner.queue.lock().take_next(Instant::now());
        match next {
            Next::Run(task) => inner.execute(task).await,
            Next::Wait(Some(deadline)) => {
                tokio::select! {
                    _ = &mut wake => {}
                    _ = tokio::time::sleep_until(deadline) => {}
                }
            }
            Next::Wait(None) => wake.await,
            Next::Exit => break,
        }
    }
    debug!(worker, "upload worker stopped");
}

impl Inner {
    async fn execute(&self, task: UploadTask) {
        debug!(
            key = %task.key,
            kind = task.kind.name(),
            attempt = task.attempts + 1,
            "running task"
        );
        let result = match &task.kind {
            TaskKind::Upload => self.run_upload(&task.key).await,
            TaskKind::Delete => self.run_delete(&task.key).await,
            TaskKind::Copy { from } => self.run_copy(&task.key, from).await,
            TaskKind::Marker => self.run_marker(&task.key).await,
        };
        self.complete(task, result);
        self.wake.notify_waiters();
        self.settled.notify_waiters();
    }

    /// Bound a remote call by the attempt timeout.
    async fn remote<T>(
        &self,
        call: impl Future<Output = object_store::Result<T>>,
    ) -> Result<object_store::Result<T>, TaskError> {
        match tokio::time::timeout(self.settings.retry.attempt_timeout, call).await {
            Ok(result) => Ok(result),
            Err(_) => Err(TaskError {
                message: format!(
                    "timed out after {}s",
                    self.settings.retry.attempt_timeout.as_secs()
                ),
                transient: true,
            }),
        }
    }

    fn linked(&self, path: &str, node: &Node) -> bool {
        node.attr().linked.as_deref() == Some(path)
    }

    async fn run_upload(&self, key: &str) -> Result<Applied, TaskError> {
        let Some(path) = self.keys.file_path(key) else {
            return Ok(Applied::Skipped);
        };
        let Some(node) = self.namespace.node(&path) else {
            return Ok(Applied::Skipped);
        };
        if node.is_dir() {
            return Ok(Applied::Skipped);
        }

        let started = self.namespace.update_node(&node, |attr| {
            if attr.linked.as_deref() != Some(path.as_str()) {
                return None;
            }
            attr.state = EntryState::Uploading;
            Some(attr.generation)
        });
        let Some(generation) = started else {
            return Ok(Applied::Skipped);
        };

        let data = match self.cache.snapshot(&path)? {
            Some(data) if self.linked(&path, &node) => data,
            Some(_) => return Ok(Applied::Skipped),
            None if !self.linked(&path, &node) => return Ok(Applied::Skipped),
            None => {
                return Err(TaskError {
                    message: "local content missing from cache".to_string(),
                    transient: false,
                })
            }
        };
        let size = data.len();

        self.remote(self.store.put(key, data)).await??;

        let linked = self.namespace.update_node(&node, |attr| {
            if attr.linked.as_deref() != Some(path.as_str()) {
                return false;
            }
            attr.remote_key = Some(key.to_string());
            attr.remote_mtime = None;
            if attr.generation == generation {
                attr.state = EntryState::Clean;
                attr.last_error = None;
                self.cache.mark_clean(&path);
            }
            true
        });
        if !linked {
            debug!(path, key, "entry moved during upload");
            return Ok(Applied::Orphaned);
        }
        self.cache.evict_if_needed();
        debug!(path, key, size, "uploaded");
        self.events.emit(FsEvent::UploadCompleted { path });
        Ok(Applied::Done)
    }

    async fn run_delete(&self, key: &str) -> Result<Applied, TaskError> {
        match self.remote(self.store.delete(key)).await? {
            Ok(()) | Err(StoreError::NotFound(_)) => {}
            Err(err) => return Err(err.into()),
        }
        if let Some(RemoteKey::File(path) | RemoteKey::Directory(path)) = self.keys.classify(key)
        {
            self.namespace.confirm_remote_removal(&path);
        }
        debug!(key, "deleted remote object");
        Ok(Applied::Done)
    }

    async fn run_copy(&self, key: &str, from: &str) -> Result<Applied, TaskError> {
        let Some(path) = self.keys.file_path(key) else {
            return Ok(Applied::Skipped);
        };
        let Some(node) = self.namespace.node(&path) else {
            return Ok(Applied::Skipped);
        };

        let data: Bytes = self.remote(self.store.get(from)).await??;
        self.remote(self.store.put(key, data)).await??;

        let linked = self.namespace.update_node(&node, |attr| {
            if attr.linked.as_deref() != Some(path.as_str()) {
                return false;
            }
            if attr.remote_key.as_deref() == Some(from) {
                attr.remote_key = Some(key.to_string());
                attr.remote_mtime = None;
            }
            true
        });
        if !linked {
            return Ok(Applied::Orphaned);
        }
        debug!(from, to = key, "copied remote object");
        Ok(Applied::Done)
    }

    async fn run_marker(&self, key: &str) -> Result<Applied, TaskError> {
        let Some(dir) = self.keys.marker_path(key) else {
            return Ok(Applied::Skipped);
        };
        let Some(node) = self.namespace.node(&dir) else {
            return Ok(Applied::Skipped);
        };
        let started = self.namespace.update_node(&node, |attr| {
            let linked = attr.linked.as_deref() == Some(dir.as_str());
            if linked && !attr.state.is_clean() {
                attr.state = EntryState::Uploading;
            }
            linked
        });
        if !started {
            return Ok(Applied::Skipped);
        }

        self.remote(self.store.put(key, Bytes::new())).await??;

        let linked = self.namespace.update_node(&node, |attr| {
            if attr.linked.as_deref() != Some(dir.as_str()) {
                return false;
            }
            attr.state = EntryState::Clean;
            attr.last_error = None;
            true
        });
        Ok(if linked {
            Applied::Done
        } else {
            Applied::Orphaned
        })
    }

    /// Path of the entry a task works for, for state updates and events.
    fn entry_path(&self, task: &UploadTask) -> Option<String> {
        match task.kind {
            TaskKind::Upload | TaskKind::Copy { .. } => self.keys.file_path(&task.key),
            TaskKind::Marker => self.keys.marker_path(&task.key),
            TaskKind::Delete => None,
        }
    }

    fn complete(&self, task: UploadTask, result: Result<Applied, TaskError>) {
        let now = Instant::now();
        let finish = match result {
            Ok(applied) => {
                if applied != Applied::Skipped {
                    self.counters.completed(&task.kind);
                }
                match applied {
                    Applied::Done => Finish::Done { orphaned: false },
                    Applied::Orphaned => Finish::Done { orphaned: true },
                    Applied::Skipped => Finish::Skipped,
                }
            }
            Err(err) => {
                let failed = task.attempts + 1;
                let path = self.entry_path(&task);
                if err.transient && failed < self.settings.retry.max_attempts {
                    let delay = self.settings.retry.backoff(failed);
                    warn!(
                        key = %task.key,
                        kind = task.kind.name(),
                        attempt = failed,
                        retry_in_ms = delay.as_millis() as u64,
                        error = %err.message,
                        "remote task failed, will retry"
                    );
                    self.counters.retries.fetch_add(1, Ordering::Relaxed);
                    if let Some(path) = &path {
                        self.set_failed_state(path, EntryState::Scheduled, &err.message);
                    }
                    Finish::Retry {
                        error: err.message,
                        due: now + delay,
                    }
                } else {
                    error!(
                        key = %task.key,
                        kind = task.kind.name(),
                        attempts = failed,
                        error = %err.message,
                        "remote task failed, giving up"
                    );
                    self.counters.failures.fetch_add(1, Ordering::Relaxed);
                    if let Some(path) = path {
                        self.set_failed_state(&path, EntryState::UploadFailed, &err.message);
                        self.events.emit(FsEvent::UploadFailed {
                            path,
                            error: err.message.clone(),
                        });
                    }
                    Finish::Failed { error: err.message }
                }
            }
        };
        self.queue.lock().finish(task, finish);
    }

    /// Record a failed attempt on the entry, unless a newer local change has
    /// already moved it on.
    fn set_failed_state(&self, path: &str, state: EntryState, error: &str) {
        let Some(node) = self.namespace.node(path) else {
            return;
        };
        self.namespace.update_node(&node, |attr| {
            if attr.linked.as_deref() != Some(path) {
                return;
            }
            attr.last_error = Some(error.to_string());
            if attr.state == EntryState::Uploading {
                attr.state = state;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use object_store::MemoryStore;
    use tempfile::TempDir;

    use super::*;
    use crate::events::EventReceiver;
    use crate::namespace::EntryKind;

    struct Harness {
        namespace: Arc<Namespace>,
        cache: Arc<DiskCache>,
        store: Arc<MemoryStore>,
        uploader: Uploader,
        events: EventReceiver,
        _dir: TempDir,
    }

    fn harness(delay_ms: u64, attempts: u32) -> Harness {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        let namespace = Arc::new(Namespace::new());
        let cache =
            Arc::new(DiskCache::open(dir.path(), 1024 * 1024, 0, store.clone()).unwrap());
        let (events_tx, events) = EventSender::new(64);
        let uploader = Uploader::start(
            namespace.clone(),
            cache.clone(),
            store.clone(),
            KeyMapper::new(""),
            UploaderSettings {
                workers: 2,
                delay: Duration::from_millis(delay_ms),
                retry: RetryPolicy {
                    max_attempts: attempts,
                    base_delay: Duration::from_millis(100),
                    max_delay: Duration::from_secs(1),
                    attempt_timeout: Duration::from_secs(5),
                },
            },
            events_tx,
        );
        Harness {
            namespace,
            cache,
            store,
            uploader,
            events,
            _dir: dir,
        }
    }

    fn write_file(h: &Harness, path: &str, data: &[u8]) {
        if !h.namespace.contains(path) {
            h.namespace
                .insert(path, EntryKind::File, EntryAttr::new_file(None))
                .unwrap();
            h.cache.create_empty(path).unwrap();
        }
        h.cache.write_at(path, 0, data).unwrap();
        h.namespace
            .update(path, |attr| {
                attr.size = data.len() as u64;
                attr.generation += 1;
                attr.state = EntryState::Dirty;
            })
            .unwrap();
        h.uploader.schedule_upload(path);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upload_is_debounced_and_marks_clean() {
        let h = harness(1000, 3);
        write_file(&h, "/a.txt", b"one");
        assert_eq!(h.namespace.resolve("/a.txt").unwrap().state(), EntryState::Scheduled);

        tokio::time::sleep(Duration::from_millis(500)).await;
        write_file(&h, "/a.txt", b"two");
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(h.store.put_count("a.txt"), 0);

        tokio::time::sleep(Duration::from_millis(500)).await;
        h.uploader.drain().await;
        assert_eq!(h.store.put_count("a.txt"), 1);
        assert_eq!(h.store.object("a.txt").as_deref(), Some(&b"two"[..]));

        let entry = h.namespace.resolve("/a.txt").unwrap();
        assert_eq!(entry.state(), EntryState::Clean);
        assert_eq!(entry.attr.remote_key.as_deref(), Some("a.txt"));
        assert!(!h.cache.is_pinned("/a.txt"));
        assert_eq!(
            h.events.try_recv(),
            Some(FsEvent::UploadCompleted {
                path: "/a.txt".to_string()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failures_exhaust_to_upload_failed() {
        let h = harness(0, 3);
        h.store.set_available(false);
        write_file(&h, "/a.txt", b"data");

        let err = h.uploader.flush("/a.txt").await.unwrap_err();
        assert!(matches!(err, FsError::UploadFailed { .. }));
        assert_eq!(h.store.put_count("a.txt"), 3);

        let entry = h.namespace.resolve("/a.txt").unwrap();
        assert_eq!(entry.state(), EntryState::UploadFailed);
        assert!(entry.attr.last_error.is_some());
        assert!(h.cache.is_pinned("/a.txt"));
        assert_eq!(h.uploader.stats().failures, 1);
        assert_eq!(h.uploader.stats().retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_rearms_failed_upload() {
        let h = harness(0, 1);
        h.store.set_available(false);
        write_file(&h, "/a.txt", b"data");
        assert!(h.uploader.flush("/a.txt").await.is_err());

        h.store.set_available(true);
        h.uploader.flush("/a.txt").await.unwrap();
        assert_eq!(h.namespace.resolve("/a.txt").unwrap().state(), EntryState::Clean);
        assert_eq!(h.store.object("a.txt").as_deref(), Some(&b"data"[..]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_flush_with_nothing_outstanding_returns() {
        let h = harness(0, 1);
        h.uploader.flush("/nothing").await.unwrap();
        assert!(h.store.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_discard_of_scheduled_upload_never_uploads() {
        let h = harness(1000, 3);
        write_file(&h, "/a.txt", b"data");
        h.namespace.remove("/a.txt").unwrap();
        h.cache.remove("/a.txt");
        h.uploader.discard_file("/a.txt", None);
        h.uploader.drain().await;

        assert_eq!(h.store.put_count("a.txt"), 0);
        assert!(h.store.object("a.txt").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_marker_upload_for_new_directory() {
        let h = harness(0, 3);
        h.namespace
            .insert("/docs", EntryKind::Directory, EntryAttr::new_dir(None))
            .unwrap();
        h.uploader.schedule_marker("/docs");
        h.uploader.drain().await;

        assert!(h.store.object("docs/.bucketfs-dir").is_some());
        assert_eq!(h.namespace.resolve("/docs").unwrap().state(), EntryState::Clean);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_drains_and_stops_workers() {
        let h = harness(60_000, 3);
        write_file(&h, "/a.txt", b"data");
        h.uploader.shutdown().await;
        assert_eq!(h.store.put_count("a.txt"), 1);
        assert_eq!(h.uploader.stats().pending, 0);
        h.uploader.shutdown().await;
    }
}
