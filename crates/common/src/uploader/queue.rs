//! Pending and in-flight remote work, keyed by object key.
//!
//! At most one task per key is pending and at most one runs. Scheduling
//! onto a key that already has pending work coalesces:
//!
//! * an upload, copy or marker replaces a pending delete,
//! * a delete replaces anything, notifying flush waiters,
//! * a displaced copy releases its source key, which is deleted unless
//!   another task still refers to it.
//!
//! A delete never starts while a copy is reading from the same key.

use std::collections::HashMap;

use tokio::time::Instant;

use super::task::{notify, TaskKind, TaskOutcome, UploadTask, Waiter};

/// One remote consequence of a rename, applied together with its siblings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Retarget {
    /// A clean file whose content still lives at `source`.
    CleanFile {
        from_key: String,
        to_key: String,
        source: String,
    },
    /// A file with local changes; `stale` is its previous remote object.
    DirtyFile {
        from_key: String,
        to_key: String,
        stale: Option<String>,
    },
    Directory {
        from_marker: String,
        to_marker: String,
    },
    /// The file that occupied the destination, now gone.
    Discard {
        key: String,
        remote: Option<String>,
    },
}

pub(crate) enum Next {
    Run(UploadTask),
    /// Nothing runnable; sleep until the deadline or the next wake-up.
    Wait(Option<Instant>),
    Exit,
}

/// How a run ended, as far as the queue is concerned.
pub(crate) enum Finish {
    /// The object now holds what the task wrote. `orphaned` when the entry
    /// moved or vanished meanwhile, so the written key is no longer wanted.
    Done { orphaned: bool },
    /// Nothing to do any more (entry gone before the task started).
    Skipped,
    Retry { error: String, due: Instant },
    Failed { error: String },
}

#[derive(Debug)]
struct InFlight {
    kind: TaskKind,
    waiters: Vec<Waiter>,
}

#[derive(Debug, Default)]
pub(crate) struct TaskQueue {
    pending: HashMap<String, UploadTask>,
    in_flight: HashMap<String, InFlight>,
    draining: bool,
    closed: bool,
}

impl TaskQueue {
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_empty()
    }

    pub fn pending(&self, key: &str) -> Option<&UploadTask> {
        self.pending.get(key)
    }

    pub fn set_draining(&mut self) {
        self.draining = true;
    }

    pub fn close(&mut self) {
        self.closed = true;
    }

    /// Whether any queued or running task reads or writes `key`.
    pub fn is_referenced(&self, key: &str) -> bool {
        self.pending.contains_key(key)
            || self.in_flight.contains_key(key)
            || self.copy_reads(key)
    }

    fn copy_reads(&self, key: &str) -> bool {
        self.pending
            .values()
            .any(|t| t.kind.copy_source() == Some(key))
            || self
                .in_flight
                .values()
                .any(|t| t.kind.copy_source() == Some(key))
    }

    pub fn schedule(&mut self, key: &str, kind: TaskKind, due: Instant) {
        self.schedule_with(key, kind, due, Vec::new());
    }

    fn schedule_with(&mut self, key: &str, kind: TaskKind, due: Instant, waiters: Vec<Waiter>) {
        let mut released = None;
        match self.pending.get_mut(key) {
            Some(task) => {
                if task.kind != kind {
                    if let Some(from) = task.kind.copy_source() {
                        released = Some(from.to_string());
                    }
                    if kind == TaskKind::Delete {
                        notify(std::mem::take(&mut task.waiters), &TaskOutcome::Superseded);
                    }
                    task.kind = kind;
                }
                task.due = due;
                task.attempts = 0;
                task.last_error = None;
                task.waiters.extend(waiters);
            }
            None => {
                let mut task = UploadTask::new(key, kind, due);
                task.waiters = waiters;
                self.pending.insert(key.to_string(), task);
            }
        }
        if let Some(from) = released {
            self.release(&from, due);
        }
    }

    /// A key some task used to need: delete it unless still referenced.
    pub fn release(&mut self, key: &str, due: Instant) {
        if !self.is_referenced(key) {
            self.schedule(key, TaskKind::Delete, due);
        }
    }

    /// Remove the object at `key` for an entry that no longer exists.
    /// `remote` is where the entry's content was last known to live.
    pub fn discard(&mut self, key: &str, remote: Option<&str>, due: Instant) {
        if remote.is_some() || self.is_referenced(key) {
            self.schedule(key, TaskKind::Delete, due);
        }
        if let Some(remote) = remote.filter(|r| *r != key) {
            self.release(remote, due);
        }
    }

    /// Apply every remote consequence of one rename.
    pub fn retarget(&mut self, moves: &[Retarget], due: Instant) {
        for change in moves {
            match change {
                Retarget::CleanFile {
                    from_key,
                    to_key,
                    source,
                } => {
                    let (source, waiters) = match self.take_pending(from_key) {
                        Some(UploadTask {
                            kind: TaskKind::Copy { from },
                            waiters,
                            ..
                        }) => (from, waiters),
                        Some(other) => {
                            self.pending.insert(from_key.clone(), other);
                            (source.clone(), Vec::new())
                        }
                        None => (source.clone(), Vec::new()),
                    };
                    if source == *to_key {
                        // Moved back onto the object that already holds it.
                        notify(waiters, &TaskOutcome::Completed);
                        if matches!(
                            self.pending.get(to_key).map(|t| &t.kind),
                            Some(TaskKind::Delete)
                        ) {
                            self.pending.remove(to_key);
                        }
                        continue;
                    }
                    self.schedule_with(to_key, TaskKind::Copy { from: source }, due, waiters);
                }
                Retarget::DirtyFile {
                    from_key,
                    to_key,
                    stale,
                } => {
                    let mut waiters = Vec::new();
                    let mut released = None;
                    match self.take_pending(from_key) {
                        Some(task) if task.kind == TaskKind::Delete => {
                            self.pending.insert(from_key.clone(), task);
                        }
                        Some(task) => {
                            released = task.kind.copy_source().map(str::to_string);
                            waiters = task.waiters;
                        }
                        None => {}
                    }
                    self.schedule_with(to_key, TaskKind::Upload, due, waiters);
                    for key in released.iter().chain(stale.iter()) {
                        if key != to_key {
                            self.release(key, due);
                        }
                    }
                }
                Retarget::Directory {
                    from_marker,
                    to_marker,
                } => {
                    let waiters = match self.take_pending(from_marker) {
                        Some(task) if task.kind == TaskKind::Marker => task.waiters,
                        Some(task) => {
                            self.pending.insert(from_marker.clone(), task);
                            Vec::new()
                        }
                        None => Vec::new(),
                    };
                    self.schedule_with(to_marker, TaskKind::Marker, due, waiters);
                    self.release(from_marker, due);
                }
                Retarget::Discard { key, remote } => self.discard(key, remote.as_deref(), due),
            }
        }
    }

    fn take_pending(&mut self, key: &str) -> Option<UploadTask> {
        self.pending.remove(key)
    }

    /// Attach a flush waiter to whatever is queued or running for `key`,
    /// pulling pending work forward to `now`. Hands the waiter back when
    /// nothing is outstanding.
    pub fn attach_waiter(&mut self, key: &str, waiter: Waiter, now: Instant) -> Result<(), Waiter> {
        if let Some(task) = self.pending.get_mut(key) {
            task.due = task.due.min(now);
            task.waiters.push(waiter);
            return Ok(());
        }
        if let Some(running) = self.in_flight.get_mut(key) {
            running.waiters.push(waiter);
            return Ok(());
        }
        Err(waiter)
    }

    /// Attach to a new or existing upload of `key`, due immediately.
    pub fn schedule_now(&mut self, key: &str, kind: TaskKind, waiter: Waiter, now: Instant) {
        self.schedule_with(key, kind, now, vec![waiter]);
    }

    /// Pick the most overdue runnable task. While draining every pending task
    /// counts as due.
    pub fn take_next(&mut self, now: Instant) -> Next {
        if self.closed && self.pending.is_empty() {
            return Next::Exit;
        }

        let mut best: Option<(&String, Instant)> = None;
        let mut wake: Option<Instant> = None;
        for (key, task) in &self.pending {
            if self.in_flight.contains_key(key) {
                continue;
            }
            if task.kind == TaskKind::Delete && self.copy_reads(key) {
                continue;
            }
            if self.draining || task.due <= now {
                if best.map_or(true, |(_, due)| task.due < due) {
                    best = Some((key, task.due));
                }
            } else if wake.map_or(true, |at| task.due < at) {
                wake = Some(task.due);
            }
        }

        let Some(key) = best.map(|(key, _)| key.clone()) else {
            return Next::Wait(wake);
        };
        let Some(mut task) = self.pending.remove(&key) else {
            return Next::Wait(wake);
        };
        self.in_flight.insert(
            key,
            InFlight {
                kind: task.kind.clone(),
                waiters: std::mem::take(&mut task.waiters),
            },
        );
        Next::Run(task)
    }

    /// Record the end of a run started by [`TaskQueue::take_next`].
    pub fn finish(&mut self, mut task: UploadTask, finish: Finish) {
        let waiters = self
            .in_flight
            .remove(&task.key)
            .map(|running| running.waiters)
            .unwrap_or_default();

        match finish {
            Finish::Done { orphaned } => {
                notify(waiters, &TaskOutcome::Completed);
                let due = task.due;
                if orphaned {
                    self.release(&task.key, due);
                }
                if let Some(from) = task.kind.copy_source() {
                    self.release(from, due);
                }
            }
            Finish::Skipped => notify(waiters, &TaskOutcome::Completed),
            Finish::Retry { error, due } => {
                if let Some(newer) = self.pending.get_mut(&task.key) {
                    if newer.kind == TaskKind::Delete {
                        notify(waiters, &TaskOutcome::Superseded);
                    } else {
                        newer.waiters.extend(waiters);
                    }
                    return;
                }
                task.attempts += 1;
                task.due = due;
                task.last_error = Some(error);
                task.waiters = waiters;
                self.pending.insert(task.key.clone(), task);
            }
            Finish::Failed { error } => {
                notify(waiters, &TaskOutcome::Failed(error));
                if let Some(from) = task.kind.copy_source() {
                    let from = from.to_string();
                    self.release(&from, task.due);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio::sync::oneshot;

    use super::*;

    fn run(queue: &mut TaskQueue, now: Instant) -> UploadTask {
        match queue.take_next(now) {
            Next::Run(task) => task,
            Next::Wait(_) => panic!("expected a runnable task"),
            Next::Exit => panic!("queue closed"),
        }
    }

    fn kind(queue: &TaskQueue, key: &str) -> Option<TaskKind> {
        queue.pending(key).map(|t| t.kind.clone())
    }

    #[test]
    fn test_repeated_uploads_coalesce() {
        let now = Instant::now();
        let mut queue = TaskQueue::default();
        queue.schedule("a", TaskKind::Upload, now);
        queue.schedule("a", TaskKind::Upload, now + Duration::from_secs(5));
        assert_eq!(queue.pending_len(), 1);
        assert_eq!(queue.pending("a").unwrap().due, now + Duration::from_secs(5));
    }

    #[test]
    fn test_delete_replaces_upload_and_upload_replaces_delete() {
        let now = Instant::now();
        let mut queue = TaskQueue::default();
        let (tx, mut rx) = oneshot::channel();
        queue.schedule_now("a", TaskKind::Upload, tx, now);
        queue.schedule("a", TaskKind::Delete, now);
        assert_eq!(kind(&queue, "a"), Some(TaskKind::Delete));
        assert_eq!(rx.try_recv().unwrap(), TaskOutcome::Superseded);

        queue.schedule("a", TaskKind::Upload, now);
        assert_eq!(kind(&queue, "a"), Some(TaskKind::Upload));
        assert_eq!(queue.pending_len(), 1);
    }

    #[test]
    fn test_displaced_copy_releases_source() {
        let now = Instant::now();
        let mut queue = TaskQueue::default();
        queue.schedule(
            "b",
            TaskKind::Copy {
                from: "a".to_string(),
            },
            now,
        );
        queue.schedule("b", TaskKind::Upload, now);
        assert_eq!(kind(&queue, "b"), Some(TaskKind::Upload));
        assert_eq!(kind(&queue, "a"), Some(TaskKind::Delete));
    }

    #[test]
    fn test_delete_waits_for_copy_reading_its_key() {
        let now = Instant::now();
        let mut queue = TaskQueue::default();
        queue.schedule(
            "b",
            TaskKind::Copy {
                from: "a".to_string(),
            },
            now + Duration::from_secs(1),
        );
        queue.schedule("a", TaskKind::Delete, now);

        let later = now + Duration::from_secs(2);
        let copy = run(&mut queue, later);
        assert_eq!(copy.key, "b");
        assert!(matches!(queue.take_next(later), Next::Wait(None)));

        queue.finish(copy, Finish::Done { orphaned: false });
        assert_eq!(run(&mut queue, later).key, "a");
    }

    #[test]
    fn test_one_task_per_key_in_flight() {
        let now = Instant::now();
        let mut queue = TaskQueue::default();
        queue.schedule("a", TaskKind::Upload, now);
        let first = run(&mut queue, now);
        queue.schedule("a", TaskKind::Upload, now);
        assert!(matches!(queue.take_next(now), Next::Wait(None)));
        assert!(queue.is_referenced("a"));

        queue.finish(first, Finish::Done { orphaned: false });
        assert_eq!(run(&mut queue, now).key, "a");
    }

    #[test]
    fn test_wait_reports_earliest_deadline() {
        let now = Instant::now();
        let mut queue = TaskQueue::default();
        queue.schedule("a", TaskKind::Upload, now + Duration::from_secs(9));
        queue.schedule("b", TaskKind::Upload, now + Duration::from_secs(3));
        match queue.take_next(now) {
            Next::Wait(Some(at)) => assert_eq!(at, now + Duration::from_secs(3)),
            _ => panic!("expected to wait"),
        }
    }

    #[test]
    fn test_draining_ignores_due_time() {
        let now = Instant::now();
        let mut queue = TaskQueue::default();
        queue.schedule("a", TaskKind::Upload, now + Duration::from_secs(60));
        queue.set_draining();
        assert_eq!(run(&mut queue, now).key, "a");
    }

    #[test]
    fn test_retry_requeues_with_waiters() {
        let now = Instant::now();
        let mut queue = TaskQueue::default();
        queue.schedule("a", TaskKind::Upload, now);
        let task = run(&mut queue, now);
        let (tx, mut rx) = oneshot::channel();
        queue.attach_waiter("a", tx, now).unwrap();

        let due = now + Duration::from_secs(1);
        queue.finish(
            task,
            Finish::Retry {
                error: "503".to_string(),
                due,
            },
        );
        let retried = queue.pending("a").unwrap();
        assert_eq!(retried.attempts, 1);
        assert_eq!(retried.due, due);
        assert_eq!(retried.last_error.as_deref(), Some("503"));
        assert!(rx.try_recv().is_err());

        let task = run(&mut queue, due);
        queue.finish(
            task,
            Finish::Failed {
                error: "503".to_string(),
            },
        );
        assert_eq!(rx.try_recv().unwrap(), TaskOutcome::Failed("503".to_string()));
        assert!(queue.is_idle());
    }

    #[test]
    fn test_retry_yields_to_newer_work() {
        let now = Instant::now();
        let mut queue = TaskQueue::default();
        queue.schedule("a", TaskKind::Upload, now);
        let task = run(&mut queue, now);
        queue.schedule("a", TaskKind::Upload, now + Duration::from_secs(5));
        queue.finish(
            task,
            Finish::Retry {
                error: "timeout".to_string(),
                due: now,
            },
        );
        let pending = queue.pending("a").unwrap();
        assert_eq!(pending.attempts, 0);
        assert_eq!(pending.due, now + Duration::from_secs(5));
    }

    #[test]
    fn test_orphaned_result_is_deleted() {
        let now = Instant::now();
        let mut queue = TaskQueue::default();
        queue.schedule("a", TaskKind::Upload, now);
        let task = run(&mut queue, now);
        queue.finish(task, Finish::Done { orphaned: true });
        assert_eq!(kind(&queue, "a"), Some(TaskKind::Delete));
    }

    #[test]
    fn test_copy_completion_releases_source() {
        let now = Instant::now();
        let mut queue = TaskQueue::default();
        queue.schedule(
            "b",
            TaskKind::Copy {
                from: "a".to_string(),
            },
            now,
        );
        let task = run(&mut queue, now);
        queue.finish(task, Finish::Done { orphaned: false });
        assert_eq!(kind(&queue, "a"), Some(TaskKind::Delete));
        assert_eq!(kind(&queue, "b"), None);
    }

    #[test]
    fn test_retarget_clean_file_chains_copies() {
        let now = Instant::now();
        let mut queue = TaskQueue::default();
        queue.retarget(
            &[Retarget::CleanFile {
                from_key: "a".to_string(),
                to_key: "b".to_string(),
                source: "a".to_string(),
            }],
            now,
        );
        queue.retarget(
            &[Retarget::CleanFile {
                from_key: "b".to_string(),
                to_key: "c".to_string(),
                source: "a".to_string(),
            }],
            now,
        );
        assert_eq!(kind(&queue, "b"), None);
        assert_eq!(
            kind(&queue, "c"),
            Some(TaskKind::Copy {
                from: "a".to_string()
            })
        );
        assert_eq!(queue.pending_len(), 1);
    }

    #[test]
    fn test_retarget_back_to_source_cancels_copy() {
        let now = Instant::now();
        let mut queue = TaskQueue::default();
        for (from, to) in [("a", "b"), ("b", "a")] {
            queue.retarget(
                &[Retarget::CleanFile {
                    from_key: from.to_string(),
                    to_key: to.to_string(),
                    source: "a".to_string(),
                }],
                now,
            );
        }
        assert!(queue.is_idle());
    }

    #[test]
    fn test_retarget_dirty_file_moves_upload_and_drops_stale_object() {
        let now = Instant::now();
        let mut queue = TaskQueue::default();
        let (tx, mut rx) = oneshot::channel();
        queue.schedule_now("a", TaskKind::Upload, tx, now);
        queue.retarget(
            &[Retarget::DirtyFile {
                from_key: "a".to_string(),
                to_key: "b".to_string(),
                stale: Some("a".to_string()),
            }],
            now,
        );
        assert_eq!(kind(&queue, "b"), Some(TaskKind::Upload));
        assert_eq!(kind(&queue, "a"), Some(TaskKind::Delete));

        let task = run(&mut queue, now);
        let (first, second) = if task.key == "b" {
            (task, run(&mut queue, now))
        } else {
            let other = run(&mut queue, now);
            (other, task)
        };
        queue.finish(first, Finish::Done { orphaned: false });
        assert_eq!(rx.try_recv().unwrap(), TaskOutcome::Completed);
        queue.finish(second, Finish::Done { orphaned: false });
        assert!(queue.is_idle());
    }

    #[test]
    fn test_retarget_directory_moves_marker() {
        let now = Instant::now();
        let mut queue = TaskQueue::default();
        queue.retarget(
            &[Retarget::Directory {
                from_marker: "d/.bucketfs-dir".to_string(),
                to_marker: "e/.bucketfs-dir".to_string(),
            }],
            now,
        );
        assert_eq!(kind(&queue, "e/.bucketfs-dir"), Some(TaskKind::Marker));
        assert_eq!(kind(&queue, "d/.bucketfs-dir"), Some(TaskKind::Delete));
    }

    #[test]
    fn test_discard_only_deletes_known_objects() {
        let now = Instant::now();
        let mut queue = TaskQueue::default();
        queue.discard("never-uploaded", None, now);
        assert!(queue.is_idle());

        queue.schedule("pending", TaskKind::Upload, now);
        queue.discard("pending", None, now);
        assert_eq!(kind(&queue, "pending"), Some(TaskKind::Delete));

        queue.discard("moved", Some("original"), now);
        assert_eq!(kind(&queue, "moved"), Some(TaskKind::Delete));
        assert_eq!(kind(&queue, "original"), Some(TaskKind::Delete));
    }

    #[test]
    fn test_rename_over_replaced_file_back_onto_source() {
        let now = Instant::now();
        let mut queue = TaskQueue::default();
        queue.retarget(
            &[Retarget::CleanFile {
                from_key: "a".to_string(),
                to_key: "b".to_string(),
                source: "a".to_string(),
            }],
            now,
        );
        queue.schedule("a", TaskKind::Upload, now);
        queue.retarget(
            &[
                Retarget::Discard {
                    key: "a".to_string(),
                    remote: None,
                },
                Retarget::CleanFile {
                    from_key: "b".to_string(),
                    to_key: "a".to_string(),
                    source: "a".to_string(),
                },
            ],
            now,
        );
        assert!(queue.is_idle());
    }

    #[test]
    fn test_attach_waiter_pulls_task_forward() {
        let now = Instant::now();
        let mut queue = TaskQueue::default();
        queue.schedule("a", TaskKind::Upload, now + Duration::from_secs(30));
        let (tx, _rx) = oneshot::channel();
        queue.attach_waiter("a", tx, now).unwrap();
        assert_eq!(queue.pending("a").unwrap().due, now);

        let (tx, _rx) = oneshot::channel();
        assert!(queue.attach_waiter("missing", tx, now).is_err());
    }

    #[test]
    fn test_closed_queue_exits_once_empty() {
        let now = Instant::now();
        let mut queue = TaskQueue::default();
        queue.schedule("a", TaskKind::Upload, now);
        queue.close();
        assert!(matches!(queue.take_next(now), Next::Run(_)));
        assert!(matches!(queue.take_next(now), Next::Exit));
    }
}
