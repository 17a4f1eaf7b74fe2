//! Engine events.
//!
//! The uploader and refresher publish what they did on a bounded flume
//! channel so a frontend can log failures or invalidate kernel caches.
//! Publishing never blocks: when nobody drains the channel, new events are
//! dropped.

use tracing::trace;

/// Something that happened to an entry outside the request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsEvent {
    /// The entry's content reached the bucket.
    UploadCompleted { path: String },

    /// The pipeline gave up on an entry; its local copy is retained.
    UploadFailed { path: String, error: String },

    /// A refresh found an entry that was not known locally.
    RemoteAdded { path: String },

    /// A refresh found newer remote content; cached content was dropped.
    RemoteChanged { path: String },

    /// A refresh found a clean entry gone from the bucket and removed it.
    RemoteRemoved { path: String },
}

/// Cloneable publishing handle.
#[derive(Debug, Clone)]
pub struct EventSender {
    tx: flume::Sender<FsEvent>,
}

impl EventSender {
    /// Create a sender/receiver pair holding at most `capacity` undelivered
    /// events.
    pub fn new(capacity: usize) -> (Self, EventReceiver) {
        let (tx, rx) = flume::bounded(capacity);
        (Self { tx }, EventReceiver { rx })
    }

    pub fn emit(&self, event: FsEvent) {
        if let Err(flume::TrySendError::Full(event)) = self.tx.try_send(event) {
            trace!(?event, "event channel full, dropping event");
        }
    }
}

/// Receiving side, handed out once per mount.
#[derive(Debug)]
pub struct EventReceiver {
    rx: flume::Receiver<FsEvent>,
}

impl EventReceiver {
    /// Try to receive an event without blocking.
    pub fn try_recv(&self) -> Option<FsEvent> {
        self.rx.try_recv().ok()
    }

    /// Wait for the next event. `None` once the mount is gone.
    pub async fn recv(&self) -> Option<FsEvent> {
        self.rx.recv_async().await.ok()
    }

    /// Drain everything currently queued.
    pub fn drain(&self) -> Vec<FsEvent> {
        self.rx.drain().collect()
    }
}
