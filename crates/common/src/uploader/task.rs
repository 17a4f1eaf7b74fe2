use tokio::sync::oneshot;
use tokio::time::Instant;

/// Remote work queued for one object key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskKind {
    /// Put the cached content of the entry mapped to the key.
    Upload,
    /// Remove the object.
    Delete,
    /// Server-side move: read `from`, write it to the key.
    Copy { from: String },
    /// Put an empty directory marker.
    Marker,
}

impl TaskKind {
    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::Upload => "upload",
            TaskKind::Delete => "delete",
            TaskKind::Copy { .. } => "copy",
            TaskKind::Marker => "marker",
        }
    }

    pub(crate) fn copy_source(&self) -> Option<&str> {
        match self {
            TaskKind::Copy { from } => Some(from),
            _ => None,
        }
    }
}

/// What a flush waiter learns about the task it waited on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Completed,
    /// Replaced by a delete before it ran; nothing is left to wait for.
    Superseded,
    Failed(String),
}

pub(crate) type Waiter = oneshot::Sender<TaskOutcome>;

pub(crate) fn notify(waiters: Vec<Waiter>, outcome: &TaskOutcome) {
    for waiter in waiters {
        let _ = waiter.send(outcome.clone());
    }
}

#[derive(Debug)]
pub struct UploadTask {
    pub key: String,
    pub kind: TaskKind,
    pub due: Instant,
    /// Failed attempts so far.
    pub attempts: u32,
    pub last_error: Option<String>,
    pub(crate) waiters: Vec<Waiter>,
}

impl UploadTask {
    pub fn new(key: impl Into<String>, kind: TaskKind, due: Instant) -> Self {
        Self {
            key: key.into(),
            kind,
            due,
            attempts: 0,
            last_error: None,
            waiters: Vec::new(),
        }
    }
}
