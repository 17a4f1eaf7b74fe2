//! Open file handles.
//!
//! Handles are plain numbers handed to the kernel; each remembers the node
//! it was opened on, so I/O keeps following the file across renames.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::FsError;
use crate::namespace::Node;

#[derive(Debug, Clone)]
pub struct OpenHandle {
    pub node: Arc<Node>,
}

#[derive(Debug)]
pub struct HandleTable {
    next: AtomicU64,
    open: Mutex<HashMap<u64, OpenHandle>>,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
            open: Mutex::new(HashMap::new()),
        }
    }

    pub fn open(&self, node: Arc<Node>) -> u64 {
        let fh = self.next.fetch_add(1, Ordering::SeqCst);
        self.open.lock().insert(fh, OpenHandle { node });
        fh
    }

    pub fn get(&self, fh: u64) -> Result<OpenHandle, FsError> {
        self.open.lock().get(&fh).cloned().ok_or(FsError::BadHandle(fh))
    }

    pub fn release(&self, fh: u64) -> Result<OpenHandle, FsError> {
        self.open.lock().remove(&fh).ok_or(FsError::BadHandle(fh))
    }

    pub fn len(&self) -> usize {
        self.open.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
