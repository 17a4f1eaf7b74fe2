//! In-memory layer for small, whole-file content.
//!
//! Sits in front of the disk cache so repeated reads of small files never hit
//! the disk. Entries are weighted by byte length and must be invalidated on
//! every change to the file they mirror.

use bytes::Bytes;
use moka::sync::Cache;
use serde::{Deserialize, Serialize};

/// Largest single file kept in memory.
const MAX_ITEM_BYTES: u64 = 4 * 1024 * 1024;

#[derive(Clone)]
pub struct HotCache {
    content: Option<Cache<String, Bytes>>,
    max_item: u64,
}

impl HotCache {
    /// `capacity` is in bytes; 0 disables the layer.
    pub fn new(capacity: u64) -> Self {
        if capacity == 0 {
            return Self {
                content: None,
                max_item: 0,
            };
        }
        let content = Cache::builder()
            .weigher(|_path: &String, data: &Bytes| -> u32 {
                u32::try_from(data.len()).unwrap_or(u32::MAX)
            })
            .max_capacity(capacity)
            .build();
        Self {
            content: Some(content),
            max_item: MAX_ITEM_BYTES.min(capacity / 4),
        }
    }

    /// Whether a file of `size` bytes would be kept.
    pub fn accepts(&self, size: u64) -> bool {
        self.content.is_some() && size <= self.max_item
    }

    pub fn get(&self, path: &str) -> Option<Bytes> {
        self.content.as_ref()?.get(path)
    }

    pub fn put(&self, path: &str, data: Bytes) {
        if !self.accepts(data.len() as u64) {
            return;
        }
        if let Some(content) = &self.content {
            content.insert(path.to_string(), data);
        }
    }

    pub fn invalidate(&self, path: &str) {
        if let Some(content) = &self.content {
            content.invalidate(path);
        }
    }

    pub fn stats(&self) -> HotCacheStats {
        match &self.content {
            Some(content) => {
                content.run_pending_tasks();
                HotCacheStats {
                    entries: content.entry_count(),
                    weighted_bytes: content.weighted_size(),
                }
            }
            None => HotCacheStats::default(),
        }
    }
}

impl std::fmt::Debug for HotCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HotCache")
            .field("enabled", &self.content.is_some())
            .field("max_item", &self.max_item)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HotCacheStats {
    pub entries: u64,
    pub weighted_bytes: u64,
}
