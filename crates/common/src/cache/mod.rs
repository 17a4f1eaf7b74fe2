//! Bounded on-disk content cache.
//!
//! Content is stored one file per path under `<cache_dir>/content/`, with
//! opaque file names so renames never touch the disk. Each slot has its own
//! lock; the slot map lock is only held for lookups and re-keying.
//!
//! A slot is *pinned* while its entry has local changes that are not yet in
//! the bucket. Eviction only ever considers unpinned slots, least recently
//! accessed first.

mod hot;

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use object_store::RemoteStore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub use hot::{HotCache, HotCacheStats};

use crate::error::FsError;

const CONTENT_DIR: &str = "content";

#[derive(Debug, Default)]
struct SlotState {
    present: bool,
    size: u64,
    pinned: bool,
}

#[derive(Debug)]
struct Slot {
    file: PathBuf,
    state: Mutex<SlotState>,
    /// Serialises read-through fetches for this slot.
    fill: tokio::sync::Mutex<()>,
    last_access: AtomicU64,
    /// Set once the slot left the map; late fetches must not resurrect it.
    detached: AtomicBool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheUsage {
    pub used_bytes: u64,
    pub limit_bytes: u64,
    pub entries: usize,
    pub pinned: usize,
    pub hot: HotCacheStats,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub evicted: usize,
    pub freed: u64,
}

#[derive(Debug)]
pub struct DiskCache {
    content_dir: PathBuf,
    limit: u64,
    used: AtomicU64,
    slots: Mutex<HashMap<String, Arc<Slot>>>,
    next_file: AtomicU64,
    clock: AtomicU64,
    hot: HotCache,
    store: Arc<dyn RemoteStore>,
}

impl DiskCache {
    /// Open the cache below `dir`. Content left by a previous session is
    /// discarded.
    pub fn open(
        dir: &Path,
        limit: u64,
        hot_capacity: u64,
        store: Arc<dyn RemoteStore>,
    ) -> Result<Self, FsError> {
        let content_dir = dir.join(CONTENT_DIR);
        if content_dir.exists() {
            fs::remove_dir_all(&content_dir)?;
        }
        fs::create_dir_all(&content_dir)?;
        info!(dir = %content_dir.display(), limit, "disk cache opened");

        Ok(Self {
            content_dir,
            limit,
            used: AtomicU64::new(0),
            slots: Mutex::new(HashMap::new()),
            next_file: AtomicU64::new(1),
            clock: AtomicU64::new(0),
            hot: HotCache::new(hot_capacity),
            store,
        })
    }

    pub fn used(&self) -> u64 {
        self.used.load(Ordering::SeqCst)
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    fn slot(&self, path: &str) -> Option<Arc<Slot>> {
        self.slots.lock().get(path).cloned()
    }

    fn slot_or_insert(&self, path: &str) -> Arc<Slot> {
        let mut slots = self.slots.lock();
        if let Some(slot) = slots.get(path) {
            return slot.clone();
        }
        let id = self.next_file.fetch_add(1, Ordering::SeqCst);
        let slot = Arc::new(Slot {
            file: self.content_dir.join(format!("{id:016x}")),
            state: Mutex::new(SlotState::default()),
            fill: tokio::sync::Mutex::new(()),
            last_access: AtomicU64::new(0),
            detached: AtomicBool::new(false),
        });
        slots.insert(path.to_string(), slot.clone());
        slot
    }

    fn touch(&self, slot: &Slot) {
        let tick = self.clock.fetch_add(1, Ordering::SeqCst) + 1;
        slot.last_access.store(tick, Ordering::SeqCst);
    }

    fn account(&self, old: u64, new: u64) {
        if new >= old {
            self.used.fetch_add(new - old, Ordering::SeqCst);
        } else {
            self.used.fetch_sub(old - new, Ordering::SeqCst);
        }
    }

    fn present_size(slot: &Slot) -> Option<u64> {
        let state = slot.state.lock();
        state.present.then_some(state.size)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.slot(path).is_some_and(|slot| {
            let present = slot.state.lock().present;
            present
        })
    }

    pub fn is_pinned(&self, path: &str) -> bool {
        self.slot(path).is_some_and(|slot| {
            let state = slot.state.lock();
            state.present && state.pinned
        })
    }

    /// Make sure the content of `path` is on local disk, pulling it from
    /// `source_key` on a miss. Concurrent misses for one path share a single
    /// fetch. Returns the cached size.
    pub async fn fetch(&self, path: &str, source_key: Option<&str>) -> Result<u64, FsError> {
        let slot = self.slot_or_insert(path);
        if let Some(size) = Self::present_size(&slot) {
            self.touch(&slot);
            return Ok(size);
        }

        let _fill = slot.fill.lock().await;
        if let Some(size) = Self::present_size(&slot) {
            self.touch(&slot);
            return Ok(size);
        }

        let Some(key) = source_key else {
            // Never uploaded and nothing local: the content is empty.
            self.store_content(path, &slot, Bytes::new())?;
            return Ok(0);
        };

        self.evict_if_needed();
        if self.used() > self.limit {
            return Err(FsError::CacheExhausted {
                needed: 0,
                used: self.used(),
                limit: self.limit,
            });
        }

        debug!(path, key, "cache miss, fetching from store");
        let data = self.store.get(key).await?;
        let size = data.len() as u64;

        if self.used() + size > self.limit {
            self.evict_for(size);
            if self.used() + size > self.limit {
                warn!(
                    path,
                    size,
                    used = self.used(),
                    limit = self.limit,
                    "no room to cache fetched content"
                );
                return Err(FsError::CacheExhausted {
                    needed: size,
                    used: self.used(),
                    limit: self.limit,
                });
            }
        }

        if !self.store_content(path, &slot, data)? {
            return Err(FsError::NotFound(path.to_string()));
        }
        Ok(size)
    }

    /// Install fetched (clean) content. `false` if the slot was removed
    /// while the fetch was running.
    fn store_content(&self, path: &str, slot: &Slot, data: Bytes) -> Result<bool, FsError> {
        let mut state = slot.state.lock();
        if slot.detached.load(Ordering::SeqCst) {
            return Ok(false);
        }
        fs::write(&slot.file, &data)?;
        let old = if state.present { state.size } else { 0 };
        let size = data.len() as u64;
        self.account(old, size);
        state.present = true;
        state.size = size;
        state.pinned = false;
        // A rename during the fetch moves the slot to another path.
        if self
            .slot(path)
            .is_some_and(|current| std::ptr::eq(Arc::as_ptr(&current), slot))
        {
            self.hot.put(path, data);
        }
        drop(state);
        self.touch(slot);
        Ok(true)
    }

    /// Read up to `len` bytes at `offset`. `Ok(None)` when the content is not
    /// cached (evicted or invalidated since the last fetch).
    pub fn read(&self, path: &str, offset: u64, len: usize) -> Result<Option<Bytes>, FsError> {
        let Some(slot) = self.slot(path) else {
            return Ok(None);
        };
        if let Some(data) = self.hot.get(path) {
            self.touch(&slot);
            return Ok(Some(slice(&data, offset, len)));
        }

        let state = slot.state.lock();
        if !state.present {
            return Ok(None);
        }
        let result = if self.hot.accepts(state.size) {
            let data = Bytes::from(fs::read(&slot.file)?);
            let out = slice(&data, offset, len);
            self.hot.put(path, data);
            out
        } else {
            let mut file = File::open(&slot.file)?;
            file.seek(SeekFrom::Start(offset))?;
            let mut buf = Vec::with_capacity(len.min(state.size.saturating_sub(offset) as usize));
            file.take(len as u64).read_to_end(&mut buf)?;
            Bytes::from(buf)
        };
        drop(state);
        self.touch(&slot);
        Ok(Some(result))
    }

    /// Write `data` at `offset`, zero-filling any gap. Pins the slot.
    /// `Ok(None)` when the content is not cached.
    pub fn write_at(&self, path: &str, offset: u64, data: &[u8]) -> Result<Option<u64>, FsError> {
        let Some(slot) = self.slot(path) else {
            return Ok(None);
        };
        let mut state = slot.state.lock();
        if !state.present {
            return Ok(None);
        }
        let mut file = OpenOptions::new().write(true).open(&slot.file)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;

        let new_size = state.size.max(offset + data.len() as u64);
        self.account(state.size, new_size);
        state.size = new_size;
        state.pinned = true;
        self.hot.invalidate(path);
        drop(state);
        self.touch(&slot);
        Ok(Some(new_size))
    }

    /// Resize cached content. Truncating to zero works even when nothing is
    /// cached. Pins the slot. Returns `false` when the content is not cached.
    pub fn truncate(&self, path: &str, size: u64) -> Result<bool, FsError> {
        let slot = self.slot_or_insert(path);
        let mut state = slot.state.lock();
        if !state.present {
            if size != 0 {
                return Ok(false);
            }
            File::create(&slot.file)?;
            state.present = true;
            state.size = 0;
        } else {
            OpenOptions::new()
                .write(true)
                .open(&slot.file)?
                .set_len(size)?;
            self.account(state.size, size);
            state.size = size;
        }
        state.pinned = true;
        self.hot.invalidate(path);
        drop(state);
        self.touch(&slot);
        Ok(true)
    }

    /// Materialise empty, pinned content for a newly created file. Content a
    /// racing writer already put there is kept.
    pub fn create_empty(&self, path: &str) -> Result<(), FsError> {
        let slot = self.slot_or_insert(path);
        let mut state = slot.state.lock();
        if !state.present {
            File::create(&slot.file)?;
            state.present = true;
            state.size = 0;
        }
        state.pinned = true;
        self.hot.invalidate(path);
        drop(state);
        self.touch(&slot);
        Ok(())
    }

    /// Full content for an upload.
    pub fn snapshot(&self, path: &str) -> Result<Option<Bytes>, FsError> {
        let Some(slot) = self.slot(path) else {
            return Ok(None);
        };
        let state = slot.state.lock();
        if !state.present {
            return Ok(None);
        }
        Ok(Some(Bytes::from(fs::read(&slot.file)?)))
    }

    pub fn mark_clean(&self, path: &str) {
        if let Some(slot) = self.slot(path) {
            slot.state.lock().pinned = false;
        }
    }

    /// Drop cached content for a removed entry.
    pub fn remove(&self, path: &str) {
        let slot = self.slots.lock().remove(path);
        self.hot.invalidate(path);
        if let Some(slot) = slot {
            self.discard(&slot);
        }
    }

    fn discard(&self, slot: &Slot) {
        let mut state = slot.state.lock();
        slot.detached.store(true, Ordering::SeqCst);
        if state.present {
            if let Err(err) = fs::remove_file(&slot.file) {
                warn!(file = %slot.file.display(), error = %err, "failed to delete cached file");
            }
            self.account(state.size, 0);
            state.present = false;
            state.size = 0;
        }
    }

    /// Move cached content from `from` to `to`, discarding whatever `to` held.
    pub fn rename(&self, from: &str, to: &str) {
        let displaced = {
            let mut slots = self.slots.lock();
            match slots.remove(from) {
                Some(slot) => slots.insert(to.to_string(), slot),
                None => slots.remove(to),
            }
        };
        self.hot.invalidate(from);
        self.hot.invalidate(to);
        if let Some(slot) = displaced {
            self.discard(&slot);
        }
    }

    /// Drop clean content so the next read fetches it again. Pinned content
    /// is left alone; returns whether anything was dropped.
    pub fn invalidate(&self, path: &str) -> bool {
        let Some(slot) = self.slot(path) else {
            return false;
        };
        let mut state = slot.state.lock();
        if state.pinned {
            return false;
        }
        self.hot.invalidate(path);
        if !state.present {
            return false;
        }
        if let Err(err) = fs::remove_file(&slot.file) {
            warn!(path, error = %err, "failed to delete invalidated content");
        }
        self.account(state.size, 0);
        state.present = false;
        state.size = 0;
        true
    }

    /// Evict clean content until occupancy is within the bound.
    pub fn evict_if_needed(&self) -> EvictionReport {
        self.evict_for(0)
    }

    fn evict_for(&self, incoming: u64) -> EvictionReport {
        let mut report = EvictionReport::default();
        if self.used() + incoming <= self.limit {
            return report;
        }

        let mut candidates: Vec<(u64, String, Arc<Slot>)> = self
            .slots
            .lock()
            .iter()
            .map(|(path, slot)| {
                (
                    slot.last_access.load(Ordering::SeqCst),
                    path.clone(),
                    slot.clone(),
                )
            })
            .collect();
        candidates.sort_by_key(|(access, _, _)| *access);

        for (_, path, slot) in candidates {
            if self.used() + incoming <= self.limit {
                break;
            }
            let mut state = slot.state.lock();
            if !state.present || state.pinned {
                continue;
            }
            if let Err(err) = fs::remove_file(&slot.file) {
                warn!(path, error = %err, "failed to evict cached file");
                continue;
            }
            let size = state.size;
            self.account(size, 0);
            state.present = false;
            state.size = 0;
            self.hot.invalidate(&path);
            drop(state);

            report.evicted += 1;
            report.freed += size;
            debug!(path, size, "evicted");
        }

        if report.evicted > 0 {
            debug!(
                evicted = report.evicted,
                freed = report.freed,
                used = self.used(),
                limit = self.limit,
                "cache eviction pass"
            );
        }
        report
    }

    pub fn usage(&self) -> CacheUsage {
        let slots: Vec<Arc<Slot>> = self.slots.lock().values().cloned().collect();
        let mut entries = 0;
        let mut pinned = 0;
        for slot in slots {
            let state = slot.state.lock();
            if state.present {
                entries += 1;
                if state.pinned {
                    pinned += 1;
                }
            }
        }
        CacheUsage {
            used_bytes: self.used(),
            limit_bytes: self.limit,
            entries,
            pinned,
            hot: self.hot.stats(),
        }
    }

    /// Copy cached content of `path` below `dest_root`, mirroring its path.
    pub fn preserve(&self, path: &str, dest_root: &Path) -> Result<Option<PathBuf>, FsError> {
        let Some(slot) = self.slot(path) else {
            return Ok(None);
        };
        let state = slot.state.lock();
        if !state.present {
            return Ok(None);
        }
        let dest = dest_root.join(path.trim_start_matches('/'));
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::copy(&slot.file, &dest)?;
        Ok(Some(dest))
    }
}

fn slice(data: &Bytes, offset: u64, len: usize) -> Bytes {
    let start = usize::try_from(offset).unwrap_or(usize::MAX).min(data.len());
    let end = start.saturating_add(len).min(data.len());
    data.slice(start..end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::MemoryStore;

    fn open(limit: u64) -> (DiskCache, Arc<MemoryStore>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let cache = DiskCache::open(dir.path(), limit, 1024 * 1024, store.clone()).unwrap();
        (cache, store, dir)
    }

    #[tokio::test]
    async fn test_fetch_reads_through_once() {
        let (cache, store, _dir) = open(1024);
        store.insert("a.txt", "hello world");

        assert_eq!(cache.fetch("/a.txt", Some("a.txt")).await.unwrap(), 11);
        assert_eq!(cache.fetch("/a.txt", Some("a.txt")).await.unwrap(), 11);
        assert_eq!(store.get_count("a.txt"), 1);

        let data = cache.read("/a.txt", 6, 100).unwrap().unwrap();
        assert_eq!(&data[..], b"world");
        assert_eq!(cache.used(), 11);
    }

    #[tokio::test]
    async fn test_fetch_missing_key_is_not_found() {
        let (cache, _store, _dir) = open(1024);
        assert!(matches!(
            cache.fetch("/gone", Some("gone")).await,
            Err(FsError::NotFound(_))
        ));
        assert!(!cache.contains("/gone"));
    }

    #[test]
    fn test_write_extends_and_pins() {
        let (cache, _store, _dir) = open(1024);
        cache.create_empty("/f").unwrap();
        assert!(cache.is_pinned("/f"));

        assert_eq!(cache.write_at("/f", 4, b"xy").unwrap(), Some(6));
        let data = cache.snapshot("/f").unwrap().unwrap();
        assert_eq!(&data[..], b"\0\0\0\0xy");
        assert_eq!(cache.used(), 6);

        assert_eq!(cache.write_at("/missing", 0, b"z").unwrap(), None);
    }

    #[test]
    fn test_truncate() {
        let (cache, _store, _dir) = open(1024);
        cache.create_empty("/f").unwrap();
        cache.write_at("/f", 0, b"0123456789").unwrap();
        assert!(cache.truncate("/f", 4).unwrap());
        assert_eq!(&cache.snapshot("/f").unwrap().unwrap()[..], b"0123");
        assert_eq!(cache.used(), 4);

        assert!(!cache.truncate("/uncached", 3).unwrap());
        assert!(cache.truncate("/uncached", 0).unwrap());
        assert!(cache.contains("/uncached"));
    }

    #[tokio::test]
    async fn test_eviction_skips_pinned_and_prefers_oldest() {
        let (cache, store, _dir) = open(20);
        store.insert("old", vec![1u8; 8]);
        store.insert("new", vec![2u8; 8]);

        cache.fetch("/old", Some("old")).await.unwrap();
        cache.fetch("/new", Some("new")).await.unwrap();
        cache.create_empty("/dirty").unwrap();
        cache.write_at("/dirty", 0, &[3u8; 8]).unwrap();
        assert_eq!(cache.used(), 24);

        let report = cache.evict_if_needed();
        assert_eq!(report.evicted, 1);
        assert_eq!(report.freed, 8);
        assert!(cache.contains("/dirty"));
        assert!(!cache.contains("/old"));
        assert!(cache.contains("/new"));
        assert!(cache.used() <= 20);
    }

    #[tokio::test]
    async fn test_fetch_fails_when_only_pinned_content_remains() {
        let (cache, store, _dir) = open(10);
        store.insert("remote", vec![0u8; 5]);
        cache.create_empty("/dirty").unwrap();
        cache.write_at("/dirty", 0, &[1u8; 12]).unwrap();

        let err = cache.fetch("/remote", Some("remote")).await.unwrap_err();
        assert!(matches!(err, FsError::CacheExhausted { .. }));
        assert!(cache.contains("/dirty"));
    }

    #[test]
    fn test_rename_moves_content_and_discards_target() {
        let (cache, _store, _dir) = open(1024);
        cache.create_empty("/a").unwrap();
        cache.write_at("/a", 0, b"aaa").unwrap();
        cache.create_empty("/b").unwrap();
        cache.write_at("/b", 0, b"bbbbb").unwrap();

        cache.rename("/a", "/b");
        assert!(!cache.contains("/a"));
        assert_eq!(&cache.read("/b", 0, 10).unwrap().unwrap()[..], b"aaa");
        assert_eq!(cache.used(), 3);
    }

    #[tokio::test]
    async fn test_create_does_not_serve_stale_hot_content() {
        let (cache, store, _dir) = open(1024);
        store.insert("f", "old bytes");
        cache.fetch("/f", Some("f")).await.unwrap();
        cache.rename("/f", "/g");
        // Leftover from a fetch that finished under the old path.
        cache.hot.put("/f", Bytes::from_static(b"old bytes"));

        cache.create_empty("/f").unwrap();
        assert!(cache.read("/f", 0, 100).unwrap().unwrap().is_empty());
        assert_eq!(&cache.read("/g", 0, 100).unwrap().unwrap()[..], b"old bytes");
    }

    #[test]
    fn test_fetch_after_rename_keeps_hot_layer_off_old_path() {
        let (cache, _store, _dir) = open(1024);
        let slot = cache.slot_or_insert("/f");
        cache.rename("/f", "/g");

        assert!(cache
            .store_content("/f", &slot, Bytes::from_static(b"content"))
            .unwrap());
        assert!(cache.hot.get("/f").is_none());
        assert_eq!(&cache.read("/g", 0, 100).unwrap().unwrap()[..], b"content");
    }

    #[tokio::test]
    async fn test_invalidate_only_drops_clean_content() {
        let (cache, store, _dir) = open(1024);
        store.insert("c", "clean");
        cache.fetch("/c", Some("c")).await.unwrap();
        cache.create_empty("/d").unwrap();

        assert!(cache.invalidate("/c"));
        assert!(!cache.contains("/c"));
        assert!(!cache.invalidate("/d"));
        assert!(cache.contains("/d"));

        cache.mark_clean("/d");
        assert!(!cache.is_pinned("/d"));
    }

    #[test]
    fn test_remove_releases_space() {
        let (cache, _store, _dir) = open(1024);
        cache.create_empty("/f").unwrap();
        cache.write_at("/f", 0, b"12345").unwrap();
        cache.remove("/f");
        assert_eq!(cache.used(), 0);
        assert!(cache.read("/f", 0, 5).unwrap().is_none());
    }

    #[test]
    fn test_startup_discards_previous_content() {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn RemoteStore> = Arc::new(MemoryStore::new());
        let stale = dir.path().join(CONTENT_DIR).join("0000000000000001");
        fs::create_dir_all(stale.parent().unwrap()).unwrap();
        fs::write(&stale, b"stale").unwrap();

        let cache = DiskCache::open(dir.path(), 1024, 0, store).unwrap();
        assert!(!stale.exists());
        assert_eq!(cache.usage().entries, 0);
    }

    #[test]
    fn test_preserve_copies_content() {
        let (cache, _store, dir) = open(1024);
        cache.create_empty("/docs/a.txt").unwrap();
        cache.write_at("/docs/a.txt", 0, b"keep me").unwrap();

        let dest_root = dir.path().join("unsynced");
        let dest = cache.preserve("/docs/a.txt", &dest_root).unwrap().unwrap();
        assert_eq!(dest, dest_root.join("docs/a.txt"));
        assert_eq!(fs::read(dest).unwrap(), b"keep me");
    }

    #[test]
    fn test_slice_bounds() {
        let data = Bytes::from_static(b"abcdef");
        assert_eq!(&slice(&data, 2, 2)[..], b"cd");
        assert_eq!(&slice(&data, 4, 100)[..], b"ef");
        assert!(slice(&data, 10, 5).is_empty());
    }
}
