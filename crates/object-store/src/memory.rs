//! In-memory [`RemoteStore`] with call recording and outage simulation.

use std::collections::BTreeMap;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::error::{Result, StoreError};
use crate::store::{RemoteObject, RemoteStore};

/// A call made against a [`MemoryStore`], successful or not.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    Get(String),
    Put(String),
    Delete(String),
    List(String),
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    modified: SystemTime,
}

#[derive(Debug)]
struct MemoryState {
    objects: BTreeMap<String, StoredObject>,
    calls: Vec<StoreCall>,
    available: bool,
    last_modified: SystemTime,
    put_delay: Duration,
    list_delay: Duration,
}

/// Bucket held in process memory.
///
/// Every call is recorded, and the store can be switched into an
/// "unavailable" mode where all calls fail with a transient error.
/// Modification times are strictly increasing across writes.
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                objects: BTreeMap::new(),
                calls: Vec::new(),
                available: true,
                last_modified: SystemTime::UNIX_EPOCH,
                put_delay: Duration::ZERO,
                list_delay: Duration::ZERO,
            }),
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.state.lock().available = available;
    }

    /// Hold every put for `delay` before the object becomes visible.
    pub fn set_put_delay(&self, delay: Duration) {
        self.state.lock().put_delay = delay;
    }

    /// Hold every listing for `delay` after its contents were captured, so
    /// the caller receives a snapshot that may be stale by then.
    pub fn set_list_delay(&self, delay: Duration) {
        self.state.lock().list_delay = delay;
    }

    /// Write an object out-of-band, as another client of the bucket would.
    pub fn insert(&self, key: &str, data: impl Into<Bytes>) {
        let mut state = self.state.lock();
        let modified = state.next_mtime();
        state.objects.insert(
            key.to_string(),
            StoredObject {
                data: data.into(),
                modified,
            },
        );
    }

    /// Remove an object out-of-band.
    pub fn remove(&self, key: &str) -> bool {
        self.state.lock().objects.remove(key).is_some()
    }

    /// Current body of `key`, bypassing availability and call recording.
    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.state.lock().objects.get(key).map(|o| o.data.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        self.state.lock().objects.keys().cloned().collect()
    }

    pub fn calls(&self) -> Vec<StoreCall> {
        self.state.lock().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }

    /// Number of put attempts made for `key`.
    pub fn put_count(&self, key: &str) -> usize {
        self.count(|call| matches!(call, StoreCall::Put(k) if k == key))
    }

    /// Number of delete attempts made for `key`.
    pub fn delete_count(&self, key: &str) -> usize {
        self.count(|call| matches!(call, StoreCall::Delete(k) if k == key))
    }

    /// Number of get attempts made for `key`.
    pub fn get_count(&self, key: &str) -> usize {
        self.count(|call| matches!(call, StoreCall::Get(k) if k == key))
    }

    fn count(&self, pred: impl Fn(&StoreCall) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| pred(*c)).count()
    }

    fn record(&self, call: StoreCall) -> Result<parking_lot::MutexGuard<'_, MemoryState>> {
        let mut state = self.state.lock();
        let target = match &call {
            StoreCall::Get(k) | StoreCall::Put(k) | StoreCall::Delete(k) | StoreCall::List(k) => {
                k.clone()
            }
        };
        state.calls.push(call);
        if !state.available {
            return Err(StoreError::Unavailable(format!(
                "simulated outage while accessing {target:?}"
            )));
        }
        Ok(state)
    }
}

impl MemoryState {
    fn next_mtime(&mut self) -> SystemTime {
        let now = SystemTime::now();
        let next = if now > self.last_modified {
            now
        } else {
            self.last_modified + Duration::from_millis(1)
        };
        self.last_modified = next;
        next
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Bytes> {
        let state = self.record(StoreCall::Get(key.to_string()))?;
        state
            .objects
            .get(key)
            .map(|o| o.data.clone())
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let delay = self.record(StoreCall::Put(key.to_string()))?.put_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let mut state = self.state.lock();
        let modified = state.next_mtime();
        state
            .objects
            .insert(key.to_string(), StoredObject { data, modified });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut state = self.record(StoreCall::Delete(key.to_string()))?;
        match state.objects.remove(key) {
            Some(_) => Ok(()),
            None => Err(StoreError::NotFound(key.to_string())),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>> {
        let (listed, delay) = {
            let state = self.record(StoreCall::List(prefix.to_string()))?;
            let listed: Vec<RemoteObject> = state
                .objects
                .iter()
                .filter(|(key, _)| key.starts_with(prefix))
                .map(|(key, object)| RemoteObject {
                    key: key.clone(),
                    size: object.data.len() as u64,
                    modified: object.modified,
                })
                .collect();
            (listed, state.list_delay)
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(listed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_list() {
        let store = MemoryStore::new();
        store.put("a/one.txt", Bytes::from_static(b"1")).await.unwrap();
        store.put("b/two.txt", Bytes::from_static(b"22")).await.unwrap();

        assert_eq!(&store.get("a/one.txt").await.unwrap()[..], b"1");
        let listed = store.list("b/").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, "b/two.txt");
        assert_eq!(listed[0].size, 2);
        assert_eq!(store.put_count("a/one.txt"), 1);
    }

    #[tokio::test]
    async fn test_outage_fails_transiently_and_records() {
        let store = MemoryStore::new();
        store.set_available(false);

        let err = store.put("x", Bytes::new()).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(store.put_count("x"), 1);
        assert!(store.object("x").is_none());

        store.set_available(true);
        store.put("x", Bytes::new()).await.unwrap();
        assert_eq!(store.put_count("x"), 2);
        assert!(store.object("x").is_some());
    }

    #[tokio::test]
    async fn test_modification_times_increase() {
        let store = MemoryStore::new();
        store.insert("k", "v1");
        let first = store.list("").await.unwrap()[0].modified;
        store.insert("k", "v2");
        let second = store.list("").await.unwrap()[0].modified;
        assert!(second > first);
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_list_returns_snapshot_from_call_time() {
        let store = std::sync::Arc::new(MemoryStore::new());
        store.insert("k", "v");
        store.set_list_delay(Duration::from_secs(2));

        let listing = tokio::spawn({
            let store = store.clone();
            async move { store.list("").await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(store.remove("k"));

        let listed = listing.await.unwrap().unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].key, "k");
    }

    #[tokio::test(start_paused = true)]
    async fn test_delayed_put_is_invisible_until_done() {
        let store = std::sync::Arc::new(MemoryStore::new());
        store.set_put_delay(Duration::from_secs(2));

        let put = tokio::spawn({
            let store = store.clone();
            async move { store.put("k", Bytes::from_static(b"v")).await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(store.put_count("k"), 1);
        assert!(store.object("k").is_none());

        put.await.unwrap().unwrap();
        assert_eq!(store.object("k").as_deref(), Some(&b"v"[..]));
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.delete("nope").await,
            Err(StoreError::NotFound(_))
        ));
    }
}
