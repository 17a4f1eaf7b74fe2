use std::fmt::Debug;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

/// One object as returned by a listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    /// Full key, including any mount prefix.
    pub key: String,
    pub size: u64,
    pub modified: SystemTime,
}

/// A flat keyed object store.
///
/// Keys are `/`-separated strings without a leading slash. Implementations
/// must be safe to call concurrently from many tasks.
#[async_trait]
pub trait RemoteStore: Debug + Send + Sync + 'static {
    /// Fetch the full body of `key`.
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Create or overwrite `key`.
    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    /// Remove `key`. Removing a missing key returns [`crate::StoreError::NotFound`].
    async fn delete(&self, key: &str) -> Result<()>;

    /// List every object whose key starts with `prefix` (recursively).
    async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>>;
}
