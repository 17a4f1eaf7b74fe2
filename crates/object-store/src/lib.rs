//! Remote object storage for bucketfs.
//!
//! The filesystem engine talks to the bucket exclusively through the
//! [`RemoteStore`] trait. Two implementations ship here:
//!
//! - [`Storage`]: backed by the `object_store` crate (S3/MinIO, a local
//!   directory, or process memory), selected with [`ObjectStoreConfig`].
//! - [`MemoryStore`]: an in-memory store that records calls and can simulate
//!   outages, used by the test suites.

mod error;
mod memory;
mod storage;
mod store;

pub use error::{Result, StoreError};
pub use memory::{MemoryStore, StoreCall};
pub use storage::{ObjectStoreConfig, Storage};
pub use store::{RemoteObject, RemoteStore};
