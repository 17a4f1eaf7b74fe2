//! Filesystem engine for bucketfs.
//!
//! Mounts an object storage bucket as a POSIX-style tree. Reads are served
//! from a bounded disk cache, writes land locally first and are pushed to
//! the bucket in the background, and periodic listings fold remote changes
//! back into the local view. [`BucketFs`] is the entry point; the FUSE
//! bridge in the daemon translates kernel requests into calls on it.

pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod handles;
pub mod namespace;
pub mod path;
pub mod refresher;
pub mod uploader;

pub use cache::{CacheUsage, DiskCache};
pub use config::{MountConfig, RetryPolicy};
pub use dispatcher::{BucketFs, DirEntry, FsStats, SetAttr, UnmountReport};
pub use error::FsError;
pub use events::{EventReceiver, FsEvent};
pub use namespace::{EntryAttr, EntryKind, EntryState, NamespaceEntry};
pub use refresher::ReconcileStats;
pub use uploader::UploadStats;

pub mod prelude {
    pub use crate::config::MountConfig;
    pub use crate::dispatcher::{BucketFs, SetAttr};
    pub use crate::error::FsError;
    pub use crate::namespace::{EntryKind, EntryState};
}
