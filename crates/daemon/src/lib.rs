//! bucketfs daemon: configuration, logging and the kernel mount of a
//! [`common::BucketFs`].

pub mod config;
#[cfg(feature = "fuse")]
pub mod fuse;
pub mod logging;

pub use config::{ConfigError, DaemonConfig, LogSettings, StoreSettings};
#[cfg(feature = "fuse")]
pub use fuse::{MountError, MountSession};
