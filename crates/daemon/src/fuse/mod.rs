//! Kernel mount of a [`BucketFs`].
//!
//! - `KernelBridge`: the `fuser::Filesystem` implementation
//! - `InodeTable`: inode ↔ path mapping
//! - [`MountSession`]: a live kernel mount and its teardown
//!
//! Teardown order matters: the kernel mount goes first so no request can
//! land after the engine starts draining its upload queue.

mod bridge;
mod inode_table;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use common::{BucketFs, FsError, UnmountReport};
use fuser::MountOption;
use tokio::runtime::Handle;
use tracing::{info, warn};

pub use bridge::KernelBridge;
pub use inode_table::InodeTable;

#[derive(Debug, thiserror::Error)]
pub enum MountError {
    #[error("failed to mount at {path}: {source}")]
    Mount {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Fs(#[from] FsError),
}

/// Options passed to the kernel for a bucket mount.
pub fn mount_options(bucket: &str) -> Vec<MountOption> {
    vec![
        MountOption::FSName(format!("bucketfs:{bucket}")),
        MountOption::Subtype("bucketfs".to_string()),
        MountOption::DefaultPermissions,
        MountOption::NoAtime,
    ]
}

pub struct MountSession {
    session: fuser::BackgroundSession,
    fs: Arc<BucketFs>,
    destroyed: flume::Receiver<()>,
    mount_path: PathBuf,
}

impl MountSession {
    /// Mount `fs` at `mount_path`. Requests are served on a background
    /// thread and run engine futures on `runtime`.
    pub fn mount(
        fs: Arc<BucketFs>,
        mount_path: &Path,
        runtime: Handle,
    ) -> Result<Self, MountError> {
        let (destroyed_tx, destroyed) = flume::bounded(1);
        let bridge = KernelBridge::new(fs.clone(), runtime, destroyed_tx);
        let options = mount_options(&fs.config().bucket);

        let session = fuser::spawn_mount2(bridge, mount_path, &options).map_err(|source| {
            MountError::Mount {
                path: mount_path.to_path_buf(),
                source,
            }
        })?;
        info!(mount_path = %mount_path.display(), "kernel mount active");

        Ok(Self {
            session,
            fs,
            destroyed,
            mount_path: mount_path.to_path_buf(),
        })
    }

    pub fn fs(&self) -> &Arc<BucketFs> {
        &self.fs
    }

    pub fn mount_path(&self) -> &Path {
        &self.mount_path
    }

    /// Resolves when the kernel ends the session (e.g. `fusermount -u`).
    pub async fn closed(&self) {
        let _ = self.destroyed.recv_async().await;
    }

    /// Detach from the kernel, then drain pending uploads and preserve
    /// anything that could not be uploaded.
    pub async fn unmount(self) -> Result<UnmountReport, MountError> {
        let Self {
            session,
            fs,
            mount_path,
            ..
        } = self;
        if let Err(err) = tokio::task::spawn_blocking(move || drop(session)).await {
            warn!(error = %err, mount_path = %mount_path.display(), "kernel unmount panicked");
        }
        Ok(fs.unmount().await?)
    }
}

impl std::fmt::Debug for MountSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MountSession")
            .field("mount_path", &self.mount_path)
            .field("bucket", &self.fs.config().bucket)
            .finish()
    }
}
