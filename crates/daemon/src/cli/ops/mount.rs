use std::fmt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::Arc;

use clap::Args;
use owo_colors::OwoColorize;
use tracing::{debug, info, warn};

use bucketfs_daemon::{ConfigError, DaemonConfig, MountError, MountSession};
use common::{BucketFs, EventReceiver, FsError, FsEvent, UnmountReport};

use crate::cli::op::{Op, OpContext};

#[derive(Args, Debug, Clone, Default)]
pub struct Mount {
    /// Directory to mount on (overrides `mount_path`)
    pub mount_path: Option<PathBuf>,

    /// Bucket name (overrides `bucket`)
    #[arg(long)]
    pub bucket: Option<String>,

    /// Mount only this sub-tree of the bucket
    #[arg(long)]
    pub prefix: Option<String>,

    /// Store URL, e.g. s3://key:secret@localhost:9000/bucket or file:///srv/bucket
    #[arg(long)]
    pub store_url: Option<String>,

    /// Local cache directory
    #[arg(long)]
    pub cache_dir: Option<PathBuf>,

    /// Disk cache size in megabytes
    #[arg(long)]
    pub cache_size_mb: Option<u64>,

    /// Seconds a file must stay unmodified before it is uploaded
    #[arg(long)]
    pub upload_delay: Option<f64>,

    /// Seconds between directory refreshes (0 disables periodic refresh)
    #[arg(long)]
    pub update_period: Option<u64>,

    /// Upload worker count
    #[arg(long)]
    pub workers: Option<usize>,

    /// Detach and keep serving in a background process
    #[arg(long)]
    pub background: bool,

    /// Serve in this process even when the config asks for background mode
    #[arg(long, hide = true)]
    pub foreground: bool,
}

impl Mount {
    /// Apply command line overrides on top of the loaded config.
    pub fn apply(&self, config: &mut DaemonConfig) {
        let mount = &mut config.mount;
        if let Some(path) = &self.mount_path {
            mount.mount_path = path.clone();
        }
        if let Some(bucket) = &self.bucket {
            mount.bucket = bucket.clone();
        }
        if let Some(prefix) = &self.prefix {
            mount.prefix = prefix.clone();
        }
        if let Some(dir) = &self.cache_dir {
            mount.cache_dir = Some(dir.clone());
        }
        if let Some(size) = self.cache_size_mb {
            mount.cache_size_mb = size;
        }
        if let Some(delay) = self.upload_delay {
            mount.upload_delay_secs = delay;
        }
        if let Some(period) = self.update_period {
            mount.update_period_secs = period;
        }
        if let Some(workers) = self.workers {
            mount.workers = workers;
        }
        if self.background {
            mount.background = true;
        }
        if self.foreground {
            mount.background = false;
        }
        if let Some(url) = &self.store_url {
            config.store.url = Some(url.clone());
        }
    }
}

#[derive(Debug)]
pub enum MountOutput {
    Detached { pid: u32, mount_path: PathBuf },
    Unmounted {
        mount_path: PathBuf,
        report: UnmountReport,
    },
}

impl fmt::Display for MountOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MountOutput::Detached { pid, mount_path } => write!(
                f,
                "{} at {} (pid {})",
                "Mounted".green().bold(),
                mount_path.display().to_string().bold(),
                pid
            ),
            MountOutput::Unmounted { mount_path, report } => {
                writeln!(
                    f,
                    "{} {}",
                    "Unmounted".green().bold(),
                    mount_path.display().to_string().bold()
                )?;
                let stats = &report.uploads;
                write!(
                    f,
                    "  {} {} uploads, {} deletes, {} copies, {} retries",
                    "Synced:".dimmed(),
                    stats.uploads,
                    stats.deletes,
                    stats.copies,
                    stats.retries
                )?;
                if report.failed.is_empty() {
                    return Ok(());
                }
                writeln!(f)?;
                write!(
                    f,
                    "  {} {} file(s) could not be uploaded",
                    "Failed:".red().bold(),
                    report.failed.len()
                )?;
                for path in &report.failed {
                    write!(f, "\n    {path}")?;
                }
                if let Some(dir) = &report.preserved_to {
                    write!(f, "\n  {} {}", "Preserved in:".yellow(), dir.display())?;
                }
                Ok(())
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MountOpError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Fs(#[from] FsError),
    #[error(transparent)]
    Mount(#[from] MountError),
    #[error("failed to start background process: {0}")]
    Detach(std::io::Error),
}

#[async_trait::async_trait]
impl Op for Mount {
    type Error = MountOpError;
    type Output = MountOutput;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error> {
        let mut config = ctx.load_config()?;
        self.apply(&mut config);
        config.validate()?;
        let mount_path = config.mount.mount_path.clone();

        if config.mount.background {
            let pid = detach().map_err(MountOpError::Detach)?;
            return Ok(MountOutput::Detached { pid, mount_path });
        }

        let store = config.build_store()?;
        let fs = Arc::new(BucketFs::mount(config.mount.clone(), store).await?);
        if let Some(events) = fs.take_events() {
            tokio::spawn(log_events(events));
        }

        let session = MountSession::mount(fs, &mount_path, tokio::runtime::Handle::current())?;
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("interrupted, unmounting"),
            _ = session.closed() => info!("unmounted by the kernel"),
        }

        let report = session.unmount().await?;
        Ok(MountOutput::Unmounted { mount_path, report })
    }
}

/// Re-run the current command line in a detached child that serves the
/// mount in the foreground.
fn detach() -> std::io::Result<u32> {
    let exe = std::env::current_exe()?;
    let child = Command::new(exe)
        .args(std::env::args_os().skip(1))
        .arg("--foreground")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    Ok(child.id())
}

async fn log_events(events: EventReceiver) {
    while let Some(event) = events.recv().await {
        match event {
            FsEvent::UploadFailed { path, error } => {
                warn!(path, error, "upload failed, local copy kept")
            }
            other => debug!(event = ?other, "filesystem event"),
        }
    }
}
