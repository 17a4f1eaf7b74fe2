use std::fmt;
use std::time::SystemTime;

use chrono::{DateTime, Local};
use clap::Args;
use comfy_table::Table;

use bucketfs_daemon::ConfigError;
use common::path::{self, KeyMapper, RemoteKey};
use common::FsError;
use object_store::StoreError;

use crate::cli::op::{Op, OpContext};

/// List what the bucket holds under a path without mounting it.
#[derive(Args, Debug, Clone)]
pub struct Ls {
    /// Path below the mounted prefix (defaults to the root)
    #[arg(default_value = "/")]
    pub path: String,

    /// Bucket name (overrides `bucket`)
    #[arg(long)]
    pub bucket: Option<String>,

    /// Store URL (overrides `store.url`)
    #[arg(long)]
    pub store_url: Option<String>,
}

#[derive(Debug)]
pub struct LsItem {
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
    pub modified: SystemTime,
}

#[derive(Debug)]
pub struct LsOutput {
    pub items: Vec<LsItem>,
}

impl fmt::Display for LsOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.items.is_empty() {
            return write!(f, "No items found");
        }

        let mut table = Table::new();
        table.set_header(vec!["TYPE", "PATH", "SIZE", "MODIFIED"]);
        for item in &self.items {
            let (kind, size) = if item.is_dir {
                ("dir", "-".to_string())
            } else {
                ("file", item.size.to_string())
            };
            let modified: DateTime<Local> = item.modified.into();
            table.add_row(vec![
                kind.to_string(),
                item.path.clone(),
                size,
                modified.format("%Y-%m-%d %H:%M:%S").to_string(),
            ]);
        }
        write!(f, "{table}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LsError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Path(#[from] FsError),
    #[error("listing failed: {0}")]
    Store(#[from] StoreError),
}

#[async_trait::async_trait]
impl Op for Ls {
    type Error = LsError;
    type Output = LsOutput;

    async fn execute(&self, ctx: &OpContext) -> Result<Self::Output, Self::Error> {
        let mut config = ctx.load_config()?;
        if let Some(bucket) = &self.bucket {
            config.mount.bucket = bucket.clone();
        }
        if let Some(url) = &self.store_url {
            config.store.url = Some(url.clone());
        }

        let dir = path::normalize(&self.path)?;
        let mapper = KeyMapper::new(&config.mount.prefix);
        let store = config.build_store()?;
        let objects = store.list(mapper.list_prefix()).await?;

        Ok(LsOutput {
            items: collect_items(&mapper, &dir, objects),
        })
    }
}

/// Entries at or below `dir`, sorted by path. Directory markers show up as
/// directories; keys that are not valid paths are skipped.
fn collect_items(
    mapper: &KeyMapper,
    dir: &str,
    objects: Vec<object_store::RemoteObject>,
) -> Vec<LsItem> {
    let mut items: Vec<LsItem> = objects
        .into_iter()
        .filter_map(|object| {
            let (path, is_dir) = match mapper.classify(&object.key)? {
                RemoteKey::File(path) => (path, false),
                RemoteKey::Directory(path) => (path, true),
            };
            let visible = path::is_within(&path, dir) || (path == dir && !is_dir);
            visible.then_some(LsItem {
                path,
                is_dir,
                size: object.size,
                modified: object.modified,
            })
        })
        .collect();
    items.sort_by(|a, b| a.path.cmp(&b.path));
    items
}
