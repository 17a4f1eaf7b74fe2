//! Daemon configuration.
//!
//! One TOML file holds the mount settings at the top level plus `[store]`
//! and `[log]` tables:
//!
//! ```toml
//! mount_path = "/mnt/photos"
//! bucket = "photos"
//! upload_delay_secs = 2.0
//!
//! [store]
//! url = "s3://minioadmin:minioadmin@localhost:9000/photos"
//!
//! [log]
//! level = "debug"
//! dir = "/var/log/bucketfs"
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use common::{FsError, MountConfig};
use object_store::{ObjectStoreConfig, RemoteStore, Storage, StoreError};
use serde::{Deserialize, Serialize};

pub const CONFIG_FILE_NAME: &str = "config.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    #[serde(flatten)]
    pub mount: MountConfig,
    pub store: StoreSettings,
    pub log: LogSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreSettings {
    /// `s3://…`, `file:///…` or `memory://`. Defaults to `s3://<bucket>` with
    /// credentials taken from the environment.
    pub url: Option<String>,
    pub region: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Write a daily-rolling log file here in addition to stderr.
    pub dir: Option<PathBuf>,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error(transparent)]
    Invalid(#[from] FsError),
    #[error("store: {0}")]
    Store(#[from] StoreError),
}

impl DaemonConfig {
    /// `<user config dir>/bucketfs/config.toml`, when the platform has one.
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "bucketfs")
            .map(|dirs| dirs.config_dir().join(CONFIG_FILE_NAME))
    }

    /// Load `path`, or the default location when `path` is `None`. A missing
    /// default file yields the built-in defaults; a missing explicit file is
    /// an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) if path.exists() => path,
                _ => return Ok(Self::default()),
            },
        };
        let raw = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        Self::parse(&raw).map_err(|source| ConfigError::Parse { path, source })
    }

    pub fn parse(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.mount.validate()?;
        if self.mount.mount_path.as_os_str().is_empty() {
            return Err(FsError::Config("mount_path must be set".to_string()).into());
        }
        Ok(())
    }

    pub fn store_config(&self) -> Result<ObjectStoreConfig, ConfigError> {
        let url = match &self.store.url {
            Some(url) => url.clone(),
            None if !self.mount.bucket.is_empty() => format!("s3://{}", self.mount.bucket),
            None => {
                return Err(FsError::Config("store.url or bucket must be set".to_string()).into())
            }
        };
        Ok(ObjectStoreConfig::from_url(&url)?.with_region(self.store.region.clone()))
    }

    pub fn build_store(&self) -> Result<Arc<dyn RemoteStore>, ConfigError> {
        let storage = Storage::new(self.store_config()?)?;
        Ok(Arc::new(storage))
    }
}
