//! [`RemoteStore`] backed by the `object_store` crate.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{Result, StoreError};
use crate::store::{RemoteObject, RemoteStore};

const DEFAULT_REGION: &str = "us-east-1";

/// Which backend to talk to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ObjectStoreConfig {
    /// S3 or an S3-compatible service such as MinIO.
    S3 {
        endpoint: Option<String>,
        access_key: Option<String>,
        secret_key: Option<String>,
        bucket: String,
        region: Option<String>,
    },
    /// A directory on local disk.
    Local { path: PathBuf },
    /// Process memory. Contents vanish on exit.
    Memory,
}

impl ObjectStoreConfig {
    /// Parse a store URL.
    ///
    /// Accepted forms:
    /// - `s3://access_key:secret_key@host:port/bucket` (MinIO style, plain http)
    /// - `s3://bucket` (credentials and region from the environment)
    /// - `file:///absolute/path`
    /// - `memory://`
    pub fn from_url(raw: &str) -> Result<Self> {
        let url = url::Url::parse(raw)
            .map_err(|e| StoreError::Config(format!("invalid store url {raw:?}: {e}")))?;

        match url.scheme() {
            "s3" => {
                let path_bucket = url.path().trim_matches('/');
                let has_endpoint = !url.username().is_empty() || url.port().is_some();

                if has_endpoint {
                    let host = url.host_str().ok_or_else(|| {
                        StoreError::Config("s3 url is missing a host".to_string())
                    })?;
                    if path_bucket.is_empty() {
                        return Err(StoreError::Config(
                            "s3 url is missing a bucket name".to_string(),
                        ));
                    }
                    let endpoint = match url.port() {
                        Some(port) => format!("http://{host}:{port}"),
                        None => format!("http://{host}"),
                    };
                    Ok(ObjectStoreConfig::S3 {
                        endpoint: Some(endpoint),
                        access_key: Some(url.username().to_string()),
                        secret_key: url.password().map(str::to_string),
                        bucket: path_bucket.to_string(),
                        region: None,
                    })
                } else {
                    let bucket = url.host_str().unwrap_or_default();
                    if bucket.is_empty() {
                        return Err(StoreError::Config(
                            "s3 url is missing a bucket name".to_string(),
                        ));
                    }
                    Ok(ObjectStoreConfig::S3 {
                        endpoint: None,
                        access_key: None,
                        secret_key: None,
                        bucket: bucket.to_string(),
                        region: None,
                    })
                }
            }
            "file" => {
                let path = url
                    .to_file_path()
                    .map_err(|_| StoreError::Config(format!("invalid file url {raw:?}")))?;
                Ok(ObjectStoreConfig::Local { path })
            }
            "memory" => Ok(ObjectStoreConfig::Memory),
            other => Err(StoreError::Config(format!(
                "unsupported store scheme {other:?}"
            ))),
        }
    }

    /// Override the region of an S3 config. No-op for other backends.
    pub fn with_region(mut self, new_region: Option<String>) -> Self {
        if let ObjectStoreConfig::S3 { region, .. } = &mut self {
            if new_region.is_some() {
                *region = new_region;
            }
        }
        self
    }

    /// Human readable description with credentials masked.
    pub fn describe(&self) -> String {
        match self {
            ObjectStoreConfig::S3 {
                endpoint, bucket, ..
            } => match endpoint {
                Some(endpoint) => format!("s3 ({endpoint}/{bucket})"),
                None => format!("s3 ({bucket})"),
            },
            ObjectStoreConfig::Local { path } => format!("local ({})", path.display()),
            ObjectStoreConfig::Memory => "memory".to_string(),
        }
    }
}

/// Remote store implemented on top of an `object_store` backend.
#[derive(Debug, Clone)]
pub struct Storage {
    inner: Arc<dyn ObjectStore>,
    name: String,
}

impl Storage {
    pub fn new(config: ObjectStoreConfig) -> Result<Self> {
        let name = config.describe();
        let inner: Arc<dyn ObjectStore> = match config {
            ObjectStoreConfig::S3 {
                endpoint,
                access_key,
                secret_key,
                bucket,
                region,
            } => {
                let mut builder = AmazonS3Builder::from_env()
                    .with_bucket_name(bucket)
                    .with_region(region.unwrap_or_else(|| DEFAULT_REGION.to_string()));
                if let Some(endpoint) = endpoint {
                    let allow_http = endpoint.starts_with("http://");
                    builder = builder.with_endpoint(endpoint).with_allow_http(allow_http);
                }
                if let Some(access_key) = access_key {
                    builder = builder.with_access_key_id(access_key);
                }
                if let Some(secret_key) = secret_key {
                    builder = builder.with_secret_access_key(secret_key);
                }
                Arc::new(
                    builder
                        .build()
                        .map_err(|e| StoreError::Config(e.to_string()))?,
                )
            }
            ObjectStoreConfig::Local { path } => {
                std::fs::create_dir_all(&path).map_err(|e| {
                    StoreError::Config(format!("cannot create {}: {e}", path.display()))
                })?;
                Arc::new(
                    LocalFileSystem::new_with_prefix(&path)
                        .map_err(|e| StoreError::Config(e.to_string()))?,
                )
            }
            ObjectStoreConfig::Memory => Arc::new(InMemory::new()),
        };

        info!(store = %name, "object store initialised");
        Ok(Self { inner, name })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl RemoteStore for Storage {
    async fn get(&self, key: &str) -> Result<Bytes> {
        let result = self.inner.get(&Path::from(key)).await?;
        let data = result.bytes().await?;
        debug!(key, size = data.len(), "fetched object");
        Ok(data)
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let size = data.len();
        self.inner
            .put(&Path::from(key), PutPayload::from(data))
            .await?;
        debug!(key, size, "stored object");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.delete(&Path::from(key)).await?;
        debug!(key, "deleted object");
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<RemoteObject>> {
        let prefix = prefix.trim_matches('/');
        let prefix_path = (!prefix.is_empty()).then(|| Path::from(prefix));

        let metas: Vec<object_store::ObjectMeta> = self.inner.list(prefix_path.as_ref()).try_collect().await?;
        let objects = metas
            .into_iter()
            .map(|meta| RemoteObject {
                key: meta.location.as_ref().to_string(),
                size: meta.size as u64,
                modified: SystemTime::from(meta.last_modified),
            })
            .collect::<Vec<_>>();

        debug!(prefix, count = objects.len(), "listed objects");
        Ok(objects)
    }
}
