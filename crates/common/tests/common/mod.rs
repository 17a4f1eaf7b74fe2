//! Shared setup for the engine integration tests.
#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use ::common::prelude::*;
use object_store::MemoryStore;
use tempfile::TempDir;

/// Debounce used by every test mount.
pub const UPLOAD_DELAY: Duration = Duration::from_secs(1);

pub struct TestMount {
    pub fs: BucketFs,
    pub store: Arc<MemoryStore>,
    pub cache_dir: TempDir,
}

/// Mount settings for tests: short debounce, quick retries, no periodic
/// refresh (tests call `refresh_now`).
pub fn test_config(cache_dir: &Path) -> MountConfig {
    MountConfig {
        bucket: "test-bucket".to_string(),
        cache_dir: Some(cache_dir.to_path_buf()),
        cache_size_mb: 4,
        memory_cache_mb: 1,
        upload_delay_secs: UPLOAD_DELAY.as_secs_f64(),
        update_period_secs: 0,
        workers: 2,
        max_upload_attempts: 3,
        retry_base_ms: 100,
        upload_timeout_secs: 5,
        ..MountConfig::default()
    }
}

pub async fn setup_mount() -> TestMount {
    setup_mount_with(Arc::new(MemoryStore::new()), |_| {}).await
}

pub async fn setup_mount_with(
    store: Arc<MemoryStore>,
    configure: impl FnOnce(&mut MountConfig),
) -> TestMount {
    let cache_dir = TempDir::new().expect("temp dir");
    let mut config = test_config(cache_dir.path());
    configure(&mut config);
    let fs = BucketFs::mount(config, store.clone())
        .await
        .expect("mount");
    TestMount {
        fs,
        store,
        cache_dir,
    }
}

/// Let debounce timers fire and the workers finish. Time is paused in
/// these tests, so this returns as soon as the runtime goes idle.
pub async fn settle() {
    tokio::time::sleep(UPLOAD_DELAY * 3).await;
}

pub async fn write_file(fs: &BucketFs, path: &str, data: &[u8]) {
    if fs.getattr(path).is_err() {
        fs.create(path, None).expect("create");
    }
    fs.write(path, 0, data).await.expect("write");
}

pub async fn read_all(fs: &BucketFs, path: &str) -> Vec<u8> {
    let size = fs.getattr(path).expect("getattr").size();
    fs.read(path, 0, size as usize)
        .await
        .expect("read")
        .to_vec()
}
