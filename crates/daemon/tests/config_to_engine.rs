//! A daemon config file drives a real engine against a directory-backed
//! store, without a kernel mount.

use std::path::Path;
use std::sync::Arc;

use bucketfs_daemon::DaemonConfig;
use common::BucketFs;
use tempfile::TempDir;

fn config_for(bucket_dir: &Path, cache_dir: &Path) -> DaemonConfig {
    let raw = format!(
        r#"
        mount_path = "/mnt/test"
        bucket = "test"
        prefix = "docs"
        cache_dir = "{}"
        upload_delay_secs = 0.0
        update_period_secs = 0

        [store]
        url = "file://{}"
        "#,
        cache_dir.display(),
        bucket_dir.display()
    );
    let config = DaemonConfig::parse(&raw).unwrap();
    config.validate().unwrap();
    config
}

async fn mount(config: &DaemonConfig) -> Arc<BucketFs> {
    let store = config.build_store().unwrap();
    Arc::new(BucketFs::mount(config.mount.clone(), store).await.unwrap())
}

#[tokio::test]
async fn test_written_file_lands_under_prefix() {
    let bucket = TempDir::new().unwrap();
    let cache = TempDir::new().unwrap();
    let config = config_for(bucket.path(), cache.path());
    let fs = mount(&config).await;

    fs.mkdir("/notes", None).unwrap();
    fs.create("/notes/todo.txt", None).unwrap();
    fs.write("/notes/todo.txt", 0, b"buy milk").await.unwrap();
    fs.fsync("/notes/todo.txt").await.unwrap();

    let on_disk = std::fs::read(bucket.path().join("docs/notes/todo.txt")).unwrap();
    assert_eq!(on_disk, b"buy milk");

    let report = fs.unmount().await.unwrap();
    assert!(report.failed.is_empty());
}

#[tokio::test]
async fn test_second_mount_sees_uploaded_content() {
    let bucket = TempDir::new().unwrap();
    let first_cache = TempDir::new().unwrap();
    let config = config_for(bucket.path(), first_cache.path());
    let fs = mount(&config).await;
    fs.create("/a.txt", None).unwrap();
    fs.write("/a.txt", 0, b"hello").await.unwrap();
    fs.unmount().await.unwrap();

    let cache = TempDir::new().unwrap();
    let config = config_for(bucket.path(), cache.path());
    let fs = mount(&config).await;

    let names: Vec<String> = fs
        .readdir("/")
        .unwrap()
        .into_iter()
        .map(|entry| entry.name)
        .collect();
    assert_eq!(names, vec!["a.txt"]);
    assert_eq!(fs.getattr("/a.txt").unwrap().size(), 5);
    assert_eq!(&fs.read("/a.txt", 0, 16).await.unwrap()[..], b"hello");
}
