//! Mount configuration.
//!
//! [`MountConfig`] is deserialised from the daemon's TOML file (with CLI
//! overrides applied on top) and validated once before the engine starts.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::FsError;

const MB: u64 = 1024 * 1024;
const MAX_RETRY_DELAY: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Where the filesystem is exposed.
    pub mount_path: PathBuf,
    /// Remote bucket name.
    pub bucket: String,
    /// Sub-tree of the bucket that is mounted. Empty mounts the whole bucket.
    pub prefix: String,
    /// Local storage for cached content. Defaults to the user cache dir.
    pub cache_dir: Option<PathBuf>,
    /// Eviction trigger threshold in megabytes.
    pub cache_size_mb: u64,
    /// In-memory hot-content layer in megabytes (0 disables it).
    pub memory_cache_mb: u64,
    /// Quiescence window before a written file is uploaded.
    pub upload_delay_secs: f64,
    /// Interval between directory refreshes. 0 refreshes only at mount.
    pub update_period_secs: u64,
    /// Upload worker pool size.
    pub workers: usize,
    /// Attempts per task before an entry is marked upload-failed.
    pub max_upload_attempts: u32,
    /// Base of the exponential retry backoff.
    pub retry_base_ms: u64,
    /// Timeout for a single remote call made by the uploader.
    pub upload_timeout_secs: u64,
    /// Return from the mount command immediately.
    pub background: bool,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            mount_path: PathBuf::new(),
            bucket: String::new(),
            prefix: String::new(),
            cache_dir: None,
            cache_size_mb: 1024,
            memory_cache_mb: 64,
            upload_delay_secs: 5.0,
            update_period_secs: 60,
            workers: 4,
            max_upload_attempts: 5,
            retry_base_ms: 1000,
            upload_timeout_secs: 60,
            background: false,
        }
    }
}

impl MountConfig {
    pub fn validate(&self) -> Result<(), FsError> {
        if self.bucket.trim().is_empty() {
            return Err(FsError::Config("bucket must be set".to_string()));
        }
        if self.cache_size_mb == 0 {
            return Err(FsError::Config(
                "cache_size_mb must be greater than zero".to_string(),
            ));
        }
        if self.workers == 0 {
            return Err(FsError::Config(
                "workers must be greater than zero".to_string(),
            ));
        }
        if self.max_upload_attempts == 0 {
            return Err(FsError::Config(
                "max_upload_attempts must be greater than zero".to_string(),
            ));
        }
        if !self.upload_delay_secs.is_finite() || self.upload_delay_secs < 0.0 {
            return Err(FsError::Config(format!(
                "upload_delay_secs must be a non-negative number, got {}",
                self.upload_delay_secs
            )));
        }
        if self.upload_timeout_secs == 0 {
            return Err(FsError::Config(
                "upload_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.prefix.split('/').any(|part| part == "." || part == "..") {
            return Err(FsError::Config(format!(
                "prefix may not contain relative components: {:?}",
                self.prefix
            )));
        }
        Ok(())
    }

    pub fn cache_size_bytes(&self) -> u64 {
        self.cache_size_mb.saturating_mul(MB)
    }

    pub fn memory_cache_bytes(&self) -> u64 {
        self.memory_cache_mb.saturating_mul(MB)
    }

    pub fn upload_delay(&self) -> Duration {
        Duration::from_secs_f64(self.upload_delay_secs.max(0.0))
    }

    /// `None` when periodic refresh is disabled.
    pub fn update_period(&self) -> Option<Duration> {
        (self.update_period_secs > 0).then(|| Duration::from_secs(self.update_period_secs))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_upload_attempts,
            base_delay: Duration::from_millis(self.retry_base_ms),
            max_delay: MAX_RETRY_DELAY,
            attempt_timeout: Duration::from_secs(self.upload_timeout_secs),
        }
    }

    /// Resolved cache directory: the configured one, or
    /// `<user cache dir>/bucketfs/<bucket>`.
    pub fn resolved_cache_dir(&self) -> Result<PathBuf, FsError> {
        if let Some(dir) = &self.cache_dir {
            return Ok(dir.clone());
        }
        let base = dirs::cache_dir()
            .ok_or_else(|| FsError::Config("no user cache directory available".to_string()))?;
        Ok(base.join("bucketfs").join(&self.bucket))
    }
}

/// Retry and timeout policy for the write-back pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub attempt_timeout: Duration,
}

impl RetryPolicy {
    /// Delay before the next attempt, given how many attempts already failed.
    pub fn backoff(&self, failed_attempts: u32) -> Duration {
        let exponent = failed_attempts.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> MountConfig {
        MountConfig {
            bucket: "photos".to_string(),
            mount_path: PathBuf::from("/mnt/photos"),
            ..Default::default()
        }
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = valid();
        config.validate().unwrap();
        assert_eq!(config.upload_delay(), Duration::from_secs(5));
        assert_eq!(config.update_period(), Some(Duration::from_secs(60)));
        assert_eq!(config.cache_size_bytes(), 1024 * MB);
    }

    #[test]
    fn test_zero_update_period_disables_refresh() {
        let config = MountConfig {
            update_period_secs: 0,
            ..valid()
        };
        assert_eq!(config.update_period(), None);
    }

    #[test]
    fn test_rejects_zero_workers_and_cache() {
        let config = MountConfig {
            workers: 0,
            ..valid()
        };
        assert!(matches!(config.validate(), Err(FsError::Config(_))));

        let config = MountConfig {
            cache_size_mb: 0,
            ..valid()
        };
        assert!(matches!(config.validate(), Err(FsError::Config(_))));
    }

    #[test]
    fn test_rejects_bad_delay_and_prefix() {
        let config = MountConfig {
            upload_delay_secs: -1.0,
            ..valid()
        };
        assert!(config.validate().is_err());

        let config = MountConfig {
            prefix: "a/../b".to_string(),
            ..valid()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: MountConfig = toml::from_str(
            r#"
            bucket = "photos"
            mount_path = "/mnt/photos"
            upload_delay_secs = 0.5
            workers = 8
            "#,
        )
        .unwrap();
        assert_eq!(config.workers, 8);
        assert_eq!(config.upload_delay(), Duration::from_millis(500));
        assert_eq!(config.cache_size_mb, 1024);
        assert!(!config.background);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            attempt_timeout: Duration::from_secs(10),
        };
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(4), Duration::from_secs(8));
        assert_eq!(policy.backoff(30), Duration::from_secs(60));
    }
}
