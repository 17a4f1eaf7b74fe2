use object_store::StoreError;
use thiserror::Error;

/// Errors returned by filesystem operations.
///
/// Every variant maps onto a POSIX errno through [`FsError::errno`], which is
/// what a kernel bridge hands back to the caller.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("no such file or directory: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not a directory: {0}")]
    NotADirectory(String),

    #[error("is a directory: {0}")]
    IsADirectory(String),

    #[error("directory not empty: {0}")]
    DirectoryNotEmpty(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// The local cache disk failed.
    #[error("local i/o error: {0}")]
    LocalIo(#[from] std::io::Error),

    /// A read-through fetch could not reach the bucket.
    #[error("remote store unavailable: {0}")]
    RemoteUnavailable(String),

    /// The cache is over its bound and nothing is evictable.
    #[error("cache exhausted: need {needed} bytes, {used} of {limit} bytes in use")]
    CacheExhausted { needed: u64, used: u64, limit: u64 },

    /// The write-back pipeline gave up on an entry.
    #[error("upload of {path} failed: {reason}")]
    UploadFailed { path: String, reason: String },

    /// A remote change was ignored because local state was newer.
    #[error("remote change ignored for {0}: local changes pending")]
    ConflictIgnored(String),

    #[error("bad file handle: {0}")]
    BadHandle(u64),

    #[error("no such attribute: {0}")]
    NoAttribute(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl FsError {
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound(_) => libc::ENOENT,
            FsError::AlreadyExists(_) => libc::EEXIST,
            FsError::NotADirectory(_) => libc::ENOTDIR,
            FsError::IsADirectory(_) => libc::EISDIR,
            FsError::DirectoryNotEmpty(_) => libc::ENOTEMPTY,
            FsError::InvalidPath(_) | FsError::Config(_) => libc::EINVAL,
            FsError::LocalIo(err) => err.raw_os_error().unwrap_or(libc::EIO),
            FsError::RemoteUnavailable(_) | FsError::UploadFailed { .. } => libc::EIO,
            FsError::CacheExhausted { .. } => libc::ENOSPC,
            FsError::ConflictIgnored(_) => libc::EAGAIN,
            FsError::BadHandle(_) => libc::EBADF,
            FsError::NoAttribute(_) => libc::ENODATA,
        }
    }
}

impl From<StoreError> for FsError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(key) => FsError::NotFound(key),
            StoreError::Config(msg) => FsError::Config(msg),
            other => FsError::RemoteUnavailable(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, FsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(FsError::NotFound("/a".into()).errno(), libc::ENOENT);
        assert_eq!(FsError::AlreadyExists("/a".into()).errno(), libc::EEXIST);
        assert_eq!(FsError::DirectoryNotEmpty("/d".into()).errno(), libc::ENOTEMPTY);
        assert_eq!(
            FsError::CacheExhausted {
                needed: 10,
                used: 100,
                limit: 100
            }
            .errno(),
            libc::ENOSPC
        );
        assert_eq!(
            FsError::UploadFailed {
                path: "/a".into(),
                reason: "boom".into()
            }
            .errno(),
            libc::EIO
        );
        assert_eq!(FsError::BadHandle(7).errno(), libc::EBADF);
        assert_eq!(FsError::NoAttribute("user.x".into()).errno(), libc::ENODATA);
    }

    #[test]
    fn test_local_io_keeps_os_error() {
        let err = FsError::from(std::io::Error::from_raw_os_error(libc::EROFS));
        assert_eq!(err.errno(), libc::EROFS);

        let err = FsError::from(std::io::Error::new(std::io::ErrorKind::Other, "disk"));
        assert_eq!(err.errno(), libc::EIO);
    }

    #[test]
    fn test_store_error_conversion() {
        assert!(matches!(
            FsError::from(StoreError::NotFound("a.txt".into())),
            FsError::NotFound(_)
        ));
        assert!(matches!(
            FsError::from(StoreError::Unavailable("down".into())),
            FsError::RemoteUnavailable(_)
        ));
    }
}
