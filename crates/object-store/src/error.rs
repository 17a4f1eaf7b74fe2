use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors surfaced by a [`crate::RemoteStore`].
#[derive(Debug, Error)]
pub enum StoreError {
    /// The key does not exist in the bucket.
    #[error("object not found: {0}")]
    NotFound(String),

    /// The store could not be reached or answered with a retryable failure.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store refused the request; retrying will not help.
    #[error("request rejected: {0}")]
    Rejected(String),

    /// Invalid backend configuration.
    #[error("invalid store configuration: {0}")]
    Config(String),
}

impl StoreError {
    /// Whether the failed call may succeed if retried later.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

impl From<object_store::Error> for StoreError {
    fn from(err: object_store::Error) -> Self {
        match err {
            object_store::Error::NotFound { path, .. } => StoreError::NotFound(path),
            object_store::Error::InvalidPath { source } => StoreError::Rejected(source.to_string()),
            object_store::Error::NotSupported { source } => {
                StoreError::Rejected(source.to_string())
            }
            object_store::Error::NotImplemented => {
                StoreError::Rejected("operation not implemented by backend".to_string())
            }
            other => StoreError::Unavailable(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(StoreError::Unavailable("timeout".into()).is_transient());
        assert!(!StoreError::NotFound("a.txt".into()).is_transient());
        assert!(!StoreError::Rejected("denied".into()).is_transient());
        assert!(!StoreError::Config("bad url".into()).is_transient());
    }

    #[test]
    fn test_not_found_conversion() {
        let err = object_store::Error::NotFound {
            path: "a/b.txt".to_string(),
            source: "missing".into(),
        };
        match StoreError::from(err) {
            StoreError::NotFound(path) => assert_eq!(path, "a/b.txt"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_generic_conversion_is_transient() {
        let err = object_store::Error::Generic {
            store: "S3",
            source: "connection reset".into(),
        };
        assert!(StoreError::from(err).is_transient());
    }
}
