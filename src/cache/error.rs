use thiserror::Error;

use super::backend::BackendKind;

/// Failure raised by a storage adapter.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("quota exceeded on {backend}: needed {needed} bytes, {available} available")]
    QuotaExceeded {
        backend: BackendKind,
        needed: u64,
        available: u64,
    },
    #[error("{backend} operation `{op}` timed out")]
    Timeout {
        backend: BackendKind,
        op: &'static str,
    },
    #[error("{backend} record is corrupt: {message}")]
    Corrupt {
        backend: BackendKind,
        message: String,
    },
    #[error("{backend} operation failed: {message}")]
    Other {
        backend: BackendKind,
        message: String,
    },
}

impl BackendError {
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }

    pub fn other(backend: BackendKind, message: impl Into<String>) -> Self {
        Self::Other {
            backend,
            message: message.into(),
        }
    }

    pub fn corrupt(backend: BackendKind, message: impl Into<String>) -> Self {
        Self::Corrupt {
            backend,
            message: message.into(),
        }
    }
}

/// Errors surfaced by the unified cache manager to its callers.
///
/// Everything not listed here is recovered locally and only shows up in
/// telemetry.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("quota exceeded on {backend} after cleanup and retry")]
    QuotaExceeded {
        backend: BackendKind,
        #[source]
        source: BackendError,
    },
    #[error("storage backend {0} is not available")]
    UnsupportedBackend(BackendKind),
    #[error("integrity mismatch for `{key}`: expected {expected}, computed {actual}")]
    IntegrityMismatch {
        key: String,
        expected: String,
        actual: String,
    },
    #[error("integrity initialization failed: {0}")]
    IntegrityInitFailed(String),
    #[error("value could not be serialized: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("compression failed: {0}")]
    Compression(String),
    #[error(transparent)]
    Backend(BackendError),
}

impl CacheError {
    /// Stable machine-readable code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::QuotaExceeded { .. } => "QUOTA_EXCEEDED",
            Self::UnsupportedBackend(_) => "UNSUPPORTED_BACKEND",
            Self::IntegrityMismatch { .. } => "INTEGRITY_MISMATCH",
            Self::IntegrityInitFailed(_) => "INTEGRITY_INIT_FAILED",
            Self::Serialization(_) => "SERIALIZATION_FAILED",
            Self::Compression(_) => "COMPRESSION_FAILED",
            Self::Backend(_) => "BACKEND_FAILED",
        }
    }
}

impl From<BackendError> for CacheError {
    fn from(error: BackendError) -> Self {
        match error {
            BackendError::QuotaExceeded { backend, .. } => Self::QuotaExceeded {
                backend,
                source: error,
            },
            other => Self::Backend(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_backend_error_maps_to_quota_code() {
        let err = CacheError::from(BackendError::QuotaExceeded {
            backend: BackendKind::SmallSync,
            needed: 10,
            available: 2,
        });
        assert_eq!(err.code(), "QUOTA_EXCEEDED");
    }

    #[test]
    fn other_backend_errors_stay_wrapped() {
        let err = CacheError::from(BackendError::other(BackendKind::LargeAsync, "boom"));
        assert_eq!(err.code(), "BACKEND_FAILED");
        assert!(err.to_string().contains("boom"));
    }
}
