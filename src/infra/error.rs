use thiserror::Error;

use crate::cache::CacheError;

#[derive(Debug, Error)]
pub enum InfraError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("telemetry initialization failed: {0}")]
    Telemetry(String),
    #[error("configuration error: {message}")]
    Configuration { message: String },
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("integrity manifest drift: {drifted} file(s) differ")]
    ManifestDrift { drifted: usize },
}

impl InfraError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn telemetry(message: impl Into<String>) -> Self {
        Self::Telemetry(message.into())
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Io(_) => "IO",
            Self::Telemetry(_) => "TELEMETRY_INIT_FAILED",
            Self::Configuration { .. } => "CONFIGURATION",
            Self::Cache(err) => err.code(),
            Self::ManifestDrift { .. } => "MANIFEST_DRIFT",
        }
    }
}
