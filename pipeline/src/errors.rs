use crate::executor::BackendError;
use thiserror::Error;

/// Errors that can occur while planning, running or merging a batch.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// IO error occurred (shard files, fingerprints, canonical record)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error (TOML, JSON, CSV)
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error (invalid config, missing fields, etc.)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Fatal error while building a dispatch plan (e.g. no devices)
    #[error("Plan error: {0}")]
    Plan(String),

    /// Compute backend reported a failure for a work item
    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    /// Writing the canonical record failed; the previous file is still intact
    #[error("Merge error: {0}")]
    Merge(String),

    /// Work queue error
    #[error("Queue error: {0}")]
    Queue(String),
}

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, PipelineError>;

impl From<toml::ser::Error> for PipelineError {
    fn from(e: toml::ser::Error) -> Self {
        PipelineError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for PipelineError {
    fn from(e: toml::de::Error) -> Self {
        PipelineError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for PipelineError {
    fn from(e: serde_json::Error) -> Self {
        PipelineError::Serialization(e.to_string())
    }
}

impl From<csv::Error> for PipelineError {
    fn from(e: csv::Error) -> Self {
        PipelineError::Serialization(e.to_string())
    }
}
