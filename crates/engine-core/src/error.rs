use connectors::error::StorageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProgressError {
    #[error("Progress storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Local progress store error: {0}")]
    Sled(#[from] sled::Error),

    #[error("Failed to encode progress entry: {0}")]
    Codec(String),

    #[error("Progress tracker is no longer running")]
    Closed,

    #[error("Progress tracker stopped abnormally: {0}")]
    TrackerFailed(String),
}

impl From<bincode::Error> for ProgressError {
    fn from(err: bincode::Error) -> Self {
        ProgressError::Codec(err.to_string())
    }
}

impl From<serde_json::Error> for ProgressError {
    fn from(err: serde_json::Error) -> Self {
        ProgressError::Codec(err.to_string())
    }
}
