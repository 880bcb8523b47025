use model::{core::gtid::GtidError, dump::dialect::DialectError};
use thiserror::Error;

/// Errors raised while validating user supplied options.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("Options '{0}' and '{1}' cannot be used together")]
    Conflict(&'static str, &'static str),

    #[error("Missing value: {0}")]
    Missing(String),

    #[error("Invalid dialect: {0}")]
    Dialect(#[from] DialectError),

    #[error("Invalid GTID: {0}")]
    Gtid(#[from] GtidError),

    #[error("Failed to parse options: {0}")]
    Parse(#[from] serde_json::Error),
}

impl ConfigError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field,
            reason: reason.into(),
        }
    }
}
