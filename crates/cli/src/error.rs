use connectors::error::{DbError, StorageError};
use engine_config::error::ConfigError;
use engine_runtime::error::{BinlogError, CopyError, DumpError, LoadError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("Failed to read the options file: {0}")]
    OptionsRead(#[from] std::io::Error),

    #[error("Invalid options: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to serialize data to JSON: {0}")]
    JsonSerialize(#[from] serde_json::Error),

    #[error("Invalid table name '{0}', expected schema.table")]
    InvalidTableName(String),

    #[error("Database error: {0}")]
    Db(#[from] DbError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Dump failed: {0}")]
    Dump(#[from] DumpError),

    #[error("Load failed: {0}")]
    Load(#[from] LoadError),

    #[error("Binary log operation failed: {0}")]
    Binlog(#[from] BinlogError),

    #[error("Copy failed: {0}")]
    Copy(#[from] CopyError),

    #[error("Unexpected error: {0}")]
    Unexpected(String),
}
