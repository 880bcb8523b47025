pub mod binlog;
pub mod copy;
pub mod dump;
pub mod load;

pub use binlog::{BinlogDumpOptions, BinlogLoadOptions, BinlogStart};
pub use copy::{CopyOptions, ExportOptions};
pub use dump::{DumpOptions, DumpScope};
pub use load::{AnalyzeTables, DeferIndexes, GrantErrors, LoadOptions, OnConflict};

use crate::error::ConfigError;
use serde::de::DeserializeOwned;

/// Parses options from JSON and validates them.
pub trait Options: DeserializeOwned {
    fn validate(&self) -> Result<(), ConfigError>;

    fn from_json(json: &str) -> Result<Self, ConfigError> {
        let options: Self = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }
}

pub(crate) fn validate_threads(threads: usize) -> Result<(), ConfigError> {
    if threads == 0 {
        return Err(ConfigError::invalid("threads", "must be at least 1"));
    }
    Ok(())
}
