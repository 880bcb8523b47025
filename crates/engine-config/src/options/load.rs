use super::{Options, validate_threads};
use crate::{
    error::ConfigError,
    filter::FilterConfig,
    settings::{StorageConfig, bytes::deserialize_bytes},
};
use serde::Deserialize;
use std::time::Duration;

/// What to do when an object being created already exists on the target.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OnConflict {
    #[default]
    Abort,
    DropAndRecreate,
    Ignore,
}

/// What to do when creating an account or granting privileges fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GrantErrors {
    #[default]
    Abort,
    DropAccount,
    Ignore,
}

/// Secondary indexes created only after the data is loaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DeferIndexes {
    Off,
    #[default]
    Fulltext,
    All,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AnalyzeTables {
    #[default]
    Off,
    Histogram,
    On,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoadOptions {
    pub threads: usize,
    pub ddl_only: bool,
    pub data_only: bool,
    pub load_users: bool,
    pub skip_binlog: bool,
    pub reset_progress: bool,
    pub dry_run: bool,
    pub checksum: bool,
    pub show_progress: bool,
    pub analyze_tables: AnalyzeTables,
    pub defer_table_indexes: DeferIndexes,
    pub on_conflict: OnConflict,
    pub grant_errors: GrantErrors,
    /// Seconds to wait for an incomplete dump to make progress. `None`
    /// fails immediately on an incomplete dump.
    pub wait_dump_timeout: Option<f64>,
    /// Size of one INSERT batch.
    #[serde(deserialize_with = "deserialize_bytes")]
    pub bytes_per_transaction: u64,
    /// Overrides the character set recorded in the dump.
    pub character_set: Option<String>,
    #[serde(flatten)]
    pub filter: FilterConfig,
    pub storage: StorageConfig,
    pub session_init_sql: Vec<String>,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            threads: 4,
            ddl_only: false,
            data_only: false,
            load_users: false,
            skip_binlog: false,
            reset_progress: false,
            dry_run: false,
            checksum: false,
            show_progress: true,
            analyze_tables: AnalyzeTables::Off,
            defer_table_indexes: DeferIndexes::Fulltext,
            on_conflict: OnConflict::Abort,
            grant_errors: GrantErrors::Abort,
            wait_dump_timeout: None,
            bytes_per_transaction: 1 << 20,
            character_set: None,
            filter: FilterConfig::default(),
            storage: StorageConfig::default(),
            session_init_sql: Vec::new(),
        }
    }
}

impl LoadOptions {
    pub fn wait_dump_timeout(&self) -> Option<Duration> {
        self.wait_dump_timeout
            .filter(|secs| *secs > 0.0)
            .map(|secs| Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX))
    }

    /// Waits for the dump for as long as it takes.
    pub fn wait_forever(mut self) -> Self {
        self.wait_dump_timeout = Some(f64::INFINITY);
        self
    }
}

impl Options for LoadOptions {
    fn validate(&self) -> Result<(), ConfigError> {
        validate_threads(self.threads)?;
        if self.ddl_only && self.data_only {
            return Err(ConfigError::Conflict("ddlOnly", "dataOnly"));
        }
        if let Some(t) = self.wait_dump_timeout
            && (t.is_nan() || t < 0.0)
        {
            return Err(ConfigError::invalid("waitDumpTimeout", "must not be negative"));
        }
        if self.bytes_per_transaction < 4096 {
            return Err(ConfigError::invalid("bytesPerTransaction", "must be at least 4k"));
        }
        self.filter.validate()?;
        self.storage.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_enums() {
        let options = LoadOptions::from_json(
            r#"{"onConflict":"dropAndRecreate","grantErrors":"ignore","deferTableIndexes":"all",
                "analyzeTables":"histogram","waitDumpTimeout":30,"bytesPerTransaction":"64k"}"#,
        )
        .unwrap();
        assert_eq!(options.on_conflict, OnConflict::DropAndRecreate);
        assert_eq!(options.grant_errors, GrantErrors::Ignore);
        assert_eq!(options.defer_table_indexes, DeferIndexes::All);
        assert_eq!(options.analyze_tables, AnalyzeTables::Histogram);
        assert_eq!(options.wait_dump_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(options.bytes_per_transaction, 64 * 1024);
    }

    #[test]
    fn wait_forever_saturates() {
        let options = LoadOptions::default().wait_forever();
        assert_eq!(options.wait_dump_timeout(), Some(Duration::MAX));
        assert_eq!(LoadOptions::default().wait_dump_timeout(), None);
    }

    #[test]
    fn rejects_invalid_combinations() {
        assert!(LoadOptions::from_json(r#"{"ddlOnly":true,"dataOnly":true}"#).is_err());
        assert!(LoadOptions::from_json(r#"{"waitDumpTimeout":-1}"#).is_err());
        assert!(LoadOptions::from_json(r#"{"onConflict":"merge"}"#).is_err());
    }
}
