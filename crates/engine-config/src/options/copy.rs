use super::{DumpOptions, LoadOptions, Options};
use crate::{
    error::ConfigError,
    settings::{DialectConfig, StorageConfig},
};
use model::dump::task::Compression;
use serde::Deserialize;

/// Options of a copy: a dump and a load running side by side.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CopyOptions {
    pub dump: DumpOptions,
    pub load: LoadOptions,
}

impl CopyOptions {
    /// Load options adjusted for reading a dump that is still being written.
    pub fn effective_load(&self) -> LoadOptions {
        let mut load = self.load.clone().wait_forever();
        load.dry_run = self.load.dry_run || self.dump.dry_run;
        load.ddl_only = self.dump.ddl_only;
        load.data_only = self.dump.data_only;
        load
    }

    pub fn effective_dump(&self) -> DumpOptions {
        let mut dump = self.dump.clone();
        // The dump never leaves process memory.
        dump.compression = Compression::None;
        dump.dry_run = self.dump.dry_run || self.load.dry_run;
        dump
    }
}

impl Options for CopyOptions {
    fn validate(&self) -> Result<(), ConfigError> {
        self.dump.validate()?;
        self.load.validate()?;
        if self.load.wait_dump_timeout.is_some() {
            return Err(ConfigError::invalid(
                "load.waitDumpTimeout",
                "is managed by the copy itself",
            ));
        }
        Ok(())
    }
}

/// Options of a single-table export.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExportOptions {
    #[serde(flatten)]
    pub dialect: DialectConfig,
    pub compression: Compression,
    #[serde(rename = "where")]
    pub where_clause: Option<String>,
    pub storage: StorageConfig,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            dialect: DialectConfig::default(),
            compression: Compression::None,
            where_clause: None,
            storage: StorageConfig::default(),
        }
    }
}

impl Options for ExportOptions {
    fn validate(&self) -> Result<(), ConfigError> {
        self.dialect.resolve()?;
        self.storage.validate()
    }
}
