use super::{Options, validate_threads};
use crate::{
    error::ConfigError,
    filter::{FilterConfig, split_qualified},
    settings::{ChunkingConfig, CompatibilityConfig, ConsistencyConfig, DialectConfig, StorageConfig},
};
use model::{core::identifiers::ObjectName, dump::task::Compression};
use serde::Deserialize;
use std::collections::HashMap;

/// Which part of the server a dump covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DumpScope {
    Instance,
    Schemas(Vec<String>),
    Tables {
        schema: String,
        tables: Vec<String>,
        all: bool,
    },
}

impl DumpScope {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            DumpScope::Instance => Ok(()),
            DumpScope::Schemas(schemas) if schemas.is_empty() => {
                Err(ConfigError::Missing("list of schemas to dump".into()))
            }
            DumpScope::Schemas(_) => Ok(()),
            DumpScope::Tables { schema, .. } if schema.is_empty() => {
                Err(ConfigError::Missing("schema name".into()))
            }
            DumpScope::Tables { tables, all, .. } => match (tables.is_empty(), *all) {
                (false, true) => Err(ConfigError::invalid(
                    "all",
                    "cannot be combined with an explicit list of tables",
                )),
                (true, false) => Err(ConfigError::Missing("list of tables to dump".into())),
                _ => Ok(()),
            },
        }
    }

    pub fn is_instance(&self) -> bool {
        matches!(self, DumpScope::Instance)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DumpOptions {
    pub threads: usize,
    #[serde(flatten)]
    pub consistency: ConsistencyConfig,
    #[serde(flatten)]
    pub chunking: ChunkingConfig,
    #[serde(flatten)]
    pub compatibility: CompatibilityConfig,
    #[serde(flatten)]
    pub dialect: DialectConfig,
    #[serde(flatten)]
    pub filter: FilterConfig,
    pub storage: StorageConfig,
    pub compression: Compression,
    pub ddl_only: bool,
    pub data_only: bool,
    pub dry_run: bool,
    pub checksum: bool,
    pub tz_utc: bool,
    pub character_set: String,
    pub show_progress: bool,
    pub reset_progress: bool,
    /// Extra row filter per `schema.table`.
    #[serde(rename = "where")]
    pub where_clauses: HashMap<String, String>,
}

impl Default for DumpOptions {
    fn default() -> Self {
        Self {
            threads: 4,
            consistency: ConsistencyConfig::default(),
            chunking: ChunkingConfig::default(),
            compatibility: CompatibilityConfig::default(),
            dialect: DialectConfig::default(),
            filter: FilterConfig::default(),
            storage: StorageConfig::default(),
            compression: Compression::Zstd,
            ddl_only: false,
            data_only: false,
            dry_run: false,
            checksum: false,
            tz_utc: true,
            character_set: "utf8mb4".into(),
            show_progress: true,
            reset_progress: false,
            where_clauses: HashMap::new(),
        }
    }
}

impl DumpOptions {
    pub fn where_clause(&self, table: &ObjectName) -> Option<&str> {
        self.where_clauses
            .iter()
            .find(|(k, _)| {
                split_qualified(k).is_some_and(|p| p.len() == 2 && p[0] == table.schema && p[1] == table.name)
            })
            .map(|(_, v)| v.as_str())
    }
}

impl Options for DumpOptions {
    fn validate(&self) -> Result<(), ConfigError> {
        validate_threads(self.threads)?;
        if self.ddl_only && self.data_only {
            return Err(ConfigError::Conflict("ddlOnly", "dataOnly"));
        }
        if self.character_set.trim().is_empty() {
            return Err(ConfigError::invalid("characterSet", "must not be empty"));
        }
        self.chunking.validate()?;
        self.compatibility.validate()?;
        self.dialect.resolve()?;
        self.filter.validate()?;
        self.storage.validate()?;
        for key in self.where_clauses.keys() {
            if !split_qualified(key).is_some_and(|p| p.len() == 2) {
                return Err(ConfigError::invalid(
                    "where",
                    format!("'{key}' is not a schema.table name"),
                ));
            }
        }
        Ok(())
    }
}
