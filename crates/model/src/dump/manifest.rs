use crate::{
    core::identifiers::ObjectName,
    dump::{
        dialect::Dialect,
        task::{ChunkRange, Compression, ObjectKind},
    },
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const FORMAT_VERSION: &str = "2.0.1";

/// Root metadata of a dump.
///
/// Written with `complete = false` as soon as dumping starts and rewritten
/// once at the end; after creation it is only ever extended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DumpManifest {
    pub version: String,
    pub server_version: String,
    pub server_uuid: String,
    pub hostname: String,
    pub gtid_executed: String,
    pub binlog_file: Option<String>,
    pub binlog_position: Option<u64>,
    pub begin: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub options: ManifestOptions,
    pub schemas: Vec<SchemaEntry>,
    #[serde(default)]
    pub users: Vec<String>,
    pub complete: bool,
}

impl DumpManifest {
    pub fn schema(&self, name: &str) -> Option<&SchemaEntry> {
        self.schemas.iter().find(|s| s.name == name)
    }

    pub fn tables(&self) -> impl Iterator<Item = ObjectName> + '_ {
        self.schemas.iter().flat_map(|s| {
            s.tables
                .iter()
                .map(move |t| ObjectName::new(s.name.clone(), t.clone()))
        })
    }

    pub fn views(&self) -> impl Iterator<Item = ObjectName> + '_ {
        self.schemas.iter().flat_map(|s| {
            s.views
                .iter()
                .map(move |v| ObjectName::new(s.name.clone(), v.clone()))
        })
    }

    pub fn table_count(&self) -> usize {
        self.schemas.iter().map(|s| s.tables.len()).sum()
    }
}

/// Options relevant to reproducing or loading the dump.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestOptions {
    pub consistent: bool,
    pub compatibility: Vec<String>,
    pub character_set: String,
    pub sql_mode: Option<String>,
    pub tz_utc: bool,
    pub compression: Compression,
    pub dialect: Dialect,
    pub chunking: bool,
    pub bytes_per_chunk: u64,
    pub ddl_only: bool,
    pub data_only: bool,
    pub checksum: bool,
    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaEntry {
    pub name: String,
    pub tables: Vec<String>,
    pub views: Vec<String>,
    pub events: Vec<String>,
    pub routines: Vec<RoutineEntry>,
    pub triggers: Vec<TriggerEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutineEntry {
    pub name: String,
    pub kind: ObjectKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerEntry {
    pub table: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    #[serde(default)]
    pub generated: bool,
}

/// Per-chunk record inside a [`TableManifest`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkEntry {
    pub index: usize,
    pub file: String,
    pub rows: u64,
    pub data_bytes: u64,
    pub file_bytes: u64,
    pub range: Option<ChunkRange>,
    pub checksum: Option<ChunkChecksum>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkChecksum {
    pub count: u64,
    pub crc: u64,
}

/// Metadata of one table's data, written after its last chunk completes.
/// Its presence tells a concurrent loader that the table's data is final.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableManifest {
    pub schema: String,
    pub table: String,
    pub columns: Vec<ColumnInfo>,
    pub index_name: Option<String>,
    pub index_columns: Vec<String>,
    pub has_unique_key: bool,
    pub chunking: bool,
    pub compression: Compression,
    pub dialect: Dialect,
    pub chunks: Vec<ChunkEntry>,
}

impl TableManifest {
    pub fn name(&self) -> ObjectName {
        ObjectName::new(self.schema.clone(), self.table.clone())
    }

    pub fn total_rows(&self) -> u64 {
        self.chunks.iter().map(|c| c.rows).sum()
    }

    pub fn total_bytes(&self) -> u64 {
        self.chunks.iter().map(|c| c.data_bytes).sum()
    }

    /// Columns written to data files, in file order.
    pub fn data_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| !c.generated)
            .map(|c| c.name.as_str())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_round_trips_through_json() {
        let manifest = DumpManifest {
            version: FORMAT_VERSION.into(),
            server_version: "8.0.36".into(),
            server_uuid: "uuid".into(),
            hostname: "db1".into(),
            gtid_executed: String::new(),
            binlog_file: Some("binlog.000003".into()),
            binlog_position: Some(157),
            begin: Utc::now(),
            end: None,
            options: ManifestOptions {
                consistent: true,
                compatibility: vec!["strip_definers".into()],
                character_set: "utf8mb4".into(),
                sql_mode: None,
                tz_utc: true,
                compression: Compression::Zstd,
                dialect: Dialect::tsv(),
                chunking: true,
                bytes_per_chunk: 64 * 1024 * 1024,
                ddl_only: false,
                data_only: false,
                checksum: false,
                dry_run: false,
            },
            schemas: vec![SchemaEntry {
                name: "shop".into(),
                tables: vec!["orders".into(), "items".into()],
                ..Default::default()
            }],
            users: vec![],
            complete: false,
        };

        let json = serde_json::to_string(&manifest).unwrap();
        assert!(json.contains("\"gtidExecuted\""));
        let back: DumpManifest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, manifest);
        assert_eq!(back.tables().count(), 2);
    }
}
