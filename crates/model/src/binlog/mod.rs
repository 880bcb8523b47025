use crate::{
    core::identifiers::TaskId,
    dump::task::{Compression, Task, TaskStatus},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BinlogPosition {
    pub file: String,
    pub position: u64,
}

impl fmt::Display for BinlogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.position)
    }
}

impl BinlogPosition {
    /// Parses `file:position`.
    pub fn parse(s: &str) -> Option<Self> {
        let (file, pos) = s.trim().rsplit_once(':')?;
        if file.is_empty() {
            return None;
        }
        Some(Self {
            file: file.to_string(),
            position: pos.parse().ok()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinlogEventKind {
    FormatDescription,
    PreviousGtids,
    Gtid,
    Query,
    TableMap,
    Rows,
    Xid,
    Rotate,
    Other,
}

/// A raw binary-log event as delivered by the source, plus the fields the
/// dumper and loader need without decoding the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinlogEvent {
    pub kind: BinlogEventKind,
    pub file: String,
    pub position: u64,
    pub end_position: u64,
    /// Set on `Gtid` events.
    pub gtid: Option<String>,
    /// SQL text of `Query` events.
    pub statement: Option<String>,
    pub data: Vec<u8>,
}

impl BinlogEvent {
    /// Query event carrying a statement that changes schema.
    pub fn is_ddl(&self) -> bool {
        if self.kind != BinlogEventKind::Query {
            return false;
        }
        let Some(stmt) = &self.statement else {
            return false;
        };
        let head: String = stmt
            .trim_start()
            .chars()
            .take(16)
            .collect::<String>()
            .to_ascii_uppercase();
        ["CREATE", "ALTER", "DROP", "RENAME", "TRUNCATE"]
            .iter()
            .any(|kw| head.starts_with(kw))
    }
}

/// One dumped binlog segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinlogTask {
    pub id: TaskId,
    pub sequence: u64,
    pub source_file: String,
    pub basename: String,
    pub file: String,
    pub start_position: u64,
    pub end_position: u64,
    pub gtid_start: String,
    pub gtid_end: String,
    pub event_count: u64,
    pub data_bytes: u64,
    pub file_bytes: u64,
    pub compression: Compression,
    pub status: TaskStatus,
}

impl Task for BinlogTask {
    fn id(&self) -> &TaskId {
        &self.id
    }
}

/// Where a binlog dump continues from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinlogBase {
    pub gtid_executed: String,
    pub position: Option<BinlogPosition>,
    pub origin: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BinlogManifest {
    pub version: String,
    pub server_uuid: String,
    pub server_version: String,
    pub base: BinlogBase,
    pub gtid_end: String,
    pub end_position: Option<BinlogPosition>,
    pub segments: Vec<BinlogTask>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl BinlogManifest {
    pub fn next_sequence(&self) -> u64 {
        self.segments.last().map(|s| s.sequence + 1).unwrap_or(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query(sql: &str) -> BinlogEvent {
        BinlogEvent {
            kind: BinlogEventKind::Query,
            file: "binlog.000001".into(),
            position: 4,
            end_position: 100,
            gtid: None,
            statement: Some(sql.into()),
            data: vec![],
        }
    }

    #[test]
    fn detects_ddl_statements() {
        assert!(query("  alter table t add column c int").is_ddl());
        assert!(query("DROP TABLE x").is_ddl());
        assert!(!query("BEGIN").is_ddl());
        assert!(!query("INSERT INTO t VALUES (1)").is_ddl());
    }

    #[test]
    fn parses_positions() {
        let p = BinlogPosition::parse("binlog.000012:4567").unwrap();
        assert_eq!(p.file, "binlog.000012");
        assert_eq!(p.position, 4567);
        assert!(BinlogPosition::parse("nofile").is_none());
    }
}
