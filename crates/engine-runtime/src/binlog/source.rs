use crate::{
    error::BinlogError,
    snapshot::{ServerCoordinates, read_coordinates},
};
use async_trait::async_trait;
use connectors::{
    binlog::BinlogReader,
    session::{Session, query_string, variable},
};
use model::{
    binlog::{BinlogEvent, BinlogEventKind, BinlogPosition},
    core::utils::quote_string,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::debug;

/// Where binary-log events come from.
#[async_trait]
pub trait BinlogSource: Send + Sync {
    fn describe(&self) -> String;

    async fn server_uuid(&self) -> Result<String, BinlogError>;

    async fn server_version(&self) -> Result<String, BinlogError>;

    /// Executed GTIDs and the current write position.
    async fn coordinates(&self) -> Result<ServerCoordinates, BinlogError>;

    /// Binary log files still on the server, oldest first.
    async fn files(&self) -> Result<Vec<String>, BinlogError>;

    /// Up to `limit` events of `file` starting at byte `from`. An empty batch
    /// means the end of the file was reached.
    async fn read(&self, file: &str, from: u64, limit: usize) -> Result<Vec<BinlogEvent>, BinlogError>;
}

/// A fixed set of binary logs held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryBinlogSource {
    server_uuid: String,
    server_version: String,
    gtid_executed: String,
    files: BTreeMap<String, Vec<BinlogEvent>>,
}

impl MemoryBinlogSource {
    pub fn new(server_uuid: impl Into<String>) -> Self {
        Self {
            server_uuid: server_uuid.into(),
            server_version: "8.0.36".into(),
            ..Default::default()
        }
    }

    pub fn with_gtid_executed(mut self, gtid_executed: impl Into<String>) -> Self {
        self.gtid_executed = gtid_executed.into();
        self
    }

    /// Adds a file. Events are laid out back to back from byte 4, the way
    /// the server writes them, and their positions are overwritten.
    pub fn with_file(mut self, name: impl Into<String>, events: Vec<BinlogEvent>) -> Self {
        let name = name.into();
        let mut position = 4;
        let events = events
            .into_iter()
            .map(|mut event| {
                event.file = name.clone();
                event.position = position;
                event.end_position = position + event.data.len().max(1) as u64 + 19;
                position = event.end_position;
                event
            })
            .collect();
        self.files.insert(name, events);
        self
    }

    fn end_position(&self) -> Option<BinlogPosition> {
        let (file, events) = self.files.iter().next_back()?;
        Some(BinlogPosition {
            file: file.clone(),
            position: events.last().map(|e| e.end_position).unwrap_or(4),
        })
    }
}

#[async_trait]
impl BinlogSource for MemoryBinlogSource {
    fn describe(&self) -> String {
        format!("memory binlog source {}", self.server_uuid)
    }

    async fn server_uuid(&self) -> Result<String, BinlogError> {
        Ok(self.server_uuid.clone())
    }

    async fn server_version(&self) -> Result<String, BinlogError> {
        Ok(self.server_version.clone())
    }

    async fn coordinates(&self) -> Result<ServerCoordinates, BinlogError> {
        Ok(ServerCoordinates {
            gtid_executed: self.gtid_executed.clone(),
            binlog: self.end_position(),
        })
    }

    async fn files(&self) -> Result<Vec<String>, BinlogError> {
        Ok(self.files.keys().cloned().collect())
    }

    async fn read(&self, file: &str, from: u64, limit: usize) -> Result<Vec<BinlogEvent>, BinlogError> {
        let events = self
            .files
            .get(file)
            .ok_or_else(|| BinlogError::Source(format!("binary log {file} not found")))?;
        Ok(events
            .iter()
            .filter(|e| e.position >= from)
            .take(limit)
            .cloned()
            .collect())
    }
}

/// Reads events through `SHOW BINLOG EVENTS` on a regular session.
///
/// The server only describes events in text form there, so statement
/// events can be replayed but row events cannot; meeting one is an error.
pub struct SqlBinlogSource {
    session: Arc<dyn Session>,
}

impl SqlBinlogSource {
    pub fn new(session: Arc<dyn Session>) -> Self {
        Self { session }
    }
}

fn event_kind(event_type: &str) -> BinlogEventKind {
    match event_type {
        "Format_desc" => BinlogEventKind::FormatDescription,
        "Previous_gtids" => BinlogEventKind::PreviousGtids,
        "Gtid" => BinlogEventKind::Gtid,
        "Query" => BinlogEventKind::Query,
        "Table_map" => BinlogEventKind::TableMap,
        "Write_rows" | "Update_rows" | "Delete_rows" | "Write_rows_v1" | "Update_rows_v1" | "Delete_rows_v1" => {
            BinlogEventKind::Rows
        }
        "Xid" => BinlogEventKind::Xid,
        "Rotate" => BinlogEventKind::Rotate,
        _ => BinlogEventKind::Other,
    }
}

/// `SET @@SESSION.GTID_NEXT= 'uuid:n'`
fn gtid_from_info(info: &str) -> Option<String> {
    let start = info.find('\'')? + 1;
    let end = start + info[start..].find('\'')?;
    Some(info[start..end].to_string())
}

#[async_trait]
impl BinlogSource for SqlBinlogSource {
    fn describe(&self) -> String {
        format!("session {}", self.session.connection_id())
    }

    async fn server_uuid(&self) -> Result<String, BinlogError> {
        Ok(variable(self.session.as_ref(), "server_uuid").await?.unwrap_or_default())
    }

    async fn server_version(&self) -> Result<String, BinlogError> {
        Ok(query_string(self.session.as_ref(), "SELECT VERSION()")
            .await?
            .unwrap_or_default())
    }

    async fn coordinates(&self) -> Result<ServerCoordinates, BinlogError> {
        Ok(read_coordinates(self.session.as_ref()).await?)
    }

    async fn files(&self) -> Result<Vec<String>, BinlogError> {
        let result = self.session.execute("SHOW BINARY LOGS").await?;
        Ok(result.rows.iter().filter_map(|r| r.get_string(0)).collect())
    }

    async fn read(&self, file: &str, from: u64, limit: usize) -> Result<Vec<BinlogEvent>, BinlogError> {
        let sql = format!("SHOW BINLOG EVENTS IN {} FROM {from} LIMIT {limit}", quote_string(file));
        let result = self.session.execute(&sql).await?;
        let mut events = Vec::with_capacity(result.rows.len());
        for row in &result.rows {
            let event_type = row.get_str(2).unwrap_or_default();
            let kind = event_kind(event_type);
            let position = row.get_u64(1).unwrap_or(from);
            if matches!(kind, BinlogEventKind::Rows | BinlogEventKind::TableMap) {
                return Err(BinlogError::Source(format!(
                    "row event at {file}:{position} cannot be read as text"
                )));
            }
            let info = row.get_string(5).unwrap_or_default();
            events.push(BinlogEvent {
                kind,
                file: file.to_string(),
                position,
                end_position: row.get_u64(4).unwrap_or(position),
                gtid: (kind == BinlogEventKind::Gtid).then(|| gtid_from_info(&info)).flatten(),
                // Previous_gtids carries the set as text.
                statement: matches!(kind, BinlogEventKind::Query | BinlogEventKind::PreviousGtids).then_some(info),
                data: Vec::new(),
            });
        }
        debug!(file, from, events = events.len(), "Read binlog events");
        Ok(events)
    }
}

/// Reads metadata through a regular session and events over the replication
/// protocol, so row events come back as raw bytes.
pub struct ReplicationBinlogSource {
    sql: SqlBinlogSource,
    reader: Arc<dyn BinlogReader>,
}

impl ReplicationBinlogSource {
    pub fn new(session: Arc<dyn Session>, reader: Arc<dyn BinlogReader>) -> Self {
        Self {
            sql: SqlBinlogSource::new(session),
            reader,
        }
    }
}

#[async_trait]
impl BinlogSource for ReplicationBinlogSource {
    fn describe(&self) -> String {
        format!("replication stream, {}", self.sql.describe())
    }

    async fn server_uuid(&self) -> Result<String, BinlogError> {
        self.sql.server_uuid().await
    }

    async fn server_version(&self) -> Result<String, BinlogError> {
        self.sql.server_version().await
    }

    async fn coordinates(&self) -> Result<ServerCoordinates, BinlogError> {
        self.sql.coordinates().await
    }

    async fn files(&self) -> Result<Vec<String>, BinlogError> {
        self.sql.files().await
    }

    async fn read(&self, file: &str, from: u64, limit: usize) -> Result<Vec<BinlogEvent>, BinlogError> {
        Ok(self.reader.read(file, from, limit).await?)
    }
}
