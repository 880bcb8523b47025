//! Binlog segment files: framed events, plus grouping them back into
//! transactions for replay.

use crate::error::TaskError;
use base64::{Engine, engine::general_purpose::STANDARD};
use connectors::codec::{CompressingWriter, decompress};
use model::{
    binlog::{BinlogEvent, BinlogEventKind},
    core::utils::quote_string,
    dump::task::Compression,
};

/// Appends one event as a little-endian `u32` length followed by its
/// bincode encoding.
pub fn encode_event(event: &BinlogEvent, out: &mut Vec<u8>) -> Result<(), bincode::Error> {
    let body = bincode::serialize(event)?;
    out.extend_from_slice(&(body.len() as u32).to_le_bytes());
    out.extend_from_slice(&body);
    Ok(())
}

pub fn decode_events(file: &str, data: &[u8]) -> Result<Vec<BinlogEvent>, TaskError> {
    let mut events = Vec::new();
    let mut offset = 0usize;
    while offset < data.len() {
        let Some(header) = data.get(offset..offset + 4) else {
            return Err(TaskError::segment(file, format!("truncated frame header at byte {offset}")));
        };
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        offset += 4;
        let Some(body) = data.get(offset..offset + len) else {
            return Err(TaskError::segment(file, format!("truncated event at byte {offset}")));
        };
        events.push(bincode::deserialize(body).map_err(|e| TaskError::segment(file, e))?);
        offset += len;
    }
    Ok(events)
}

/// Reads a whole segment file.
pub fn read_segment(file: &str, raw: &[u8], compression: Compression) -> Result<Vec<BinlogEvent>, TaskError> {
    let data = decompress(compression, raw).map_err(|source| TaskError::Compression {
        file: file.to_string(),
        source,
    })?;
    decode_events(file, &data)
}

/// Accumulates the events of one segment in compressed form.
pub struct SegmentWriter {
    file: String,
    encoder: CompressingWriter,
    output: Vec<u8>,
    events: u64,
}

impl SegmentWriter {
    pub fn new(file: impl Into<String>, compression: Compression) -> Result<Self, TaskError> {
        let file = file.into();
        let encoder = CompressingWriter::new(compression).map_err(|source| TaskError::Compression {
            file: file.clone(),
            source,
        })?;
        Ok(Self {
            file,
            encoder,
            output: Vec::new(),
            events: 0,
        })
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn push(&mut self, event: &BinlogEvent) -> Result<(), TaskError> {
        let mut frame = Vec::with_capacity(event.data.len() + 64);
        encode_event(event, &mut frame).map_err(|e| TaskError::segment(&self.file, e))?;
        self.encoder.write(&frame).map_err(|source| TaskError::Compression {
            file: self.file.clone(),
            source,
        })?;
        self.output.extend(self.encoder.take_output());
        self.events += 1;
        Ok(())
    }

    pub fn events(&self) -> u64 {
        self.events
    }

    /// Uncompressed bytes framed so far.
    pub fn data_bytes(&self) -> u64 {
        self.encoder.consumed()
    }

    pub fn finish(self) -> Result<Vec<u8>, TaskError> {
        let mut output = self.output;
        output.extend(self.encoder.finish().map_err(|source| TaskError::Compression {
            file: self.file.clone(),
            source,
        })?);
        Ok(output)
    }
}

/// Events between two transaction boundaries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub gtid: Option<String>,
    pub events: Vec<BinlogEvent>,
}

impl Transaction {
    pub fn contains_ddl(&self) -> bool {
        self.events.iter().any(|e| e.is_ddl())
    }

    /// Statements that replay the transaction on a target server.
    pub fn statements(&self) -> Vec<String> {
        let mut statements = Vec::with_capacity(self.events.len() + 2);
        if let Some(gtid) = &self.gtid {
            statements.push(format!("SET GTID_NEXT={}", quote_string(gtid)));
        }
        for event in &self.events {
            match event.kind {
                BinlogEventKind::Query => {
                    if let Some(sql) = &event.statement {
                        statements.extend(query_statements(sql));
                    }
                }
                BinlogEventKind::Xid => statements.push("COMMIT".to_string()),
                BinlogEventKind::TableMap | BinlogEventKind::Rows | BinlogEventKind::Other => {
                    statements.push(binlog_statement(&event.data));
                }
                BinlogEventKind::FormatDescription
                | BinlogEventKind::PreviousGtids
                | BinlogEventKind::Gtid
                | BinlogEventKind::Rotate => {}
            }
        }
        if self.gtid.is_some() {
            statements.push("SET GTID_NEXT='AUTOMATIC'".to_string());
        }
        statements
    }
}

/// Statements logged under a default schema come back from the server as
/// ``use `db`; <statement>``.
fn query_statements(sql: &str) -> Vec<String> {
    if let Some(rest) = sql.strip_prefix("use ")
        && let Some((schema, statement)) = rest.split_once("; ")
    {
        return vec![format!("USE {}", schema.trim()), statement.to_string()];
    }
    vec![sql.to_string()]
}

pub fn binlog_statement(data: &[u8]) -> String {
    format!("BINLOG '{}'", STANDARD.encode(data))
}

/// Groups a segment's events into transactions. A `Gtid` event opens a new
/// transaction; events before the first one form an anonymous group.
/// Format description events are returned separately, they have to be
/// replayed once per session before any row event.
pub fn transactions(events: Vec<BinlogEvent>) -> (Option<BinlogEvent>, Vec<Transaction>) {
    let mut format = None;
    let mut groups: Vec<Transaction> = Vec::new();
    let mut current: Option<Transaction> = None;

    for event in events {
        match event.kind {
            BinlogEventKind::FormatDescription => {
                format = Some(event);
            }
            BinlogEventKind::PreviousGtids | BinlogEventKind::Rotate => {}
            BinlogEventKind::Gtid => {
                if let Some(done) = current.take() {
                    groups.push(done);
                }
                current = Some(Transaction {
                    gtid: event.gtid.clone(),
                    events: Vec::new(),
                });
            }
            _ => current
                .get_or_insert_with(|| Transaction {
                    gtid: None,
                    events: Vec::new(),
                })
                .events
                .push(event),
        }
    }
    if let Some(done) = current {
        groups.push(done);
    }
    (format, groups)
}
