//! Binary logs read over the replication protocol, as raw events that can be
//! replayed with `BINLOG` statements.

use crate::error::DbError;
use async_trait::async_trait;
use futures::StreamExt;
use model::{
    binlog::{BinlogEvent, BinlogEventKind},
    core::utils::quote_identifier,
};
use mysql_async::{
    BinlogStream, BinlogStreamRequest, Conn, Opts,
    binlog::{
        BinlogVersion, EventFlags,
        events::{Event, EventData},
    },
};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

const TRANSACTION_PAYLOAD_EVENT: u8 = 0x28;

#[async_trait]
pub trait BinlogReader: Send + Sync {
    /// Up to `limit` events of `file` starting at byte `from`. An empty batch
    /// means the end of the file was reached.
    async fn read(&self, file: &str, from: u64, limit: usize) -> Result<Vec<BinlogEvent>, DbError>;
}

/// Registers as a replica and streams events, keeping the stream open while
/// consecutive reads continue where the previous one ended.
pub struct MySqlBinlogReader {
    opts: Opts,
    server_id: u32,
    open: Mutex<Option<OpenStream>>,
}

struct OpenStream {
    file: String,
    start: u64,
    /// End of the last event handed out.
    next: u64,
    stream: BinlogStream,
    /// Byte range of the compressed transaction whose events are being read.
    payload: Option<(u64, u64)>,
    /// Read while finishing a compressed transaction, handed out next.
    held: Option<BinlogEvent>,
    /// The stream moved past the end of `file`.
    finished: bool,
}

impl MySqlBinlogReader {
    pub fn new(opts: Opts, server_id: u32) -> Self {
        Self {
            opts,
            server_id,
            open: Mutex::new(None),
        }
    }

    async fn connect(&self, file: &str, from: u64) -> Result<OpenStream, DbError> {
        let conn = Conn::new(self.opts.clone()).await?;
        let request = BinlogStreamRequest::new(self.server_id)
            .with_filename(file.as_bytes())
            .with_pos(from)
            .with_non_blocking();
        let stream = conn.get_binlog_stream(request).await?;
        debug!(file, from, server_id = self.server_id, "Opened binlog stream");
        Ok(OpenStream {
            file: file.to_string(),
            start: from,
            next: from,
            stream,
            payload: None,
            held: None,
            finished: false,
        })
    }
}

#[async_trait]
impl BinlogReader for MySqlBinlogReader {
    async fn read(&self, file: &str, from: u64, limit: usize) -> Result<Vec<BinlogEvent>, DbError> {
        let mut open = self.open.lock().await;
        if !open.as_ref().is_some_and(|s| s.file == file && s.next == from) {
            if let Some(previous) = open.take()
                && let Err(e) = previous.stream.close().await
            {
                debug!(error = %e, "Failed to close binlog stream");
            }
            *open = Some(self.connect(file, from).await?);
        }
        let Some(state) = open.as_mut() else {
            return Ok(Vec::new());
        };

        let mut events: Vec<BinlogEvent> = state.held.take().into_iter().collect();
        while !state.finished {
            let full = events.len() >= limit;
            if full && state.payload.is_none() {
                break;
            }
            let Some(event) = state.stream.next().await.transpose()? else {
                state.finished = true;
                break;
            };
            let Some((event, inner)) = state.convert(&event)? else {
                continue;
            };
            // A batch never ends inside a compressed transaction.
            if full && !inner {
                state.held = Some(event);
                break;
            }
            events.push(event);
        }
        if let Some(last) = events.last() {
            state.next = last.end_position;
        }
        debug!(file, from, events = events.len(), "Read binlog events");
        Ok(events)
    }
}

impl OpenStream {
    /// The event as stored in a dump, and whether it came out of a compressed
    /// transaction. Artificial and informational events yield nothing.
    fn convert(&mut self, event: &Event) -> Result<Option<(BinlogEvent, bool)>, DbError> {
        let header = event.header();
        if header.flags().contains(EventFlags::LOG_EVENT_ARTIFICIAL_F) {
            return Ok(None);
        }
        let end = u64::from(header.log_pos());
        let inner = match self.payload {
            Some((_, payload_end)) if end == 0 || end <= payload_end => true,
            _ => {
                self.payload = None;
                false
            }
        };
        let (position, end) = match self.payload {
            Some(range) if inner => range,
            _ => (end.saturating_sub(u64::from(header.event_size())), end),
        };

        let code = header.event_type_raw();
        if code == TRANSACTION_PAYLOAD_EVENT {
            self.payload = Some((position, end));
            return Ok(None);
        }
        // The format description is sent again when a stream starts mid file.
        if !inner && (end == 0 || position < self.start) {
            return Ok(None);
        }
        let Some(kind) = event_kind(code) else {
            return Ok(None);
        };
        if kind == BinlogEventKind::Rotate {
            self.finished = true;
        }

        let (gtid, statement) = match kind {
            BinlogEventKind::Gtid | BinlogEventKind::Query | BinlogEventKind::PreviousGtids => {
                match event.read_data()? {
                    Some(EventData::GtidEvent(e)) => (Some(gtid_text(e.sid(), e.gno())), None),
                    Some(EventData::QueryEvent(e)) => (None, Some(query_text(&e.schema(), &e.query()))),
                    Some(EventData::PreviousGtidsEvent(raw)) => (None, previous_gtids_text(&raw)),
                    _ => (None, None),
                }
            }
            _ => (None, None),
        };
        let mut data = Vec::new();
        event.write(BinlogVersion::Version4, &mut data)?;

        Ok(Some((
            BinlogEvent {
                kind,
                file: self.file.clone(),
                position,
                end_position: end,
                gtid,
                statement,
                data,
            },
            inner,
        )))
    }
}

/// Kind of an event by its type code. Events that carry nothing to replay
/// (heartbeats, row query annotations, transaction context) map to `None`.
fn event_kind(code: u8) -> Option<BinlogEventKind> {
    Some(match code {
        0x0f => BinlogEventKind::FormatDescription,
        0x23 => BinlogEventKind::PreviousGtids,
        0x21 | 0x22 => BinlogEventKind::Gtid,
        0x02 => BinlogEventKind::Query,
        0x13 => BinlogEventKind::TableMap,
        0x17..=0x19 | 0x1e..=0x20 | 0x27 => BinlogEventKind::Rows,
        0x10 => BinlogEventKind::Xid,
        0x04 => BinlogEventKind::Rotate,
        0x1b | 0x1c | 0x1d | 0x24 | 0x25 | TRANSACTION_PAYLOAD_EVENT => return None,
        _ => BinlogEventKind::Other,
    })
}

fn gtid_text(sid: [u8; 16], gno: u64) -> String {
    format!("{}:{gno}", Uuid::from_bytes(sid))
}

/// Statements logged under a default schema, in the form `SHOW BINLOG EVENTS`
/// uses.
fn query_text(schema: &str, query: &str) -> String {
    if schema.is_empty() {
        query.to_string()
    } else {
        format!("use {}; {query}", quote_identifier(schema))
    }
}

/// Decodes the GTID set of a `Previous_gtids` event: a source count, then
/// per source its UUID and half-open intervals.
fn previous_gtids_text(data: &[u8]) -> Option<String> {
    fn take<'a>(data: &mut &'a [u8], n: usize) -> Option<&'a [u8]> {
        if data.len() < n {
            return None;
        }
        let slice: &'a [u8] = data;
        let (head, rest) = slice.split_at(n);
        *data = rest;
        Some(head)
    }
    fn take_u64(data: &mut &[u8]) -> Option<u64> {
        Some(u64::from_le_bytes(take(data, 8)?.try_into().ok()?))
    }

    let mut data = data;
    let sources = take_u64(&mut data)?;
    let mut members = Vec::new();
    for _ in 0..sources {
        let sid: [u8; 16] = take(&mut data, 16)?.try_into().ok()?;
        let mut member = Uuid::from_bytes(sid).to_string();
        for _ in 0..take_u64(&mut data)? {
            let start = take_u64(&mut data)?;
            let end = take_u64(&mut data)?.checked_sub(1)?;
            if start == end {
                member.push_str(&format!(":{start}"));
            } else {
                member.push_str(&format!(":{start}-{end}"));
            }
        }
        members.push(member);
    }
    Some(members.join(","))
}
