use super::{QueryResult, Row, RowStream, Session, SessionFactory};
use crate::{binlog::MySqlBinlogReader, error::DbError};
use async_trait::async_trait;
use mysql_async::{Conn, Opts, OptsBuilder, Value, prelude::Queryable};
use std::sync::Arc;
use tokio::{
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tracing::{debug, trace};

/// Rows buffered between the connection and a slow consumer.
const STREAM_BUFFER_ROWS: usize = 1024;

/// A dedicated MySQL connection.
pub struct MySqlSession {
    conn: Arc<Mutex<Option<Conn>>>,
    id: u32,
}

impl MySqlSession {
    pub async fn connect(opts: Opts) -> Result<Self, DbError> {
        let conn = Conn::new(opts).await?;
        let id = conn.id();
        debug!(connection_id = id, "Opened MySQL session");
        Ok(MySqlSession {
            conn: Arc::new(Mutex::new(Some(conn))),
            id,
        })
    }
}

#[async_trait]
impl Session for MySqlSession {
    async fn execute(&self, sql: &str) -> Result<QueryResult, DbError> {
        trace!(connection_id = self.id, "{}", sql);
        let mut guard = self.conn.lock().await;
        let conn = guard
            .as_mut()
            .ok_or_else(|| DbError::UnexpectedResult("session is closed".into()))?;

        let mut result = conn.query_iter(sql).await?;
        let columns = result
            .columns_ref()
            .iter()
            .map(|c| c.name_str().into_owned())
            .collect::<Vec<_>>();
        let affected_rows = result.affected_rows();
        let rows: Vec<mysql_async::Row> = result.collect().await?;
        // Additional result sets (e.g. from CALL) are discarded.
        result.drop_result().await?;

        Ok(QueryResult {
            columns,
            rows: rows.into_iter().map(convert_row).collect(),
            affected_rows,
        })
    }

    async fn stream(&self, sql: &str) -> Result<Box<dyn RowStream>, DbError> {
        trace!(connection_id = self.id, "{}", sql);
        let mut guard = self.conn.clone().lock_owned().await;
        if guard.is_none() {
            return Err(DbError::UnexpectedResult("session is closed".into()));
        }

        // The reader owns the connection lock until every row was read, so the
        // next statement on this session waits for the result to be drained.
        let (tx, rx) = mpsc::channel(STREAM_BUFFER_ROWS);
        let sql = sql.to_string();
        let reader = tokio::spawn(async move {
            let Some(conn) = guard.as_mut() else {
                return;
            };
            if let Err(e) = read_rows(conn, sql, &tx).await {
                let _ = tx.send(Err(e)).await;
            }
        });
        Ok(Box::new(MySqlRowStream {
            rows: rx,
            reader: Some(reader),
        }))
    }

    fn connection_id(&self) -> u64 {
        self.id as u64
    }

    async fn close(&self) -> Result<(), DbError> {
        if let Some(conn) = self.conn.lock().await.take() {
            conn.disconnect().await?;
        }
        Ok(())
    }
}

async fn read_rows(
    conn: &mut Conn,
    sql: String,
    tx: &mpsc::Sender<Result<Row, DbError>>,
) -> Result<(), DbError> {
    let mut result = conn.query_iter(sql).await?;
    while let Some(row) = result.next().await? {
        if tx.send(Ok(convert_row(row))).await.is_err() {
            // Consumer went away; the rest is drained below.
            break;
        }
    }
    result.drop_result().await?;
    Ok(())
}

struct MySqlRowStream {
    rows: mpsc::Receiver<Result<Row, DbError>>,
    reader: Option<JoinHandle<()>>,
}

#[async_trait]
impl RowStream for MySqlRowStream {
    async fn next(&mut self) -> Result<Option<Row>, DbError> {
        match self.rows.recv().await {
            Some(row) => row.map(Some),
            None => {
                // A reader that died without reporting must not look like a
                // short result set.
                if let Some(reader) = self.reader.take() {
                    reader
                        .await
                        .map_err(|e| DbError::UnexpectedResult(format!("row reader failed: {e}")))?;
                }
                Ok(None)
            }
        }
    }
}

fn convert_row(row: mysql_async::Row) -> Row {
    Row::new(row.unwrap().into_iter().map(convert_value).collect())
}

fn convert_value(value: Value) -> Option<Vec<u8>> {
    let text = match value {
        Value::NULL => return None,
        Value::Bytes(bytes) => return Some(bytes),
        Value::Int(i) => i.to_string(),
        Value::UInt(u) => u.to_string(),
        Value::Float(f) => f.to_string(),
        Value::Double(d) => d.to_string(),
        Value::Date(y, mo, d, h, mi, s, us) => {
            if us > 0 {
                format!("{y:04}-{mo:02}-{d:02} {h:02}:{mi:02}:{s:02}.{us:06}")
            } else {
                format!("{y:04}-{mo:02}-{d:02} {h:02}:{mi:02}:{s:02}")
            }
        }
        Value::Time(neg, days, h, mi, s, us) => {
            let sign = if neg { "-" } else { "" };
            let hours = days * 24 + h as u32;
            if us > 0 {
                format!("{sign}{hours:02}:{mi:02}:{s:02}.{us:06}")
            } else {
                format!("{sign}{hours:02}:{mi:02}:{s:02}")
            }
        }
    };
    Some(text.into_bytes())
}

/// Opens dedicated connections from a `mysql://` URL.
#[derive(Clone)]
pub struct MySqlSessionFactory {
    opts: Opts,
}

impl MySqlSessionFactory {
    pub fn from_url(url: &str) -> Result<Self, DbError> {
        let opts = Opts::from_url(url).map_err(|e| DbError::InvalidUrl(e.to_string()))?;
        // Large chunk reads need a generous packet size on the client side too.
        let opts = OptsBuilder::from_opts(opts)
            .prefer_socket(false)
            .max_allowed_packet(Some(1 << 30))
            .into();
        Ok(MySqlSessionFactory { opts })
    }

    /// A replication reader on the same server. `server_id` must differ from
    /// those of the server and its replicas.
    pub fn binlog_reader(&self, server_id: u32) -> MySqlBinlogReader {
        MySqlBinlogReader::new(self.opts.clone(), server_id)
    }
}

#[async_trait]
impl SessionFactory for MySqlSessionFactory {
    async fn open(&self) -> Result<Arc<dyn Session>, DbError> {
        let session = MySqlSession::connect(self.opts.clone()).await?;
        Ok(Arc::new(session))
    }

    fn describe(&self) -> String {
        format!(
            "{}@{}:{}",
            self.opts.user().unwrap_or_default(),
            self.opts.ip_or_hostname(),
            self.opts.tcp_port()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_binary_values_to_text() {
        assert_eq!(convert_value(Value::NULL), None);
        assert_eq!(convert_value(Value::Int(-7)), Some(b"-7".to_vec()));
        assert_eq!(
            convert_value(Value::Date(2024, 1, 2, 3, 4, 5, 0)),
            Some(b"2024-01-02 03:04:05".to_vec())
        );
        assert_eq!(
            convert_value(Value::Time(true, 1, 2, 3, 4, 0)),
            Some(b"-26:03:04".to_vec())
        );
    }

    #[test]
    fn rejects_bad_url() {
        assert!(MySqlSessionFactory::from_url("not a url").is_err());
    }
}
