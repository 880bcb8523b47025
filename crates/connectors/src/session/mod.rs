use crate::error::DbError;
use async_trait::async_trait;
use std::sync::Arc;

pub mod mysql;
pub mod recording;

/// A single result row. Values are kept in the server's text form,
/// `None` being SQL NULL.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Row {
    values: Vec<Option<Vec<u8>>>,
}

impl Row {
    pub fn new(values: Vec<Option<Vec<u8>>>) -> Self {
        Row { values }
    }

    pub fn from_strs(values: &[Option<&str>]) -> Self {
        Row {
            values: values
                .iter()
                .map(|v| v.map(|s| s.as_bytes().to_vec()))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn is_null(&self, idx: usize) -> bool {
        matches!(self.values.get(idx), Some(None) | None)
    }

    pub fn get_bytes(&self, idx: usize) -> Option<&[u8]> {
        self.values.get(idx).and_then(|v| v.as_deref())
    }

    pub fn get_str(&self, idx: usize) -> Option<&str> {
        self.get_bytes(idx).and_then(|b| std::str::from_utf8(b).ok())
    }

    pub fn get_string(&self, idx: usize) -> Option<String> {
        self.get_bytes(idx)
            .map(|b| String::from_utf8_lossy(b).into_owned())
    }

    pub fn get_u64(&self, idx: usize) -> Option<u64> {
        self.get_str(idx).and_then(|s| s.trim().parse().ok())
    }

    pub fn get_i64(&self, idx: usize) -> Option<i64> {
        self.get_str(idx).and_then(|s| s.trim().parse().ok())
    }

    pub fn get_bool(&self, idx: usize) -> Option<bool> {
        self.get_str(idx).map(|s| matches!(s, "1" | "YES" | "yes" | "true" | "ON"))
    }

    pub fn values(&self) -> &[Option<Vec<u8>>] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Option<Vec<u8>>> {
        self.values
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Row>,
    pub affected_rows: u64,
}

impl QueryResult {
    pub fn empty() -> Self {
        QueryResult::default()
    }

    pub fn affected(rows: u64) -> Self {
        QueryResult {
            affected_rows: rows,
            ..Default::default()
        }
    }

    pub fn with_rows(columns: &[&str], rows: Vec<Row>) -> Self {
        QueryResult {
            columns: columns.iter().map(|c| c.to_string()).collect(),
            rows,
            affected_rows: 0,
        }
    }

    pub fn first(&self) -> Option<&Row> {
        self.rows.first()
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.eq_ignore_ascii_case(name))
    }
}

/// Rows of a running query, handed out one at a time.
#[async_trait]
pub trait RowStream: Send {
    /// The next row, or `None` once the result set is exhausted.
    async fn next(&mut self) -> Result<Option<Row>, DbError>;
}

/// A result set that was already read in full.
pub struct BufferedRows {
    rows: std::vec::IntoIter<Row>,
}

impl BufferedRows {
    pub fn new(rows: Vec<Row>) -> Self {
        BufferedRows { rows: rows.into_iter() }
    }
}

#[async_trait]
impl RowStream for BufferedRows {
    async fn next(&mut self) -> Result<Option<Row>, DbError> {
        Ok(self.rows.next())
    }
}

/// An open connection to a server. A session is used by one task at a time;
/// workers open their own.
#[async_trait]
pub trait Session: Send + Sync {
    /// Runs one statement and returns its first result set.
    async fn execute(&self, sql: &str) -> Result<QueryResult, DbError>;

    /// Runs a query whose result may not fit in memory. The session stays
    /// busy until the stream is exhausted or dropped.
    async fn stream(&self, sql: &str) -> Result<Box<dyn RowStream>, DbError> {
        let result = self.execute(sql).await?;
        Ok(Box::new(BufferedRows::new(result.rows)))
    }

    /// Server-side id of this connection, used to kill running queries.
    fn connection_id(&self) -> u64 {
        0
    }

    async fn close(&self) -> Result<(), DbError> {
        Ok(())
    }
}

/// Opens new sessions against the same server with the same credentials.
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open(&self) -> Result<Arc<dyn Session>, DbError>;

    fn describe(&self) -> String;

    async fn kill_query(&self, connection_id: u64) -> Result<(), DbError> {
        let session = self.open().await?;
        session
            .execute(&format!("KILL QUERY {connection_id}"))
            .await?;
        session.close().await
    }
}

pub async fn query_row(session: &dyn Session, sql: &str) -> Result<Option<Row>, DbError> {
    Ok(session.execute(sql).await?.rows.into_iter().next())
}

pub async fn query_string(session: &dyn Session, sql: &str) -> Result<Option<String>, DbError> {
    Ok(query_row(session, sql)
        .await?
        .and_then(|row| row.get_string(0)))
}

pub async fn query_u64(session: &dyn Session, sql: &str) -> Result<Option<u64>, DbError> {
    Ok(query_row(session, sql).await?.and_then(|row| row.get_u64(0)))
}

/// Reads a server variable via `SELECT @@name`.
pub async fn variable(session: &dyn Session, name: &str) -> Result<Option<String>, DbError> {
    query_string(session, &format!("SELECT @@{name}")).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn row_accessors() {
        let row = Row::from_strs(&[Some("42"), None, Some("YES"), Some("abc")]);
        assert_eq!(row.get_u64(0), Some(42));
        assert!(row.is_null(1));
        assert!(row.is_null(9));
        assert_eq!(row.get_bool(2), Some(true));
        assert_eq!(row.get_str(3), Some("abc"));
        assert_eq!(row.get_u64(3), None);
    }

    #[tokio::test]
    async fn buffered_rows_are_handed_out_in_order() {
        let mut rows = BufferedRows::new(vec![Row::from_strs(&[Some("1")]), Row::from_strs(&[Some("2")])]);
        assert_eq!(rows.next().await.unwrap().unwrap().get_u64(0), Some(1));
        assert_eq!(rows.next().await.unwrap().unwrap().get_u64(0), Some(2));
        assert!(rows.next().await.unwrap().is_none());
    }

    #[test]
    fn column_lookup_ignores_case() {
        let result = QueryResult::with_rows(&["TABLE_NAME", "rows"], vec![]);
        assert_eq!(result.column_index("table_name"), Some(0));
        assert_eq!(result.column_index("missing"), None);
    }
}
