use crate::{
    checksum::{self, combine_predicates},
    error::TaskError,
};
use connectors::{
    codec::CompressingWriter,
    error::DbError,
    session::{BufferedRows, RowStream, Session},
    storage::{ObjectWriter, Storage},
};
use model::{
    core::utils::quote_identifier,
    dump::{dialect::Dialect, manifest::ChunkEntry, task::ChunkTask},
};
use planner::TablePlan;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Encoded bytes buffered before they are pushed through the compressor.
const FLUSH_BYTES: usize = 1 << 20;

/// Races a statement against cancellation.
pub async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T, TaskError>
where
    F: Future<Output = Result<T, DbError>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(TaskError::Cancelled),
        result = fut => result.map_err(TaskError::from),
    }
}

pub fn select_sql(table: &TablePlan, task: &ChunkTask) -> String {
    let columns: Vec<String> = table
        .data_columns()
        .iter()
        .map(|c| quote_identifier(c))
        .collect();
    let mut sql = format!("SELECT {} FROM {}", columns.join(", "), table.name.quoted());

    let range = task.range.as_ref().and_then(|r| r.predicate());
    if let Some(predicate) = combine_predicates(range.as_deref(), table.where_clause.as_deref()) {
        sql.push_str(" WHERE ");
        sql.push_str(&predicate);
    }
    if !task.order_by.is_empty() {
        let order: Vec<String> = task.order_by.iter().map(|c| quote_identifier(c)).collect();
        sql.push_str(" ORDER BY ");
        sql.push_str(&order.join(", "));
    }
    sql
}

/// Writes one chunk of one table into its data file.
pub struct ChunkDumper<'a> {
    session: &'a dyn Session,
    storage: &'a dyn Storage,
    dialect: &'a Dialect,
    cancel: CancellationToken,
    checksum: bool,
    empty: bool,
}

impl<'a> ChunkDumper<'a> {
    pub fn new(session: &'a dyn Session, storage: &'a dyn Storage, dialect: &'a Dialect) -> Self {
        Self {
            session,
            storage,
            dialect,
            cancel: CancellationToken::new(),
            checksum: false,
            empty: false,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_checksum(mut self, checksum: bool) -> Self {
        self.checksum = checksum;
        self
    }

    /// Produce files with no rows, without reading the table.
    pub fn empty_files(mut self, empty: bool) -> Self {
        self.empty = empty;
        self
    }

    pub async fn dump(&self, table: &TablePlan, task: &ChunkTask) -> Result<ChunkEntry, TaskError> {
        let started = Instant::now();
        let mut rows = if self.empty {
            None
        } else {
            let sql = select_sql(table, task);
            debug!(table = %table.name, chunk = task.index, sql = %sql, "Reading chunk");
            Some(cancellable(&self.cancel, self.session.stream(&sql)).await?)
        };

        let mut writer = self.storage.create(&task.file).await?;
        let written = match rows.as_mut() {
            Some(rows) => self.write_rows(writer.as_mut(), rows.as_mut(), task).await,
            None => self.write_rows(writer.as_mut(), &mut BufferedRows::new(Vec::new()), task).await,
        };
        // Releases the session before the checksum query runs on it.
        drop(rows);
        let (row_count, data_bytes) = match written {
            Ok(written) => written,
            Err(e) => {
                if let Err(abort_err) = writer.abort().await {
                    warn!(file = %task.file, error = %abort_err, "Failed to discard partial file");
                }
                return Err(e);
            }
        };
        let file_bytes = writer.finish().await?;

        let checksum = if self.checksum && !self.empty {
            let range = task.range.as_ref().and_then(|r| r.predicate());
            let predicate = combine_predicates(range.as_deref(), table.where_clause.as_deref());
            Some(
                checksum::compute(self.session, &table.name, &table.data_columns(), predicate.as_deref())
                    .await?,
            )
        } else {
            None
        };

        debug!(
            table = %table.name,
            chunk = task.index,
            rows = row_count,
            data_bytes,
            file_bytes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Chunk written"
        );

        Ok(ChunkEntry {
            index: task.index,
            file: task.file.clone(),
            rows: row_count,
            data_bytes,
            file_bytes,
            range: task.range.clone(),
            checksum,
        })
    }

    /// Encodes and compresses rows as the server sends them. Returns the
    /// number of rows and of uncompressed bytes.
    async fn write_rows(
        &self,
        writer: &mut dyn ObjectWriter,
        rows: &mut dyn RowStream,
        task: &ChunkTask,
    ) -> Result<(u64, u64), TaskError> {
        let compression_err = |source| TaskError::Compression {
            file: task.file.clone(),
            source,
        };
        let mut encoder = CompressingWriter::new(task.compression).map_err(compression_err)?;
        let mut buffer = Vec::with_capacity(FLUSH_BYTES + 4096);
        let mut count = 0u64;

        while let Some(row) = cancellable(&self.cancel, rows.next()).await? {
            let values: Vec<Option<&[u8]>> = row.values().iter().map(|v| v.as_deref()).collect();
            self.dialect.encode_row(&values, &mut buffer);
            count += 1;

            if buffer.len() >= FLUSH_BYTES {
                encoder.write(&buffer).map_err(compression_err)?;
                buffer.clear();
                let out = encoder.take_output();
                if !out.is_empty() {
                    writer.write(&out).await?;
                }
            }
        }

        encoder.write(&buffer).map_err(compression_err)?;
        let data_bytes = encoder.consumed();
        let mut out = encoder.take_output();
        out.extend(encoder.finish().map_err(compression_err)?);
        if !out.is_empty() {
            writer.write(&out).await?;
        }
        Ok((count, data_bytes))
    }
}
