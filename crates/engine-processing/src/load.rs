use crate::{dump::cancellable, error::TaskError};
use connectors::{codec::Decompressor, session::Session, storage::Storage};
use model::{
    core::{
        identifiers::ObjectName,
        utils::{bytes_literal, quote_identifier},
    },
    dump::manifest::{ChunkEntry, TableManifest},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoadedChunk {
    pub rows: u64,
    pub data_bytes: u64,
    pub statements: u64,
}

pub fn insert_prefix(table: &ObjectName, columns: &[&str], ignore_duplicates: bool) -> String {
    let columns: Vec<String> = columns.iter().map(|c| quote_identifier(c)).collect();
    format!(
        "INSERT {}INTO {} ({}) VALUES ",
        if ignore_duplicates { "IGNORE " } else { "" },
        table.quoted(),
        columns.join(", ")
    )
}

/// Replays one data file as batched multi-row inserts. Each statement
/// commits on its own, so a batch is the unit a resumed load may repeat.
pub struct ChunkLoader<'a> {
    session: &'a dyn Session,
    storage: &'a dyn Storage,
    cancel: CancellationToken,
    bytes_per_transaction: u64,
    ignore_duplicates: bool,
}

impl<'a> ChunkLoader<'a> {
    pub fn new(session: &'a dyn Session, storage: &'a dyn Storage, bytes_per_transaction: u64) -> Self {
        Self {
            session,
            storage,
            cancel: CancellationToken::new(),
            bytes_per_transaction: bytes_per_transaction.max(1),
            ignore_duplicates: false,
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Discard rows that collide with ones already present, for chunks that
    /// were partially loaded before.
    pub fn ignore_duplicates(mut self, ignore: bool) -> Self {
        self.ignore_duplicates = ignore;
        self
    }

    /// Reads, decompresses and decodes the file piece by piece, so only the
    /// statement being built and one undecoded piece are held in memory.
    pub async fn load(&self, table: &TableManifest, chunk: &ChunkEntry) -> Result<LoadedChunk, TaskError> {
        let compression_err = |source| TaskError::Compression {
            file: chunk.file.clone(),
            source,
        };
        let mut reader = self.storage.reader(&chunk.file).await?;
        let mut decoder = Decompressor::new(table.compression).map_err(compression_err)?;
        let columns = table.data_columns();
        let mut state = LoadState {
            table,
            file: &chunk.file,
            width: columns.len(),
            batch: InsertBatch::new(insert_prefix(&table.name(), &columns, self.ignore_duplicates)),
            pending: Vec::new(),
            loaded: LoadedChunk::default(),
        };

        while let Some(piece) = reader.read_chunk().await? {
            if self.cancel.is_cancelled() {
                return Err(TaskError::Cancelled);
            }
            decoder.write(&piece).map_err(compression_err)?;
            self.feed(&mut state, decoder.take_output(), false).await?;
        }
        let mut tail = decoder.take_output();
        tail.extend(decoder.finish().map_err(compression_err)?);
        self.feed(&mut state, tail, true).await?;
        if !state.batch.is_empty() {
            self.execute(state.batch.take()).await?;
            state.loaded.statements += 1;
        }

        let loaded = state.loaded;
        debug!(
            table = %table.name(),
            chunk = chunk.index,
            rows = loaded.rows,
            statements = loaded.statements,
            "Chunk loaded"
        );
        Ok(loaded)
    }

    /// Decodes the complete rows available so far and sends every batch
    /// that reached its size.
    async fn feed(&self, state: &mut LoadState<'_>, plain: Vec<u8>, last: bool) -> Result<(), TaskError> {
        state.loaded.data_bytes += plain.len() as u64;
        state.pending.extend_from_slice(&plain);
        let (rows, consumed) = state
            .table
            .dialect
            .decode_prefix(&state.pending, last)
            .map_err(|source| TaskError::Dialect {
                file: state.file.to_string(),
                source,
            })?;
        state.pending.drain(..consumed);

        for row in rows {
            if row.len() != state.width {
                return Err(TaskError::ColumnCount {
                    file: state.file.to_string(),
                    expected: state.width,
                    found: row.len(),
                });
            }
            state.batch.push(&row);
            state.loaded.rows += 1;
            if state.batch.len() as u64 >= self.bytes_per_transaction {
                self.execute(state.batch.take()).await?;
                state.loaded.statements += 1;
            }
        }
        Ok(())
    }

    async fn execute(&self, sql: String) -> Result<(), TaskError> {
        cancellable(&self.cancel, self.session.execute(&sql)).await?;
        Ok(())
    }
}

struct LoadState<'t> {
    table: &'t TableManifest,
    file: &'t str,
    width: usize,
    batch: InsertBatch,
    pending: Vec<u8>,
    loaded: LoadedChunk,
}

/// One multi-row `INSERT` being assembled.
struct InsertBatch {
    prefix: String,
    statement: String,
}

impl InsertBatch {
    fn new(prefix: String) -> Self {
        InsertBatch {
            prefix,
            statement: String::new(),
        }
    }

    fn push(&mut self, row: &[Option<Vec<u8>>]) {
        self.statement
            .push_str(if self.statement.is_empty() { self.prefix.as_str() } else { "," });
        self.statement.push('(');
        for (idx, value) in row.iter().enumerate() {
            if idx > 0 {
                self.statement.push_str(", ");
            }
            match value {
                Some(bytes) => self.statement.push_str(&bytes_literal(bytes)),
                None => self.statement.push_str("NULL"),
            }
        }
        self.statement.push(')');
    }

    fn len(&self) -> usize {
        self.statement.len()
    }

    fn is_empty(&self) -> bool {
        self.statement.is_empty()
    }

    fn take(&mut self) -> String {
        std::mem::take(&mut self.statement)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use connectors::{
        codec::compress,
        error::StorageError,
        session::recording::RecordingSession,
        storage::{MemoryStorage, ObjectInfo, ObjectReader, ObjectWriter},
    };
    use model::dump::{
        dialect::Dialect,
        manifest::ColumnInfo,
        task::Compression,
    };
    use std::sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    /// Serves objects in small pieces and counts how many went out.
    struct PiecewiseStorage {
        inner: MemoryStorage,
        piece: usize,
        served: Arc<AtomicUsize>,
    }

    struct PiecewiseReader {
        data: Vec<u8>,
        offset: usize,
        piece: usize,
        served: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ObjectReader for PiecewiseReader {
        async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, StorageError> {
            if self.offset >= self.data.len() {
                return Ok(None);
            }
            let end = (self.offset + self.piece).min(self.data.len());
            let piece = self.data[self.offset..end].to_vec();
            self.offset = end;
            self.served.fetch_add(1, Ordering::SeqCst);
            Ok(Some(piece))
        }
    }

    #[async_trait]
    impl Storage for PiecewiseStorage {
        fn describe(&self) -> String {
            self.inner.describe()
        }

        async fn exists(&self, name: &str) -> Result<bool, StorageError> {
            self.inner.exists(name).await
        }

        async fn read(&self, name: &str) -> Result<Vec<u8>, StorageError> {
            self.inner.read(name).await
        }

        async fn reader(&self, name: &str) -> Result<Box<dyn ObjectReader>, StorageError> {
            Ok(Box::new(PiecewiseReader {
                data: self.inner.read(name).await?,
                offset: 0,
                piece: self.piece,
                served: self.served.clone(),
            }))
        }

        async fn write(&self, name: &str, data: &[u8]) -> Result<(), StorageError> {
            self.inner.write(name, data).await
        }

        async fn create(&self, name: &str) -> Result<Box<dyn ObjectWriter>, StorageError> {
            self.inner.create(name).await
        }

        async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError> {
            self.inner.list(prefix).await
        }

        async fn remove(&self, name: &str) -> Result<(), StorageError> {
            self.inner.remove(name).await
        }
    }

    fn manifest() -> TableManifest {
        let column = |name: &str, generated| ColumnInfo {
            name: name.into(),
            data_type: "varchar".into(),
            nullable: true,
            generated,
        };
        TableManifest {
            schema: "shop".into(),
            table: "items".into(),
            columns: vec![column("id", false), column("name", false), column("v", true)],
            index_name: Some("PRIMARY".into()),
            index_columns: vec!["id".into()],
            has_unique_key: true,
            chunking: true,
            compression: Compression::Gzip,
            dialect: Dialect::tsv(),
            chunks: vec![],
        }
    }

    fn chunk() -> ChunkEntry {
        ChunkEntry {
            index: 0,
            file: "shop@items@0.tsv.gz".into(),
            rows: 3,
            data_bytes: 0,
            file_bytes: 0,
            range: None,
            checksum: None,
        }
    }

    async fn storage_with(data: &[u8]) -> MemoryStorage {
        let storage = MemoryStorage::new("load");
        storage
            .write("shop@items@0.tsv.gz", &compress(Compression::Gzip, data).unwrap())
            .await
            .unwrap();
        storage
    }

    #[tokio::test]
    async fn batches_inserts_by_size() {
        let storage = storage_with(b"1\ta\n2\t\\N\n3\tit's\n").await;
        let session = RecordingSession::new();

        let loaded = ChunkLoader::new(&session, &storage, 40)
            .load(&manifest(), &chunk())
            .await
            .unwrap();

        assert_eq!(loaded.rows, 3);
        let statements = session.statements();
        assert_eq!(statements.len() as u64, loaded.statements);
        assert_eq!(
            statements[0],
            "INSERT INTO `shop`.`items` (`id`, `name`) VALUES ('1', 'a')"
        );
        assert!(statements.iter().any(|s| s.contains("('2', NULL)")));
        assert!(statements.iter().any(|s| s.contains("('3', 'it\\'s')")));
    }

    #[tokio::test]
    async fn inserts_start_before_the_file_is_fully_read() {
        let data: Vec<u8> = (0..5000u32)
            .flat_map(|i| format!("{i}\tname number {i}\n").into_bytes())
            .collect();
        let served = Arc::new(AtomicUsize::new(0));
        let storage = PiecewiseStorage {
            inner: storage_with(&data).await,
            piece: 512,
            served: served.clone(),
        };
        let total_pieces = storage.read("shop@items@0.tsv.gz").await.unwrap().len().div_ceil(512);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let (seen_by_session, served_by_storage) = (seen.clone(), served.clone());
        let session = RecordingSession::with_responder(move |_| {
            seen_by_session
                .lock()
                .unwrap()
                .push(served_by_storage.load(Ordering::SeqCst));
            None
        });

        let loaded = ChunkLoader::new(&session, &storage, 4096)
            .load(&manifest(), &chunk())
            .await
            .unwrap();

        assert_eq!(loaded.rows, 5000);
        assert_eq!(loaded.data_bytes, data.len() as u64);
        let seen = seen.lock().unwrap();
        assert!(seen[0] < total_pieces, "first insert only after all {total_pieces} pieces");
        let statements = session.statements();
        assert!(statements.iter().any(|s| s.contains("('4999', 'name number 4999')")));
        assert!(statements[0].contains("('0', 'name number 0')"));
    }

    #[tokio::test]
    async fn resumed_chunks_ignore_duplicates() {
        let storage = storage_with(b"1\ta\n").await;
        let session = RecordingSession::new();
        ChunkLoader::new(&session, &storage, 1 << 20)
            .ignore_duplicates(true)
            .load(&manifest(), &chunk())
            .await
            .unwrap();
        assert!(session.statements()[0].starts_with("INSERT IGNORE INTO"));
    }

    #[tokio::test]
    async fn rejects_rows_with_wrong_width() {
        let storage = storage_with(b"1\ta\textra\n").await;
        let session = RecordingSession::new();
        let err = ChunkLoader::new(&session, &storage, 1 << 20)
            .load(&manifest(), &chunk())
            .await
            .unwrap_err();
        assert!(matches!(err, TaskError::ColumnCount { expected: 2, found: 3, .. }));
        assert!(session.statements().is_empty());
    }
}
