//! Data phase. Tables are scheduled as soon as their metadata shows up in
//! storage, so loading can trail a dump that is still running.

use super::{
    LoadContext,
    scheduler::{ChunkJob, JobQueue},
};
use crate::error::LoadError;
use connectors::{error::StorageError, session::Session};
use engine_core::retry::{RetryError, RetryPolicy};
use engine_processing::{checksum, error::TaskError, load::ChunkLoader, retry::classify_task_error};
use futures::lock::Mutex;
use model::{
    core::identifiers::{ObjectName, TaskId},
    dump::{
        files::table_manifest_file,
        manifest::{ChunkEntry, TableManifest},
    },
};
use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Instant,
};
use tracing::{debug, error, info, warn};

struct TableLoad {
    manifest: TableManifest,
    /// Chunks a previous run may have partly loaded.
    resumed: HashSet<usize>,
    failed: AtomicBool,
}

struct DataShared {
    ctx: Arc<LoadContext>,
    queue: JobQueue,
    tables: Mutex<HashMap<ObjectName, Arc<TableLoad>>>,
}

/// Loads every table's chunks and hands the worker sessions back.
pub(super) async fn load_data(
    ctx: Arc<LoadContext>,
    main: &dyn Session,
    workers: Vec<Arc<dyn Session>>,
) -> Result<Vec<Arc<dyn Session>>, LoadError> {
    let mut pending = Vec::new();
    for table in ctx.manifest.tables().filter(|t| ctx.options.filter.table_included(t)) {
        if ctx.state.is_done(&TaskId::table_data(&table)) {
            debug!(table = %table, "Table data already loaded");
            continue;
        }
        pending.push(table);
    }

    let shared = Arc::new(DataShared {
        ctx: ctx.clone(),
        queue: JobQueue::new(workers.len()),
        tables: Mutex::new(HashMap::new()),
    });
    let handles: Vec<_> = workers
        .into_iter()
        .enumerate()
        .map(|(id, session)| {
            let shared = shared.clone();
            tokio::spawn(async move {
                shared.work(id, session.as_ref()).await;
                session
            })
        })
        .collect();

    let fed = shared.feed(main, pending).await;
    shared.queue.close().await;

    let mut sessions = Vec::with_capacity(handles.len());
    let mut join_error = None;
    for handle in handles {
        match handle.await {
            Ok(session) => sessions.push(session),
            Err(e) => {
                error!(error = %e, "Load worker panicked");
                join_error.get_or_insert(e);
            }
        }
    }
    if let Some(e) = join_error {
        return Err(LoadError::TaskJoin(e));
    }
    fed?;
    Ok(sessions)
}

impl DataShared {
    /// Polls storage for table metadata until every pending table has been
    /// scheduled or the dump is known to be done without it.
    async fn feed(&self, main: &dyn Session, mut pending: Vec<ObjectName>) -> Result<(), LoadError> {
        let ctx = &self.ctx;
        let mut since = Instant::now();
        while !pending.is_empty() {
            if ctx.cancel.is_cancelled() {
                return Err(LoadError::Cancelled);
            }
            let complete = ctx.watcher.is_complete().await?;
            let present: HashSet<String> = ctx.storage.list("").await?.into_iter().map(|o| o.name).collect();
            let (ready, waiting): (Vec<_>, Vec<_>) = pending
                .into_iter()
                .partition(|t| present.contains(&table_manifest_file(t)));
            pending = waiting;
            if !ready.is_empty() {
                since = Instant::now();
            }
            for table in ready {
                self.schedule(main, table).await?;
            }
            if pending.is_empty() {
                break;
            }

            let Some(timeout) = ctx.watcher.timeout().filter(|_| !complete) else {
                for table in &pending {
                    let missing = TaskError::Storage(StorageError::NotFound(table_manifest_file(table)));
                    ctx.task_failed(&TaskId::table_data(table), &missing).await;
                }
                break;
            };
            if since.elapsed() >= timeout {
                return Err(LoadError::WaitTimeout(timeout));
            }
            ctx.watcher.pause().await?;
        }
        Ok(())
    }

    /// Queues the chunks of one table that still need loading. A table
    /// without a unique key cannot tell replayed rows apart, so a partial
    /// load of it is truncated and started over.
    async fn schedule(&self, main: &dyn Session, table: ObjectName) -> Result<(), LoadError> {
        let ctx = &self.ctx;
        let manifest: TableManifest = ctx.read_json(&table_manifest_file(&table)).await?;

        let mut chunks = Vec::new();
        let mut resumed = HashSet::new();
        let mut done = 0u64;
        for chunk in &manifest.chunks {
            let status = ctx.state.status(&TaskId::chunk(&table, chunk.index));
            if status.is_done() {
                done += 1;
                continue;
            }
            if status.is_interrupted() {
                resumed.insert(chunk.index);
            }
            chunks.push(chunk.clone());
        }

        if !resumed.is_empty() && !manifest.has_unique_key {
            warn!(table = %table, "Table without a unique key was partly loaded, truncating it");
            ctx.warn();
            if let Err(e) = main.execute(&format!("TRUNCATE TABLE {}", table.quoted())).await {
                ctx.task_failed(&TaskId::table_data(&table), &TaskError::Db(e)).await;
                return Ok(());
            }
            chunks = manifest.chunks.clone();
            resumed.clear();
        } else {
            ctx.counters.skipped_chunks.fetch_add(done, Ordering::Relaxed);
        }

        let load = Arc::new(TableLoad {
            manifest,
            resumed,
            failed: AtomicBool::new(false),
        });
        if chunks.is_empty() {
            self.table_finished(&load).await;
            return Ok(());
        }
        debug!(table = %table, chunks = chunks.len(), "Table scheduled");
        self.tables.lock().await.insert(table.clone(), load);
        self.queue.add_table(table, chunks).await;
        Ok(())
    }

    async fn work(&self, worker: usize, session: &dyn Session) {
        let mut loaded = 0usize;
        while let Some(ChunkJob { table, chunk }) = self.queue.take().await {
            let load = self.tables.lock().await.get(&table).cloned();
            let cancelled = self.ctx.cancel.is_cancelled();
            if let Some(load) = &load
                && !cancelled
            {
                if !self.load_chunk(session, load, &chunk).await {
                    load.failed.store(true, Ordering::Release);
                }
                loaded += 1;
            }
            if self.queue.finished(&table).await
                && !cancelled
                && let Some(load) = load
            {
                self.table_finished(&load).await;
            }
        }
        debug!(worker, chunks = loaded, "Load worker finished");
    }

    async fn load_chunk(&self, session: &dyn Session, table: &TableLoad, chunk: &ChunkEntry) -> bool {
        let ctx = &self.ctx;
        let name = table.manifest.name();
        let id = TaskId::chunk(&name, chunk.index);
        let resumed = table.resumed.contains(&chunk.index);
        // Replaying a batch is only harmless when duplicates can be detected.
        let retry = if table.manifest.has_unique_key {
            RetryPolicy::for_database()
        } else {
            RetryPolicy::none()
        };
        let attempts = AtomicUsize::new(0);

        ctx.track(&id, async {
            if ctx.options.dry_run {
                debug!(table = %name, chunk = chunk.index, rows = chunk.rows, "Would load chunk");
                ctx.metrics.increment_rows(chunk.rows);
                return Ok((chunk.rows, chunk.data_bytes));
            }
            let loaded = retry
                .run(
                    || {
                        let retrying = attempts.fetch_add(1, Ordering::Relaxed) > 0;
                        let cancel = ctx.cancel.clone();
                        async move {
                            ChunkLoader::new(session, ctx.storage.as_ref(), ctx.options.bytes_per_transaction)
                                .with_cancel(cancel)
                                .ignore_duplicates(resumed || retrying)
                                .load(&table.manifest, chunk)
                                .await
                        }
                    },
                    classify_task_error,
                )
                .await
                .map_err(RetryError::into_inner)?;

            let retries = attempts.load(Ordering::Relaxed).saturating_sub(1);
            if retries > 0 {
                ctx.metrics.increment_retries(retries as u64);
            }
            ctx.metrics.increment_rows(loaded.rows);
            ctx.metrics.increment_bytes(loaded.data_bytes, chunk.file_bytes);
            ctx.counters.chunks.fetch_add(1, Ordering::Relaxed);
            if ctx.options.checksum {
                self.verify(session, &table.manifest, chunk).await;
            }
            Ok((loaded.rows, loaded.data_bytes))
        })
        .await
    }

    /// Compares the rows now in the target against the checksum taken at
    /// dump time. A mismatch is reported, not fatal.
    async fn verify(&self, session: &dyn Session, manifest: &TableManifest, chunk: &ChunkEntry) {
        let Some(expected) = chunk.checksum else {
            return;
        };
        let ctx = &self.ctx;
        let name = manifest.name();
        let predicate = chunk.range.as_ref().and_then(|r| r.predicate());
        match checksum::compute(session, &name, &manifest.data_columns(), predicate.as_deref()).await {
            Ok(actual) if actual == expected => {
                debug!(table = %name, chunk = chunk.index, "Checksum verified");
            }
            Ok(actual) => {
                warn!(
                    table = %name,
                    chunk = chunk.index,
                    expected_rows = expected.count,
                    actual_rows = actual.count,
                    "Checksum mismatch"
                );
                ctx.warn();
                ctx.counters.checksum_mismatches.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                warn!(table = %name, chunk = chunk.index, error = %e, "Failed to verify checksum");
                ctx.warn();
            }
        }
    }

    async fn table_finished(&self, table: &TableLoad) {
        if table.failed.load(Ordering::Acquire) {
            return;
        }
        let ctx = &self.ctx;
        let name = table.manifest.name();
        let (rows, bytes) = (table.manifest.total_rows(), table.manifest.total_bytes());
        if let Err(e) = ctx.progress.done(&TaskId::table_data(&name), rows, bytes).await {
            warn!(table = %name, error = %e, "Failed to record progress");
        }
        ctx.counters.tables.fetch_add(1, Ordering::Relaxed);
        info!(table = %name, rows, "Table loaded");
    }
}
