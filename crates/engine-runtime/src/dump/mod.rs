//! Dump orchestration: plan, snapshot, then drain every task through a pool
//! of workers that each own one session.

pub mod export;

use crate::{
    actor::{ProgressHandle, Reporter, reporter::REPORT_INTERVAL},
    context::RunContext,
    error::DumpError,
    snapshot,
};
use chrono::Utc;
use connectors::{
    error::DbError,
    session::{Session, SessionFactory},
    storage::Storage,
};
use engine_config::{
    options::{DumpOptions, DumpScope, Options},
    settings::ConsistencyConfig,
};
use engine_core::{
    metrics::Metrics,
    retry::{RetryError, RetryPolicy},
};
use engine_processing::{
    compat::Compatibility,
    ddl,
    dump::ChunkDumper,
    error::TaskError,
    retry::classify_task_error,
};
use futures::lock::Mutex;
use model::{
    core::{
        identifiers::{ObjectName, TaskId},
        utils::quote_string,
    },
    dump::{
        files::{CHUNK_PLAN_FILE, DONE_FILE, DUMP_PROGRESS_FILE, MANIFEST_FILE, table_manifest_file},
        manifest::{ChunkEntry, DumpManifest},
        task::{ChunkTask, DdlTask, ObjectKind},
    },
    progress::state::ProgressState,
};
use planner::{DumpPlan, TablePlan};
use serde_json::json;
use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DumpReport {
    pub tables: usize,
    pub ddl_files: usize,
    pub chunks: usize,
    pub rows: u64,
    pub data_bytes: u64,
    pub file_bytes: u64,
    /// Tasks found done by a previous run.
    pub skipped: usize,
    pub elapsed: Duration,
}

pub async fn dump_instance(
    sessions: Arc<dyn SessionFactory>,
    storage: Arc<dyn Storage>,
    options: DumpOptions,
) -> Result<DumpReport, DumpError> {
    Dumper::new(sessions, storage, options).run(&DumpScope::Instance).await
}

pub async fn dump_schemas(
    sessions: Arc<dyn SessionFactory>,
    storage: Arc<dyn Storage>,
    schemas: Vec<String>,
    options: DumpOptions,
) -> Result<DumpReport, DumpError> {
    Dumper::new(sessions, storage, options)
        .run(&DumpScope::Schemas(schemas))
        .await
}

pub async fn dump_tables(
    sessions: Arc<dyn SessionFactory>,
    storage: Arc<dyn Storage>,
    schema: String,
    tables: Vec<String>,
    all: bool,
    options: DumpOptions,
) -> Result<DumpReport, DumpError> {
    Dumper::new(sessions, storage, options)
        .run(&DumpScope::Tables { schema, tables, all })
        .await
}

pub struct Dumper {
    sessions: Arc<dyn SessionFactory>,
    storage: Arc<dyn Storage>,
    options: DumpOptions,
    cancel: CancellationToken,
}

#[derive(Debug, Clone, Copy)]
enum WorkItem {
    Ddl(usize),
    Chunk(usize),
}

/// Chunks of one table still outstanding, and the entries of those done.
#[derive(Debug, Default)]
struct TableChunks {
    remaining: usize,
    entries: Vec<ChunkEntry>,
    failed: bool,
}

struct DumpShared {
    plan: DumpPlan,
    table_index: HashMap<ObjectName, usize>,
    storage: Arc<dyn Storage>,
    compat: Compatibility,
    progress: ProgressHandle,
    metrics: Metrics,
    cancel: CancellationToken,
    checksum: bool,
    dry_run: bool,
    retry: RetryPolicy,
    items: Vec<WorkItem>,
    cursor: AtomicUsize,
    tables: Mutex<HashMap<ObjectName, TableChunks>>,
    failed: Mutex<Vec<String>>,
}

impl Dumper {
    pub fn new(sessions: Arc<dyn SessionFactory>, storage: Arc<dyn Storage>, options: DumpOptions) -> Self {
        Self {
            sessions,
            storage,
            options,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub async fn run(&self, scope: &DumpScope) -> Result<DumpReport, DumpError> {
        scope.validate()?;
        self.options.validate()?;
        let options = &self.options;

        let ctx = RunContext::new("dump", self.storage.clone(), &options.storage);
        let storage = ctx.storage.clone();
        if storage.exists(DONE_FILE).await? {
            return Err(DumpError::AlreadyComplete(storage.describe()));
        }

        let store = ctx.progress_store(&options.storage, DUMP_PROGRESS_FILE)?;
        let (progress, state, tracker) = ProgressHandle::start(store, options.reset_progress).await?;
        let resuming = !state.is_empty();
        if !resuming && storage.exists(MANIFEST_FILE).await? && !options.reset_progress {
            return Err(DumpError::NotEmpty(storage.describe()));
        }
        if resuming {
            info!(tasks = state.len(), "Resuming interrupted dump");
        }

        let main = self.sessions.open().await?;
        prepare_session(main.as_ref(), options).await?;
        let mut plan = planner::plan(main.as_ref(), scope, options).await?;
        reuse_chunk_boundaries(storage.as_ref(), &mut plan, resuming && !options.reset_progress).await?;

        let mut workers = Vec::with_capacity(options.threads);
        for _ in 0..options.threads {
            let session = self.sessions.open().await?;
            prepare_session(session.as_ref(), options).await?;
            workers.push(session);
        }

        let consistency = if options.dry_run {
            ConsistencyConfig {
                consistent: false,
                ..options.consistency.clone()
            }
        } else {
            options.consistency.clone()
        };
        let handle = snapshot::begin(main.clone(), &workers, &plan.lock_targets(), &consistency).await?;
        let coordinates = handle.coordinates().clone();
        handle.release().await?;
        if resuming && consistency.consistent {
            warn!("Data dumped before the interruption was read from an earlier snapshot");
        }

        plan.manifest.gtid_executed = coordinates.gtid_executed;
        if let Some(binlog) = coordinates.binlog {
            plan.manifest.binlog_file = Some(binlog.file);
            plan.manifest.binlog_position = Some(binlog.position);
        }
        write_manifest(storage.as_ref(), &plan.manifest).await?;

        let reporter = Reporter::start("dump", ctx.metrics.clone(), REPORT_INTERVAL, options.show_progress);
        reporter.set_total(plan.total_bytes()).await;

        let (items, skipped) = work_items(&plan, &state);
        let tables = table_chunks(storage.as_ref(), &plan, &state, options.ddl_only).await?;
        let table_index = plan
            .tables
            .iter()
            .enumerate()
            .map(|(i, t)| (t.name.clone(), i))
            .collect();
        let table_count = plan.tables.len();
        let ddl_count = plan.ddl_tasks.len();
        let chunk_count = plan.chunk_tasks.len();

        let shared = Arc::new(DumpShared {
            plan,
            table_index,
            storage: storage.clone(),
            compat: Compatibility::new(options.compatibility.clone()),
            progress: progress.clone(),
            metrics: ctx.metrics.clone(),
            cancel: self.cancel.clone(),
            checksum: options.checksum,
            dry_run: options.dry_run,
            retry: if options.consistency.consistent {
                // A replacement session would not see the snapshot.
                RetryPolicy::none()
            } else {
                RetryPolicy::for_database()
            },
            items,
            cursor: AtomicUsize::new(0),
            tables: Mutex::new(HashMap::new()),
            failed: Mutex::new(Vec::new()),
        });
        shared.finish_resumed_tables(tables).await;

        info!(
            run_id = %ctx.run_id,
            workers = workers.len(),
            tasks = shared.items.len(),
            skipped,
            "Dumping"
        );
        let killer = spawn_query_killer(self.sessions.clone(), &workers, self.cancel.clone());
        let handles: Vec<_> = workers
            .into_iter()
            .enumerate()
            .map(|(id, session)| {
                let shared = shared.clone();
                tokio::spawn(async move { shared.work(id, session).await })
            })
            .collect();
        let mut join_error = None;
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Dump worker panicked");
                join_error.get_or_insert(e);
            }
        }
        killer.abort();

        let failed = shared.failed.lock().await.clone();
        let mut manifest = shared.plan.manifest.clone();
        drop(shared);
        let flushed = progress.shutdown(tracker).await;
        reporter.finish().await;

        if let Some(e) = join_error {
            return Err(DumpError::TaskJoin(e));
        }
        flushed?;
        if self.cancel.is_cancelled() {
            return Err(DumpError::Cancelled);
        }
        if !failed.is_empty() {
            return Err(DumpError::TasksFailed(failed));
        }

        let snapshot = ctx.metrics.snapshot();
        manifest.end = Some(Utc::now());
        manifest.complete = true;
        write_manifest(storage.as_ref(), &manifest).await?;
        let done = json!({
            "end": manifest.end,
            "tables": table_count,
            "rows": snapshot.rows,
            "dataBytes": snapshot.data_bytes,
        });
        storage.write(DONE_FILE, &serde_json::to_vec_pretty(&done)?).await?;
        if let Err(e) = storage.remove(CHUNK_PLAN_FILE).await {
            debug!(error = %e, "Chunk plan left in place");
        }

        info!(tables = table_count, rows = snapshot.rows, "Dump completed");
        Ok(DumpReport {
            tables: table_count,
            ddl_files: ddl_count,
            chunks: chunk_count,
            rows: snapshot.rows,
            data_bytes: snapshot.data_bytes,
            file_bytes: snapshot.file_bytes,
            skipped,
            elapsed: snapshot.elapsed,
        })
    }
}

async fn prepare_session(session: &dyn Session, options: &DumpOptions) -> Result<(), DbError> {
    session
        .execute(&format!("SET NAMES {}", quote_string(&options.character_set)))
        .await?;
    if options.tz_utc {
        session.execute("SET TIME_ZONE = '+00:00'").await?;
    }
    session.execute("SET SESSION net_write_timeout = 1800").await?;
    Ok(())
}

async fn write_manifest(storage: &dyn Storage, manifest: &DumpManifest) -> Result<(), DumpError> {
    storage
        .write(MANIFEST_FILE, &serde_json::to_vec_pretty(manifest)?)
        .await?;
    Ok(())
}

/// Chunk boundaries depend on table statistics, so a resumed dump keeps the
/// ones it started with. Tables new to the plan get fresh boundaries.
async fn reuse_chunk_boundaries(
    storage: &dyn Storage,
    plan: &mut DumpPlan,
    resuming: bool,
) -> Result<(), DumpError> {
    if resuming && storage.exists(CHUNK_PLAN_FILE).await? {
        let saved: Vec<ChunkTask> = serde_json::from_slice(&storage.read(CHUNK_PLAN_FILE).await?)?;
        let planned: HashSet<ObjectName> = plan.chunk_tasks.iter().map(|c| c.table.clone()).collect();
        let saved_tables: HashSet<ObjectName> = saved.iter().map(|c| c.table.clone()).collect();

        let mut chunks: Vec<ChunkTask> = saved
            .into_iter()
            .filter(|c| planned.contains(&c.table))
            .collect();
        chunks.extend(
            plan.chunk_tasks
                .drain(..)
                .filter(|c| !saved_tables.contains(&c.table)),
        );
        plan.chunk_tasks = chunks;
        for table in &mut plan.tables {
            table.chunk_count = plan.chunk_tasks.iter().filter(|c| c.table == table.name).count();
        }
        debug!(chunks = plan.chunk_tasks.len(), "Reusing chunk boundaries");
        return Ok(());
    }
    storage
        .write(CHUNK_PLAN_FILE, &serde_json::to_vec(&plan.chunk_tasks)?)
        .await?;
    Ok(())
}

/// DDL first, then chunks largest first. Tasks done by a previous run are
/// left out.
fn work_items(plan: &DumpPlan, state: &ProgressState) -> (Vec<WorkItem>, usize) {
    let mut skipped = 0;
    let mut items = Vec::with_capacity(plan.ddl_tasks.len() + plan.chunk_tasks.len());
    for (i, task) in plan.ddl_tasks.iter().enumerate() {
        if state.is_done(&task.id) {
            skipped += 1;
        } else {
            items.push(WorkItem::Ddl(i));
        }
    }

    let mut chunks: Vec<usize> = Vec::with_capacity(plan.chunk_tasks.len());
    for (i, task) in plan.chunk_tasks.iter().enumerate() {
        if state.is_done(&task.id) {
            skipped += 1;
        } else {
            chunks.push(i);
        }
    }
    chunks.sort_by(|a, b| {
        plan.chunk_tasks[*b]
            .estimated_bytes
            .cmp(&plan.chunk_tasks[*a].estimated_bytes)
    });
    items.extend(chunks.into_iter().map(WorkItem::Chunk));
    (items, skipped)
}

/// Per-table bookkeeping. Chunks done by a previous run are rebuilt from the
/// progress log and the files present in storage; a done chunk whose file is
/// gone is redone.
async fn table_chunks(
    storage: &dyn Storage,
    plan: &DumpPlan,
    state: &ProgressState,
    ddl_only: bool,
) -> Result<HashMap<ObjectName, TableChunks>, DumpError> {
    let mut tables = HashMap::new();
    if ddl_only {
        return Ok(tables);
    }
    let files: HashMap<String, u64> = if state.is_empty() {
        HashMap::new()
    } else {
        storage
            .list("")
            .await?
            .into_iter()
            .map(|o| (o.name, o.size))
            .collect()
    };

    for table in &plan.tables {
        let mut chunks = TableChunks::default();
        for task in plan.chunks_of(&table.name) {
            match files.get(&task.file) {
                Some(size) if state.is_done(&task.id) => chunks.entries.push(ChunkEntry {
                    index: task.index,
                    file: task.file.clone(),
                    rows: state.rows(&task.id).unwrap_or(0),
                    data_bytes: state.bytes(&task.id).unwrap_or(0),
                    file_bytes: *size,
                    range: task.range.clone(),
                    checksum: None,
                }),
                _ => chunks.remaining += 1,
            }
        }
        tables.insert(table.name.clone(), chunks);
    }
    Ok(tables)
}

fn spawn_query_killer(
    sessions: Arc<dyn SessionFactory>,
    workers: &[Arc<dyn Session>],
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let ids: Vec<u64> = workers.iter().map(|s| s.connection_id()).collect();
    tokio::spawn(async move {
        cancel.cancelled().await;
        for id in ids {
            if let Err(e) = sessions.kill_query(id).await {
                debug!(connection = id, error = %e, "Failed to kill query");
            }
        }
    })
}

impl DumpShared {
    async fn work(&self, worker: usize, session: Arc<dyn Session>) {
        let mut tasks = 0usize;
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            let next = self.cursor.fetch_add(1, Ordering::Relaxed);
            let Some(item) = self.items.get(next).copied() else {
                break;
            };
            match item {
                WorkItem::Ddl(i) => self.dump_ddl(session.as_ref(), &self.plan.ddl_tasks[i]).await,
                WorkItem::Chunk(i) => self.dump_chunk(session.as_ref(), &self.plan.chunk_tasks[i]).await,
            }
            tasks += 1;
        }
        debug!(worker, tasks, "Dump worker finished");
        if let Err(e) = session.close().await {
            debug!(worker, error = %e, "Failed to close session");
        }
    }

    fn table(&self, name: &ObjectName) -> Option<&TablePlan> {
        self.table_index.get(name).map(|i| &self.plan.tables[*i])
    }

    async fn dump_ddl(&self, session: &dyn Session, task: &DdlTask) {
        self.record_started(task.id.clone()).await;
        let result = async {
            let script = match task.kind {
                ObjectKind::Users => ddl::capture_users(session, &self.plan.accounts, &self.compat).await?,
                ObjectKind::Table => ddl::capture(session, task, &self.compat, self.table(&task.object)).await?,
                _ => ddl::capture(session, task, &self.compat, None).await?,
            };
            self.storage.write(&task.file, script.as_bytes()).await?;
            Ok::<usize, TaskError>(script.len())
        }
        .await;

        match result {
            Ok(bytes) => {
                self.metrics.increment_done();
                if let Err(e) = self.progress.done(&task.id, 0, bytes as u64).await {
                    warn!(task = %task.id, error = %e, "Failed to record progress");
                }
            }
            Err(e) => self.task_failed(&task.id.to_string(), &task.file, e).await,
        }
    }

    async fn dump_chunk(&self, session: &dyn Session, task: &ChunkTask) {
        let Some(table) = self.table(&task.table) else {
            warn!(task = %task.id, "Chunk of a table that is not planned");
            return;
        };
        self.record_started(task.id.clone()).await;

        let dumper = ChunkDumper::new(session, self.storage.as_ref(), &self.plan.dialect)
            .with_cancel(self.cancel.clone())
            .with_checksum(self.checksum)
            .empty_files(self.dry_run);
        let result = self
            .retry
            .run(|| dumper.dump(table, task), classify_task_error)
            .await
            .map_err(RetryError::into_inner);

        match result {
            Ok(entry) => {
                self.metrics.increment_rows(entry.rows);
                self.metrics.increment_bytes(entry.data_bytes, entry.file_bytes);
                self.metrics.increment_done();
                if let Err(e) = self.progress.done(&task.id, entry.rows, entry.data_bytes).await {
                    warn!(task = %task.id, error = %e, "Failed to record progress");
                }
                self.chunk_finished(&task.table, Some(entry)).await;
            }
            Err(e) => {
                self.task_failed(&task.id.to_string(), &task.file, e).await;
                self.chunk_finished(&task.table, None).await;
            }
        }
    }

    async fn record_started(&self, id: TaskId) {
        if let Err(e) = self.progress.started(&id).await {
            warn!(task = %id, error = %e, "Failed to record progress");
        }
    }

    async fn task_failed(&self, id: &str, file: &str, err: TaskError) {
        if err.is_cancelled() {
            debug!(task = id, "Task cancelled");
        } else {
            error!(task = id, error = %err, "Task failed");
        }
        self.metrics.increment_failures();
        if let Err(e) = self.progress.failed(&id.into(), &err).await {
            warn!(task = id, error = %e, "Failed to record progress");
        }
        if let Err(e) = self.storage.remove(file).await {
            debug!(file, error = %e, "No partial file to remove");
        }
        self.failed.lock().await.push(id.to_string());
    }

    async fn chunk_finished(&self, table: &ObjectName, entry: Option<ChunkEntry>) {
        let completed = {
            let mut tables = self.tables.lock().await;
            let Some(chunks) = tables.get_mut(table) else {
                return;
            };
            match entry {
                Some(entry) => chunks.entries.push(entry),
                None => chunks.failed = true,
            }
            chunks.remaining = chunks.remaining.saturating_sub(1);
            (chunks.remaining == 0 && !chunks.failed).then(|| std::mem::take(&mut chunks.entries))
        };
        if let Some(entries) = completed {
            self.write_table_manifest(table, entries).await;
        }
    }

    /// Tables whose chunks were all done by a previous run get their
    /// manifest right away; the rest wait for their last chunk.
    async fn finish_resumed_tables(&self, tables: HashMap<ObjectName, TableChunks>) {
        let mut pending = HashMap::with_capacity(tables.len());
        for (name, chunks) in tables {
            if chunks.remaining == 0 {
                self.write_table_manifest(&name, chunks.entries).await;
            } else {
                pending.insert(name, chunks);
            }
        }
        *self.tables.lock().await = pending;
    }

    async fn write_table_manifest(&self, name: &ObjectName, mut entries: Vec<ChunkEntry>) {
        let Some(table) = self.table(name) else {
            return;
        };
        entries.sort_by_key(|e| e.index);
        let mut manifest = self.plan.table_manifest(table);
        manifest.chunks = entries;

        let file = table_manifest_file(name);
        let result = match serde_json::to_vec_pretty(&manifest) {
            Ok(body) => self.storage.write(&file, &body).await.map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match result {
            Ok(()) => debug!(table = %name, chunks = manifest.chunks.len(), rows = manifest.total_rows(), "Table dumped"),
            Err(e) => {
                error!(table = %name, error = %e, "Failed to write table manifest");
                self.failed.lock().await.push(file);
            }
        }
    }
}
