//! Loading a dump into a target server. A load walks through fixed phases
//! (see [`phase::LoadPhase`]); data may start loading while the dump that
//! produces it is still running.

mod data;
mod objects;
pub mod phase;
pub mod scheduler;

use crate::{
    actor::{ProgressHandle, Reporter, reporter::REPORT_INTERVAL},
    context::RunContext,
    error::LoadError,
};
use connectors::{
    error::{DbError, StorageError},
    session::{Session, SessionFactory, recording::RecordingSessionFactory, variable},
    storage::{MemoryStorage, Storage},
};
use engine_config::options::{LoadOptions, Options};
use engine_core::{
    metrics::Metrics,
    progress::{JsonProgressStore, ProgressStore},
};
use engine_processing::error::TaskError;
use futures::lock::Mutex;
use model::{
    core::{identifiers::TaskId, utils::quote_string},
    dump::{
        files::{DONE_FILE, MANIFEST_FILE, load_progress_file},
        manifest::DumpManifest,
    },
    progress::state::ProgressState,
};
use phase::{LoadPhase, PhaseMachine};
use serde::de::DeserializeOwned;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// How often an incomplete dump is checked for new files.
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub tables: u64,
    pub chunks: u64,
    pub rows: u64,
    pub data_bytes: u64,
    pub ddl_statements: u64,
    pub indexes: u64,
    /// Chunks found loaded by a previous run.
    pub skipped_chunks: u64,
    pub warnings: u64,
    pub checksum_mismatches: u64,
    /// Statements that would have been executed, for a dry run.
    pub dry_run_statements: Vec<String>,
    pub elapsed: Duration,
}

pub async fn load_dump(
    sessions: Arc<dyn SessionFactory>,
    storage: Arc<dyn Storage>,
    options: LoadOptions,
) -> Result<LoadReport, LoadError> {
    Loader::new(sessions, storage, options).run().await
}

pub struct Loader {
    sessions: Arc<dyn SessionFactory>,
    storage: Arc<dyn Storage>,
    options: LoadOptions,
    cancel: CancellationToken,
}

/// Tracks whether the dump being loaded has finished, and waits for the
/// files it has yet to write.
pub(crate) struct DumpWatcher {
    storage: Arc<dyn Storage>,
    timeout: Option<Duration>,
    complete: AtomicBool,
    cancel: CancellationToken,
}

impl DumpWatcher {
    pub(crate) fn new(storage: Arc<dyn Storage>, timeout: Option<Duration>, cancel: CancellationToken) -> Self {
        Self {
            storage,
            timeout,
            complete: AtomicBool::new(false),
            cancel,
        }
    }

    pub(crate) fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub(crate) async fn is_complete(&self) -> Result<bool, LoadError> {
        if self.complete.load(Ordering::Acquire) {
            return Ok(true);
        }
        let done = self.storage.exists(DONE_FILE).await?;
        if done {
            self.complete.store(true, Ordering::Release);
        }
        Ok(done)
    }

    /// Waits until `file` exists. `Ok(false)` when it never will: the dump is
    /// complete without it, or waiting was not requested.
    pub(crate) async fn wait_for(&self, file: &str) -> Result<bool, LoadError> {
        let since = Instant::now();
        loop {
            // Completion is checked first so a file written just before the
            // dump finished is never missed.
            let complete = self.is_complete().await?;
            if self.storage.exists(file).await? {
                return Ok(true);
            }
            let Some(timeout) = self.timeout else {
                return Ok(false);
            };
            if complete {
                return Ok(false);
            }
            if since.elapsed() >= timeout {
                return Err(LoadError::WaitTimeout(timeout));
            }
            self.pause().await?;
        }
    }

    pub(crate) async fn pause(&self) -> Result<(), LoadError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(LoadError::Cancelled),
            _ = tokio::time::sleep(POLL_INTERVAL) => Ok(()),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct LoadCounters {
    pub tables: AtomicU64,
    pub chunks: AtomicU64,
    pub ddl_statements: AtomicU64,
    pub indexes: AtomicU64,
    pub skipped_chunks: AtomicU64,
    pub checksum_mismatches: AtomicU64,
}

/// State shared by every phase and worker of one load.
pub(crate) struct LoadContext {
    pub storage: Arc<dyn Storage>,
    pub options: LoadOptions,
    pub manifest: DumpManifest,
    pub progress: ProgressHandle,
    /// Progress found at start.
    pub state: ProgressState,
    pub metrics: Metrics,
    pub cancel: CancellationToken,
    pub watcher: DumpWatcher,
    pub counters: LoadCounters,
    pub failed: Mutex<Vec<String>>,
}

impl LoadContext {
    /// Runs one tracked task. Failures are recorded and the load carries on.
    pub(crate) async fn track<F>(&self, id: &TaskId, task: F) -> bool
    where
        F: Future<Output = Result<(u64, u64), TaskError>>,
    {
        if let Err(e) = self.progress.started(id).await {
            warn!(task = %id, error = %e, "Failed to record progress");
        }
        match task.await {
            Ok((rows, bytes)) => {
                self.metrics.increment_done();
                if let Err(e) = self.progress.done(id, rows, bytes).await {
                    warn!(task = %id, error = %e, "Failed to record progress");
                }
                true
            }
            Err(e) => {
                self.task_failed(id, &e).await;
                false
            }
        }
    }

    pub(crate) async fn task_failed(&self, id: &TaskId, error: &TaskError) {
        if error.is_cancelled() {
            debug!(task = %id, "Task cancelled");
        } else {
            warn!(task = %id, error = %error, "Task failed");
        }
        self.metrics.increment_failures();
        if let Err(e) = self.progress.failed(id, error).await {
            warn!(task = %id, error = %e, "Failed to record progress");
        }
        self.failed.lock().await.push(id.to_string());
    }

    pub(crate) fn warn(&self) {
        self.metrics.increment_warnings();
    }

    pub(crate) async fn read_json<T: DeserializeOwned>(&self, file: &str) -> Result<T, LoadError> {
        read_json(self.storage.as_ref(), file).await
    }

    /// Reads a definition script, waiting for it while the dump is running.
    pub(crate) async fn read_script(&self, file: &str) -> Result<String, LoadError> {
        if !self.watcher.wait_for(file).await? {
            return Err(StorageError::NotFound(file.to_string()).into());
        }
        Ok(self.storage.read_to_string(file).await?)
    }
}

async fn read_json<T: DeserializeOwned>(storage: &dyn Storage, file: &str) -> Result<T, LoadError> {
    let data = storage.read(file).await?;
    serde_json::from_slice(&data).map_err(|source| LoadError::Metadata {
        file: file.to_string(),
        source,
    })
}

impl Loader {
    pub fn new(sessions: Arc<dyn SessionFactory>, storage: Arc<dyn Storage>, options: LoadOptions) -> Self {
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

    pub async fn run(&self) -> Result<LoadReport, LoadError> {
        self.options.validate()?;
        let options = &self.options;
        let run = RunContext::new("load", self.storage.clone(), &options.storage);
        let storage = run.storage.clone();

        let watcher = DumpWatcher::new(storage.clone(), options.wait_dump_timeout(), self.cancel.clone());
        if !watcher.wait_for(MANIFEST_FILE).await? {
            return Err(LoadError::NoDump(storage.describe()));
        }
        let manifest: DumpManifest = read_json(storage.as_ref(), MANIFEST_FILE).await?;
        if !watcher.is_complete().await? && watcher.timeout().is_none() {
            return Err(LoadError::DumpIncomplete(storage.describe()));
        }

        let recorder = options.dry_run.then(RecordingSessionFactory::new);
        let sessions: Arc<dyn SessionFactory> = match &recorder {
            Some(recorder) => Arc::new(recorder.clone()),
            None => self.sessions.clone(),
        };
        let main = sessions.open().await?;

        let store: Arc<dyn ProgressStore> = match &recorder {
            Some(_) => Arc::new(JsonProgressStore::new(
                Arc::new(MemoryStorage::new(format!("dry-run-{}", run.run_id))),
                "load-progress.json",
            )),
            None => {
                let server_uuid = variable(main.as_ref(), "server_uuid").await?.unwrap_or_default();
                run.progress_store(&options.storage, &load_progress_file(&server_uuid))?
            }
        };
        let (progress, state, tracker) = ProgressHandle::start(store, options.reset_progress).await?;
        let resuming = !state.is_empty();
        if resuming {
            info!(tasks = state.len(), "Resuming interrupted load");
        }

        prepare_session(main.as_ref(), options, &manifest, resuming).await?;
        let mut workers = Vec::with_capacity(options.threads);
        for _ in 0..options.threads {
            let session = sessions.open().await?;
            prepare_session(session.as_ref(), options, &manifest, resuming).await?;
            workers.push(session);
        }

        let reporter = Reporter::start("load", run.metrics.clone(), REPORT_INTERVAL, options.show_progress);
        let ctx = Arc::new(LoadContext {
            storage,
            options: options.clone(),
            manifest,
            progress: progress.clone(),
            state,
            metrics: run.metrics.clone(),
            cancel: self.cancel.clone(),
            watcher,
            counters: LoadCounters::default(),
            failed: Mutex::new(Vec::new()),
        });
        info!(run_id = %run.run_id, workers = workers.len(), dry_run = options.dry_run, "Loading");

        let mut machine = PhaseMachine::new();
        let result = run_phases(&ctx, &mut machine, main.as_ref(), workers).await;
        if let Err(e) = main.close().await {
            debug!(error = %e, "Failed to close session");
        }

        let failed = ctx.failed.lock().await.clone();
        let counters = Arc::into_inner(ctx).map(|c| c.counters).unwrap_or_default();
        let flushed = progress.shutdown(tracker).await;
        reporter.finish().await;

        result?;
        flushed?;
        if self.cancel.is_cancelled() {
            return Err(LoadError::Cancelled);
        }
        if !failed.is_empty() {
            return Err(LoadError::TasksFailed(failed));
        }

        let snapshot = run.metrics.snapshot();
        let report = LoadReport {
            tables: counters.tables.into_inner(),
            chunks: counters.chunks.into_inner(),
            rows: snapshot.rows,
            data_bytes: snapshot.data_bytes,
            ddl_statements: counters.ddl_statements.into_inner(),
            indexes: counters.indexes.into_inner(),
            skipped_chunks: counters.skipped_chunks.into_inner(),
            warnings: snapshot.warnings,
            checksum_mismatches: counters.checksum_mismatches.into_inner(),
            dry_run_statements: recorder.map(|r| r.statements()).unwrap_or_default(),
            elapsed: snapshot.elapsed,
        };
        info!(
            tables = report.tables,
            rows = report.rows,
            warnings = report.warnings,
            "Load completed"
        );
        Ok(report)
    }
}

async fn run_phases(
    ctx: &Arc<LoadContext>,
    machine: &mut PhaseMachine,
    main: &dyn Session,
    workers: Vec<Arc<dyn Session>>,
) -> Result<(), LoadError> {
    let options = &ctx.options;
    let with_ddl = !options.data_only;
    let with_data = !options.ddl_only && !ctx.manifest.options.ddl_only;

    info!(phase = %machine.current(), "Load phase");
    if with_ddl {
        objects::load_schemas(ctx, main).await?;
    }

    enter(machine, LoadPhase::Tables)?;
    let deferred = if with_ddl {
        objects::load_tables(ctx, main, with_data).await?
    } else {
        Default::default()
    };

    enter(machine, LoadPhase::Data)?;
    let workers = if with_data {
        data::load_data(ctx.clone(), main, workers).await?
    } else {
        workers
    };

    enter(machine, LoadPhase::Indexes)?;
    objects::load_indexes(ctx, &workers, deferred).await;
    if with_data {
        objects::analyze_tables(ctx, main).await;
    }
    for session in &workers {
        if let Err(e) = session.close().await {
            debug!(error = %e, "Failed to close session");
        }
    }

    enter(machine, LoadPhase::DependentObjects)?;
    if with_ddl {
        objects::load_dependent_objects(ctx, main).await?;
    }

    enter(machine, LoadPhase::Grants)?;
    if options.load_users {
        objects::load_grants(ctx, main).await?;
    }

    enter(machine, LoadPhase::Done)?;
    Ok(())
}

fn enter(machine: &mut PhaseMachine, phase: LoadPhase) -> Result<(), LoadError> {
    machine.transition(phase)?;
    info!(phase = %phase, "Load phase");
    Ok(())
}

/// Session settings for every connection of a load. Unique checks stay on
/// for a resumed load, which may replay rows already present.
async fn prepare_session(
    session: &dyn Session,
    options: &LoadOptions,
    manifest: &DumpManifest,
    resuming: bool,
) -> Result<(), DbError> {
    let charset = options
        .character_set
        .as_deref()
        .unwrap_or(&manifest.options.character_set);
    session.execute(&format!("SET NAMES {}", quote_string(charset))).await?;
    session.execute("SET SESSION foreign_key_checks = 0").await?;
    if !resuming {
        session.execute("SET SESSION unique_checks = 0").await?;
    }
    if let Some(sql_mode) = &manifest.options.sql_mode {
        session
            .execute(&format!("SET SESSION sql_mode = {}", quote_string(sql_mode)))
            .await?;
    }
    if manifest.options.tz_utc {
        session.execute("SET TIME_ZONE = '+00:00'").await?;
    }
    if options.skip_binlog {
        session.execute("SET SESSION sql_log_bin = 0").await?;
    }
    for sql in &options.session_init_sql {
        session.execute(sql).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use connectors::session::{QueryResult, Row};
    use engine_config::options::{GrantErrors, OnConflict};
    use engine_processing::ddl::render_script;
    use model::{
        core::identifiers::ObjectName,
        dump::{
            dialect::Dialect,
            files::{USERS_FILE, object_ddl_file, schema_ddl_file, table_manifest_file},
            manifest::{ChunkEntry, ColumnInfo, FORMAT_VERSION, ManifestOptions, SchemaEntry, TableManifest, TriggerEntry},
            task::{Compression, ObjectKind, TaskStatus},
        },
        progress::state::ProgressEntry,
    };

    const USERS_DDL: &str = "CREATE TABLE `users` (\n  `id` int NOT NULL,\n  `bio` text,\n  PRIMARY KEY (`id`),\n  FULLTEXT KEY `ft_bio` (`bio`)\n) ENGINE=InnoDB";
    const CHUNK_0: &str = "INSERT INTO `app`.`users` (`id`, `bio`) VALUES ('1', 'hello'),('2', NULL)";
    const CHUNK_1: &str = "INSERT INTO `app`.`users` (`id`, `bio`) VALUES ('3', 'world')";

    fn users() -> ObjectName {
        ObjectName::new("app", "users")
    }

    fn dump_manifest() -> DumpManifest {
        DumpManifest {
            version: FORMAT_VERSION.into(),
            server_version: "8.0.36".into(),
            server_uuid: "source-uuid".into(),
            hostname: "source".into(),
            gtid_executed: String::new(),
            binlog_file: None,
            binlog_position: None,
            begin: Utc::now(),
            end: None,
            options: ManifestOptions {
                consistent: true,
                compatibility: Vec::new(),
                character_set: "utf8mb4".into(),
                sql_mode: Some("NO_ENGINE_SUBSTITUTION".into()),
                tz_utc: true,
                compression: Compression::None,
                dialect: Dialect::tsv(),
                chunking: true,
                bytes_per_chunk: 1 << 20,
                ddl_only: false,
                data_only: false,
                checksum: false,
                dry_run: false,
            },
            schemas: vec![SchemaEntry {
                name: "app".into(),
                tables: vec!["users".into()],
                triggers: vec![TriggerEntry {
                    table: "users".into(),
                    name: "tr_users".into(),
                }],
                ..Default::default()
            }],
            users: Vec::new(),
            complete: false,
        }
    }

    fn chunk(index: usize, rows: u64, data: &str) -> ChunkEntry {
        ChunkEntry {
            index,
            file: format!("app@users@{index}.tsv"),
            rows,
            data_bytes: data.len() as u64,
            file_bytes: data.len() as u64,
            range: None,
            checksum: None,
        }
    }

    async fn write(storage: &MemoryStorage, file: &str, data: &str) {
        storage.write(file, data.as_bytes()).await.unwrap();
    }

    /// Everything but the table metadata and the done marker.
    async fn write_definitions(storage: &MemoryStorage) {
        write(storage, MANIFEST_FILE, &serde_json::to_string(&dump_manifest()).unwrap()).await;
        let schema = ObjectName::schema("app");
        write(
            storage,
            &schema_ddl_file("app"),
            &render_script(ObjectKind::Schema, &schema, &["CREATE DATABASE IF NOT EXISTS `app`".into()]),
        )
        .await;
        write(
            storage,
            &object_ddl_file(ObjectKind::Table, &users()),
            &render_script(ObjectKind::Table, &users(), &[USERS_DDL.into()]),
        )
        .await;
        let trigger = ObjectName::new("app", "tr_users");
        write(
            storage,
            &object_ddl_file(ObjectKind::Trigger, &trigger),
            &render_script(
                ObjectKind::Trigger,
                &trigger,
                &["CREATE TRIGGER `tr_users` BEFORE INSERT ON `users` FOR EACH ROW SET NEW.bio = TRIM(NEW.bio)".into()],
            ),
        )
        .await;
        write(storage, "app@users@0.tsv", "1\thello\n2\t\\N\n").await;
        write(storage, "app@users@1.tsv", "3\tworld\n").await;
    }

    async fn write_table_manifest(storage: &MemoryStorage, has_unique_key: bool) {
        let manifest = TableManifest {
            schema: "app".into(),
            table: "users".into(),
            columns: vec![
                ColumnInfo {
                    name: "id".into(),
                    data_type: "int".into(),
                    nullable: false,
                    generated: false,
                },
                ColumnInfo {
                    name: "bio".into(),
                    data_type: "text".into(),
                    nullable: true,
                    generated: false,
                },
            ],
            index_name: has_unique_key.then(|| "PRIMARY".to_string()),
            index_columns: if has_unique_key { vec!["id".into()] } else { Vec::new() },
            has_unique_key,
            chunking: true,
            compression: Compression::None,
            dialect: Dialect::tsv(),
            chunks: vec![chunk(0, 2, "1\thello\n2\t\\N\n"), chunk(1, 1, "3\tworld\n")],
        };
        write(storage, &table_manifest_file(&users()), &serde_json::to_string(&manifest).unwrap()).await;
    }

    async fn complete_dump(has_unique_key: bool) -> MemoryStorage {
        let storage = MemoryStorage::new("dump");
        write_definitions(&storage).await;
        write_table_manifest(&storage, has_unique_key).await;
        write(&storage, DONE_FILE, "{}").await;
        storage
    }

    fn target(existing: bool) -> RecordingSessionFactory {
        RecordingSessionFactory::with_responder(move |sql| {
            if sql == "SELECT @@server_uuid" {
                Some(Ok(QueryResult::with_rows(&["uuid"], vec![Row::from_strs(&[Some("target-uuid")])])))
            } else if existing && sql.starts_with("SELECT TABLE_SCHEMA, TABLE_NAME FROM information_schema.TABLES") {
                Some(Ok(QueryResult::with_rows(
                    &["TABLE_SCHEMA", "TABLE_NAME"],
                    vec![Row::from_strs(&[Some("app"), Some("users")])],
                )))
            } else {
                None
            }
        })
    }

    fn options() -> LoadOptions {
        LoadOptions {
            threads: 2,
            show_progress: false,
            ..Default::default()
        }
    }

    fn position(statements: &[String], prefix: &str) -> usize {
        statements
            .iter()
            .position(|s| s.starts_with(prefix))
            .unwrap_or_else(|| panic!("no statement starting with {prefix}"))
    }

    #[tokio::test]
    async fn loads_definitions_data_and_triggers_in_phase_order() {
        let storage = complete_dump(true).await;
        let server = target(false);

        let report = load_dump(Arc::new(server.clone()), Arc::new(storage.clone()), options())
            .await
            .unwrap();

        assert_eq!(report.tables, 1);
        assert_eq!(report.chunks, 2);
        assert_eq!(report.rows, 3);
        assert_eq!(report.indexes, 1);

        let statements = server.statements();
        let schema = position(&statements, "CREATE DATABASE IF NOT EXISTS `app`");
        let table = position(&statements, "CREATE TABLE `users`");
        let chunk_0 = position(&statements, CHUNK_0);
        let chunk_1 = position(&statements, CHUNK_1);
        let index = position(&statements, "ALTER TABLE `app`.`users` ADD FULLTEXT KEY `ft_bio` (`bio`)");
        let trigger = position(&statements, "CREATE TRIGGER `tr_users`");
        assert!(schema < table);
        assert!(table < chunk_0.min(chunk_1));
        assert!(chunk_0.max(chunk_1) < index);
        assert!(index < trigger);
        assert!(!statements[table].contains("FULLTEXT"));
        assert!(statements.contains(&"SET SESSION unique_checks = 0".to_string()));
        assert!(statements.contains(&"SET SESSION sql_mode = 'NO_ENGINE_SUBSTITUTION'".to_string()));

        let progress = storage.read_to_string("load-progress.target-uuid.json").await.unwrap();
        assert!(progress.contains("data:app@users"));
    }

    #[tokio::test]
    async fn existing_tables_abort_before_any_definition_runs() {
        let storage = complete_dump(true).await;
        let server = target(true);

        let err = load_dump(Arc::new(server.clone()), Arc::new(storage), options())
            .await
            .unwrap_err();

        assert!(matches!(err, LoadError::ObjectsExist(ref objects) if objects == &["app.users".to_string()]));
        assert!(!server.statements().iter().any(|s| s.starts_with("CREATE TABLE")));
    }

    #[tokio::test]
    async fn existing_triggers_abort_before_any_data_is_loaded() {
        let storage = complete_dump(true).await;
        let server = RecordingSessionFactory::with_responder(|sql| {
            if sql == "SELECT @@server_uuid" {
                Some(Ok(QueryResult::with_rows(&["uuid"], vec![Row::from_strs(&[Some("target-uuid")])])))
            } else if sql.starts_with("SELECT TRIGGER_SCHEMA, TRIGGER_NAME FROM information_schema.TRIGGERS") {
                Some(Ok(QueryResult::with_rows(
                    &["TRIGGER_SCHEMA", "TRIGGER_NAME"],
                    vec![Row::from_strs(&[Some("app"), Some("tr_users")])],
                )))
            } else {
                None
            }
        });

        let err = load_dump(Arc::new(server.clone()), Arc::new(storage), options())
            .await
            .unwrap_err();

        assert!(matches!(err, LoadError::ObjectsExist(ref objects) if objects == &["app.tr_users".to_string()]));
        let statements = server.statements();
        assert!(!statements.iter().any(|s| s.starts_with("CREATE TABLE")));
        assert!(!statements.iter().any(|s| s.starts_with("INSERT")));
    }

    #[tokio::test]
    async fn existing_tables_can_be_replaced() {
        let storage = complete_dump(true).await;
        let server = target(true);
        let options = LoadOptions {
            on_conflict: OnConflict::DropAndRecreate,
            ..options()
        };

        load_dump(Arc::new(server.clone()), Arc::new(storage), options)
            .await
            .unwrap();

        let statements = server.statements();
        let drop = position(&statements, "DROP TABLE IF EXISTS `app`.`users`");
        assert!(drop < position(&statements, "CREATE TABLE `users`"));
    }

    async fn interrupted_load(storage: &MemoryStorage) {
        let store = JsonProgressStore::new(Arc::new(storage.clone()), load_progress_file("target-uuid"));
        let users = users();
        for entry in [
            ProgressEntry::new(TaskId::ddl("schema", &ObjectName::schema("app")), TaskStatus::Done),
            ProgressEntry::new(TaskId::ddl("table", &users), TaskStatus::Done),
            ProgressEntry::new(TaskId::chunk(&users, 0), TaskStatus::InProgress),
            ProgressEntry::new(TaskId::chunk(&users, 1), TaskStatus::Done).with_counts(1, 8),
        ] {
            store.append(&entry).await.unwrap();
        }
    }

    #[tokio::test]
    async fn resumed_load_replays_only_unfinished_chunks() {
        let storage = complete_dump(true).await;
        interrupted_load(&storage).await;
        let server = target(false);

        let report = load_dump(Arc::new(server.clone()), Arc::new(storage), options())
            .await
            .unwrap();

        let statements = server.statements();
        assert_eq!(report.skipped_chunks, 1);
        assert!(!statements.iter().any(|s| s.starts_with("CREATE TABLE")));
        assert!(statements.contains(&CHUNK_0.replacen("INSERT INTO", "INSERT IGNORE INTO", 1)));
        assert!(!statements.iter().any(|s| s.contains("'world'")));
        assert!(!statements.iter().any(|s| s.starts_with("TRUNCATE")));
        assert!(!statements.contains(&"SET SESSION unique_checks = 0".to_string()));
        // Deferred indexes are still added for a table created by the earlier run.
        assert!(statements.iter().any(|s| s.contains("ADD FULLTEXT KEY `ft_bio`")));
    }

    #[tokio::test]
    async fn partly_loaded_table_without_unique_key_starts_over() {
        let storage = complete_dump(false).await;
        interrupted_load(&storage).await;
        let server = target(false);

        let report = load_dump(Arc::new(server.clone()), Arc::new(storage), options())
            .await
            .unwrap();

        let statements = server.statements();
        let truncate = position(&statements, "TRUNCATE TABLE `app`.`users`");
        assert!(truncate < position(&statements, CHUNK_0));
        assert!(truncate < position(&statements, CHUNK_1));
        assert_eq!(report.rows, 3);
        assert_eq!(report.warnings, 1);
    }

    #[tokio::test]
    async fn incomplete_dump_needs_waiting() {
        let storage = MemoryStorage::new("dump");
        write_definitions(&storage).await;

        let err = load_dump(Arc::new(target(false)), Arc::new(storage), options())
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::DumpIncomplete(_)));
    }

    #[tokio::test]
    async fn missing_dump_is_reported() {
        let err = load_dump(
            Arc::new(target(false)),
            Arc::new(MemoryStorage::new("empty")),
            options(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, LoadError::NoDump(_)));
    }

    #[tokio::test]
    async fn load_follows_a_running_dump() {
        let storage = MemoryStorage::new("dump");
        write_definitions(&storage).await;
        let server = target(false);

        let writer = {
            let storage = storage.clone();
            tokio::spawn(async move {
                tokio::time::sleep(POLL_INTERVAL * 2).await;
                write_table_manifest(&storage, true).await;
                write(&storage, DONE_FILE, "{}").await;
            })
        };
        let report = load_dump(
            Arc::new(server.clone()),
            Arc::new(storage),
            options().wait_forever(),
        )
        .await
        .unwrap();
        writer.await.unwrap();

        assert_eq!(report.rows, 3);
        assert!(server.statements().contains(&CHUNK_1.to_string()));
    }

    #[tokio::test]
    async fn stalled_dump_times_out() {
        let storage = MemoryStorage::new("dump");
        write_definitions(&storage).await;
        let options = LoadOptions {
            wait_dump_timeout: Some(0.2),
            ..options()
        };

        let err = load_dump(Arc::new(target(false)), Arc::new(storage), options)
            .await
            .unwrap_err();
        assert!(matches!(err, LoadError::WaitTimeout(_)));
    }

    #[tokio::test]
    async fn dry_run_touches_nothing() {
        let storage = complete_dump(true).await;
        let server = target(false);
        let options = LoadOptions {
            dry_run: true,
            ..options()
        };

        let report = load_dump(Arc::new(server.clone()), Arc::new(storage.clone()), options)
            .await
            .unwrap();

        assert!(server.statements().is_empty());
        assert!(report.dry_run_statements.iter().any(|s| s.starts_with("CREATE TABLE `users`")));
        assert!(!report.dry_run_statements.iter().any(|s| s.starts_with("INSERT")));
        assert_eq!(report.rows, 3);
        assert!(storage.list("load-progress").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn only_selected_accounts_are_restored() {
        let storage = complete_dump(true).await;
        write(
            &storage,
            USERS_FILE,
            "-- Accounts\n\
             -- begin user 'app'@'%'\n\
             CREATE USER IF NOT EXISTS 'app'@'%';\n\
             GRANT SELECT ON `app`.* TO 'app'@'%';\n\
             -- end user 'app'@'%'\n\
             -- begin user 'ops'@'localhost'\n\
             CREATE USER IF NOT EXISTS 'ops'@'localhost';\n\
             -- end user 'ops'@'localhost'\n",
        )
        .await;
        let server = target(false);
        let mut options = LoadOptions {
            load_users: true,
            grant_errors: GrantErrors::Ignore,
            ..options()
        };
        options.filter.exclude_users = vec!["ops".into()];

        load_dump(Arc::new(server.clone()), Arc::new(storage), options)
            .await
            .unwrap();

        let statements = server.statements();
        assert!(statements.contains(&"GRANT SELECT ON `app`.* TO 'app'@'%'".to_string()));
        assert!(!statements.iter().any(|s| s.contains("'ops'")));
    }

    #[tokio::test]
    async fn watcher_sees_files_written_before_completion() {
        let storage = MemoryStorage::new("dump");
        write(&storage, "a.sql", "").await;
        write(&storage, DONE_FILE, "{}").await;
        let watcher = DumpWatcher::new(
            Arc::new(storage),
            Some(Duration::from_secs(1)),
            CancellationToken::new(),
        );
        assert!(watcher.wait_for("a.sql").await.unwrap());
        assert!(!watcher.wait_for("b.sql").await.unwrap());
    }
}
