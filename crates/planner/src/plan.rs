use crate::{
    catalog::{self, TableStatus, TableType, account_name, is_system_schema},
    chunker::{ChunkIndex, Chunker, choose_index},
    error::PlanError,
};
use chrono::Utc;
use connectors::session::Session;
use engine_config::options::{DumpOptions, DumpScope, Options};
use model::{
    core::identifiers::{ObjectName, TaskId},
    dump::{
        dialect::Dialect,
        files::{data_file, object_ddl_file},
        manifest::{
            ColumnInfo, DumpManifest, FORMAT_VERSION, ManifestOptions, RoutineEntry, SchemaEntry,
            TableManifest, TriggerEntry,
        },
        task::{ChunkRange, ChunkTask, DdlTask, ObjectKind, TaskStatus},
    },
};
use std::collections::HashSet;
use tracing::{debug, info};

/// Everything the dumper needs to know about one table.
#[derive(Debug, Clone, PartialEq)]
pub struct TablePlan {
    pub name: ObjectName,
    pub columns: Vec<ColumnInfo>,
    pub index: Option<ChunkIndex>,
    pub has_primary_key: bool,
    pub has_unique_key: bool,
    pub engine: Option<String>,
    pub estimated_rows: u64,
    pub estimated_bytes: u64,
    pub chunk_count: usize,
    pub where_clause: Option<String>,
}

impl TablePlan {
    /// Columns that are written to data files, generated ones excluded.
    pub fn data_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| !c.generated)
            .map(|c| c.name.as_str())
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct DumpPlan {
    pub manifest: DumpManifest,
    pub dialect: Dialect,
    pub ddl_tasks: Vec<DdlTask>,
    pub chunk_tasks: Vec<ChunkTask>,
    pub tables: Vec<TablePlan>,
    /// `(user, host)` accounts captured into the users file.
    pub accounts: Vec<(String, String)>,
}

impl DumpPlan {
    pub fn table(&self, name: &ObjectName) -> Option<&TablePlan> {
        self.tables.iter().find(|t| &t.name == name)
    }

    /// Tables and views that have to be locked when the global read lock
    /// is not available.
    pub fn lock_targets(&self) -> Vec<ObjectName> {
        self.manifest
            .tables()
            .chain(self.manifest.views())
            .collect()
    }

    pub fn chunks_of<'a>(&'a self, table: &'a ObjectName) -> impl Iterator<Item = &'a ChunkTask> + 'a {
        self.chunk_tasks.iter().filter(move |c| &c.table == table)
    }

    /// Table manifest with no chunk entries yet.
    pub fn table_manifest(&self, table: &TablePlan) -> TableManifest {
        TableManifest {
            schema: table.name.schema.clone(),
            table: table.name.name.clone(),
            columns: table.columns.clone(),
            index_name: table.index.as_ref().map(|i| i.name.clone()),
            index_columns: table
                .index
                .as_ref()
                .map(|i| i.columns.clone())
                .unwrap_or_default(),
            has_unique_key: table.has_unique_key,
            chunking: self.manifest.options.chunking && table.index.is_some(),
            compression: self.manifest.options.compression,
            dialect: self.dialect.clone(),
            chunks: Vec::new(),
        }
    }

    pub fn total_bytes(&self) -> u64 {
        self.tables.iter().map(|t| t.estimated_bytes).sum()
    }
}

/// Introspects the server and turns a dump request into tasks.
pub async fn plan(
    session: &dyn Session,
    scope: &DumpScope,
    options: &DumpOptions,
) -> Result<DumpPlan, PlanError> {
    scope.validate()?;
    options.validate()?;
    let dialect = options.dialect.resolve()?;
    let filter = &options.filter;

    let server = catalog::server_info(session).await?;
    let existing = catalog::schemas(session).await?;
    let selected = select_schemas(scope, options, &existing)?;

    let mut schema_entries = Vec::with_capacity(selected.len());
    let mut ddl_tasks = Vec::new();
    let mut chunk_tasks = Vec::new();
    let mut tables = Vec::new();
    let with_ddl = !options.data_only;
    let with_data = !options.ddl_only;

    for schema in &selected {
        let statuses = catalog::tables(session, schema).await?;
        let objects = select_objects(scope, options, schema, &statuses)?;

        let mut entry = SchemaEntry {
            name: schema.clone(),
            ..Default::default()
        };
        if with_ddl {
            ddl_tasks.push(ddl_task(ObjectKind::Schema, ObjectName::schema(schema.clone()), None));
        }

        for status in objects {
            let name = ObjectName::new(schema.clone(), status.name.clone());
            match status.kind {
                TableType::View => {
                    entry.views.push(status.name.clone());
                    if with_ddl {
                        ddl_tasks.push(ddl_task(ObjectKind::View, name, None));
                    }
                }
                TableType::BaseTable => {
                    entry.tables.push(status.name.clone());
                    if with_ddl {
                        ddl_tasks.push(ddl_task(ObjectKind::Table, name.clone(), None));
                    }
                    let mut table = plan_table(session, options, &name, status).await?;
                    if with_data {
                        let chunks = plan_chunks(session, options, &dialect, &table, status).await?;
                        table.chunk_count = chunks.len();
                        chunk_tasks.extend(chunks);
                    }
                    tables.push(table);
                }
            }
        }

        // Stored programs belong to the schema, so a table-scoped dump leaves them out.
        if !matches!(scope, DumpScope::Tables { .. }) {
            for (routine, kind) in catalog::routines(session, schema).await? {
                if !filter.routine_included(schema, &routine) {
                    continue;
                }
                if with_ddl {
                    ddl_tasks.push(ddl_task(kind, ObjectName::new(schema.clone(), routine.clone()), None));
                }
                entry.routines.push(RoutineEntry { name: routine, kind });
            }
            for event in catalog::events(session, schema).await? {
                if !filter.event_included(schema, &event) {
                    continue;
                }
                if with_ddl {
                    ddl_tasks.push(ddl_task(ObjectKind::Event, ObjectName::new(schema.clone(), event.clone()), None));
                }
                entry.events.push(event);
            }
        }

        for (table, trigger) in catalog::triggers(session, schema).await? {
            if !entry.tables.contains(&table) || !filter.trigger_included(schema, &table, &trigger) {
                continue;
            }
            if with_ddl {
                ddl_tasks.push(ddl_task(
                    ObjectKind::Trigger,
                    ObjectName::new(schema.clone(), trigger.clone()),
                    Some(table.clone()),
                ));
            }
            entry.triggers.push(TriggerEntry { table, name: trigger });
        }

        schema_entries.push(entry);
    }

    let accounts = if scope.is_instance() && filter.users && with_ddl {
        catalog::accounts(session)
            .await?
            .into_iter()
            .filter(|(user, host)| filter.user_included(user, host))
            .collect()
    } else {
        Vec::new()
    };
    if !accounts.is_empty() {
        ddl_tasks.push(ddl_task(ObjectKind::Users, users_object(), None));
    }

    let manifest = DumpManifest {
        version: FORMAT_VERSION.to_string(),
        server_version: server.version,
        server_uuid: server.server_uuid,
        hostname: server.hostname,
        gtid_executed: String::new(),
        binlog_file: None,
        binlog_position: None,
        begin: Utc::now(),
        end: None,
        options: ManifestOptions {
            consistent: options.consistency.consistent,
            compatibility: options.compatibility.names(),
            character_set: options.character_set.clone(),
            sql_mode: server.sql_mode,
            tz_utc: options.tz_utc,
            compression: options.compression,
            dialect: dialect.clone(),
            chunking: options.chunking.chunking,
            bytes_per_chunk: options.chunking.bytes_per_chunk,
            ddl_only: options.ddl_only,
            data_only: options.data_only,
            checksum: options.checksum,
            dry_run: options.dry_run,
        },
        schemas: schema_entries,
        users: accounts.iter().map(|(u, h)| account_name(u, h)).collect(),
        complete: false,
    };

    info!(
        schemas = manifest.schemas.len(),
        tables = tables.len(),
        ddl_tasks = ddl_tasks.len(),
        chunk_tasks = chunk_tasks.len(),
        "Dump planned"
    );

    Ok(DumpPlan {
        manifest,
        dialect,
        ddl_tasks,
        chunk_tasks,
        tables,
        accounts,
    })
}

/// Placeholder object the users DDL task is keyed by.
pub fn users_object() -> ObjectName {
    ObjectName::new("mysql", "user")
}

fn ddl_task(kind: ObjectKind, object: ObjectName, table: Option<String>) -> DdlTask {
    DdlTask {
        id: TaskId::ddl(kind.as_str(), &object),
        file: object_ddl_file(kind, &object),
        kind,
        object,
        table,
        status: TaskStatus::Pending,
    }
}

fn select_schemas(
    scope: &DumpScope,
    options: &DumpOptions,
    existing: &[String],
) -> Result<Vec<String>, PlanError> {
    let filter = &options.filter;
    for name in &filter.include_schemas {
        if !existing.contains(name) {
            debug!(schema = %name, "Included schema does not exist, ignoring");
        }
    }

    match scope {
        DumpScope::Instance => Ok(existing
            .iter()
            .filter(|s| !is_system_schema(s) && filter.schema_included(s))
            .cloned()
            .collect()),
        DumpScope::Schemas(list) => {
            let mut selected = Vec::with_capacity(list.len());
            for schema in list {
                if !existing.contains(schema) {
                    return Err(PlanError::MissingSchema(schema.clone()));
                }
                if !selected.contains(schema) && !filter.exclude_schemas.contains(schema) {
                    selected.push(schema.clone());
                }
            }
            Ok(selected)
        }
        DumpScope::Tables { schema, .. } => {
            if !existing.contains(schema) {
                return Err(PlanError::MissingSchema(schema.clone()));
            }
            Ok(vec![schema.clone()])
        }
    }
}

fn select_objects<'a>(
    scope: &DumpScope,
    options: &DumpOptions,
    schema: &str,
    statuses: &'a [TableStatus],
) -> Result<Vec<&'a TableStatus>, PlanError> {
    let filter = &options.filter;
    let selected = match scope {
        DumpScope::Tables { tables, all: false, .. } => {
            let mut selected = Vec::with_capacity(tables.len());
            let mut seen = HashSet::new();
            for table in tables {
                let status = statuses
                    .iter()
                    .find(|s| &s.name == table)
                    .ok_or_else(|| PlanError::MissingTable(ObjectName::new(schema, table.clone()).to_string()))?;
                if seen.insert(table) {
                    selected.push(status);
                }
            }
            selected
        }
        _ => statuses
            .iter()
            .filter(|s| filter.table_included(&ObjectName::new(schema, s.name.clone())))
            .collect(),
    };

    for entry in &filter.include_tables {
        if let Some(name) = ObjectName::parse(entry)
            && name.schema == schema
            && !statuses.iter().any(|s| s.name == name.name)
        {
            debug!(table = %name, "Included table does not exist, ignoring");
        }
    }
    Ok(selected)
}

async fn plan_table(
    session: &dyn Session,
    options: &DumpOptions,
    name: &ObjectName,
    status: &TableStatus,
) -> Result<TablePlan, PlanError> {
    let columns = catalog::columns(session, name).await?;
    let indexes = catalog::indexes(session, name).await?;
    let index = choose_index(&indexes, &columns);

    Ok(TablePlan {
        name: name.clone(),
        has_primary_key: indexes.iter().any(|i| i.is_primary()),
        has_unique_key: index.is_some(),
        index,
        columns,
        engine: status.engine.clone(),
        estimated_rows: status.rows,
        estimated_bytes: status.estimated_bytes(),
        chunk_count: 1,
        where_clause: options.where_clause(name).map(str::to_string),
    })
}

async fn plan_chunks(
    session: &dyn Session,
    options: &DumpOptions,
    dialect: &Dialect,
    table: &TablePlan,
    status: &TableStatus,
) -> Result<Vec<ChunkTask>, PlanError> {
    let ranges: Vec<Option<ChunkRange>> = match (&table.index, options.chunking.chunking) {
        (Some(index), true) => Chunker::new(session, options.chunking.bytes_per_chunk)
            .ranges(&table.name, index, status, table.where_clause.as_deref())
            .await?
            .into_iter()
            .map(|r| r.predicate().map(|_| r))
            .collect(),
        _ => {
            debug!(table = %table.name, "Table is not chunked");
            vec![None]
        }
    };

    let count = ranges.len() as u64;
    let order_by = table
        .index
        .as_ref()
        .map(|i| i.columns.clone())
        .unwrap_or_default();

    Ok(ranges
        .into_iter()
        .enumerate()
        .map(|(index, range)| ChunkTask {
            id: TaskId::chunk(&table.name, index),
            table: table.name.clone(),
            index,
            estimated_bytes: table.estimated_bytes / count,
            compression: options.compression,
            file: data_file(&table.name, index, &dialect.extension, options.compression),
            range,
            order_by: order_by.clone(),
            status: TaskStatus::Pending,
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use connectors::session::{QueryResult, Row, recording::RecordingSession};

    /// Catalog of one schema `shop` with a chunkable `orders`, an unkeyed
    /// `log`, a view and a trigger on `orders`.
    fn shop() -> RecordingSession {
        RecordingSession::with_responder(|sql| {
            let rows = |cols: &[&str], rows: &[&[Option<&str>]]| {
                Some(Ok(QueryResult::with_rows(
                    cols,
                    rows.iter().map(|r| Row::from_strs(r)).collect(),
                )))
            };
            if sql.starts_with("SELECT @@version") {
                rows(&["v", "u", "h", "m"], &[&[Some("8.0.36"), Some("uuid-1"), Some("db1"), Some("ANSI_QUOTES")]])
            } else if sql.contains("information_schema.SCHEMATA") {
                rows(&["s"], &[&[Some("mysql")], &[Some("shop")], &[Some("sys")]])
            } else if sql.contains("information_schema.TABLES") {
                rows(
                    &["n", "t", "e", "r", "a", "d"],
                    &[
                        &[Some("log"), Some("BASE TABLE"), Some("InnoDB"), Some("10"), Some("10"), Some("100")],
                        &[Some("orders"), Some("BASE TABLE"), Some("InnoDB"), Some("1000"), Some("100"), Some("1310720")],
                        &[Some("recent"), Some("VIEW"), None, None, None, None],
                    ],
                )
            } else if sql.contains("information_schema.COLUMNS") {
                rows(&["c", "t", "n", "e"], &[&[Some("id"), Some("INT"), Some("NO"), Some("")]])
            } else if sql.contains("information_schema.STATISTICS") && sql.contains("'orders'") {
                rows(&["i", "nu", "c", "n", "k"], &[&[Some("PRIMARY"), Some("0"), Some("id"), Some(""), Some("BTREE")]])
            } else if sql.starts_with("SELECT MIN(") {
                rows(&["min", "max"], &[&[Some("1"), Some("1000")]])
            } else if sql.contains("information_schema.TRIGGERS") {
                rows(&["t", "n"], &[&[Some("orders"), Some("orders_bi")]])
            } else if sql.contains("information_schema.ROUTINES") {
                rows(&["n", "t"], &[&[Some("total"), Some("FUNCTION")]])
            } else if sql.contains("mysql.user") {
                rows(&["u", "h"], &[&[Some("app"), Some("%")], &[Some("mysql.sys"), Some("localhost")]])
            } else {
                None
            }
        })
    }

    fn options(bytes_per_chunk: u64) -> DumpOptions {
        let mut options = DumpOptions::default();
        options.chunking.bytes_per_chunk = bytes_per_chunk;
        options
    }

    #[tokio::test]
    async fn plans_instance_dump() {
        let session = shop();
        let plan = plan(&session, &DumpScope::Instance, &options(2 << 20))
            .await
            .unwrap();

        assert_eq!(plan.manifest.schemas.len(), 1);
        let schema = &plan.manifest.schemas[0];
        assert_eq!(schema.tables, vec!["log", "orders"]);
        assert_eq!(schema.views, vec!["recent"]);
        assert_eq!(schema.triggers.len(), 1);
        assert_eq!(schema.routines[0].kind, ObjectKind::Function);
        assert_eq!(plan.manifest.users, vec!["'app'@'%'"]);
        assert_eq!(plan.manifest.options.sql_mode.as_deref(), Some("ANSI_QUOTES"));
        assert!(!plan.manifest.complete);

        // orders is below one chunk, log has no key.
        assert_eq!(plan.chunk_tasks.len(), 2);
        assert!(plan.chunk_tasks.iter().all(|c| c.range.is_none()));
        assert_eq!(plan.chunk_tasks[1].file, "shop@orders@0.tsv.zst");

        let kinds: Vec<_> = plan.ddl_tasks.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ObjectKind::Schema,
                ObjectKind::Table,
                ObjectKind::Table,
                ObjectKind::View,
                ObjectKind::Function,
                ObjectKind::Trigger,
                ObjectKind::Users,
            ]
        );
        assert_eq!(plan.lock_targets().len(), 3);
    }

    #[tokio::test]
    async fn splits_large_keyed_tables() {
        let session = shop();
        let scope = DumpScope::Tables {
            schema: "shop".into(),
            tables: vec!["orders".into()],
            all: false,
        };
        let plan = plan(&session, &scope, &options(128 * 1024)).await.unwrap();

        assert_eq!(plan.chunk_tasks.len(), 10);
        assert_eq!(plan.chunk_tasks[9].id.as_str(), "chunk:shop@orders@9");
        assert!(plan.chunk_tasks[0].range.is_some());
        assert!(plan.ddl_tasks.iter().all(|t| t.kind != ObjectKind::Function));
        assert!(plan.accounts.is_empty());
        assert!(plan.table(&ObjectName::new("shop", "orders")).unwrap().has_primary_key);
    }

    #[tokio::test]
    async fn rejects_missing_objects() {
        let session = shop();
        let err = plan(&session, &DumpScope::Schemas(vec!["nope".into()]), &options(1 << 20))
            .await
            .unwrap_err();
        assert!(matches!(err, PlanError::MissingSchema(s) if s == "nope"));

        let scope = DumpScope::Tables {
            schema: "shop".into(),
            tables: vec!["ghost".into()],
            all: false,
        };
        let err = plan(&session, &scope, &options(1 << 20)).await.unwrap_err();
        assert!(matches!(err, PlanError::MissingTable(t) if t == "shop.ghost"));

        let scope = DumpScope::Tables {
            schema: "shop".into(),
            tables: vec![],
            all: false,
        };
        assert!(matches!(
            plan(&session, &scope, &options(1 << 20)).await,
            Err(PlanError::Config(_))
        ));
    }

    #[tokio::test]
    async fn ddl_only_plans_no_chunks() {
        let session = shop();
        let options = DumpOptions {
            ddl_only: true,
            ..options(1 << 20)
        };
        let plan = plan(&session, &DumpScope::Schemas(vec!["shop".into()]), &options)
            .await
            .unwrap();
        assert!(plan.chunk_tasks.is_empty());
        assert_eq!(plan.tables.len(), 2);
    }
}
