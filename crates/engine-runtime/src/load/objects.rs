//! Definition phases of a load: schemas, tables and views before the data,
//! then deferred indexes, stored programs, triggers and accounts after it.

use super::LoadContext;
use crate::error::LoadError;
use connectors::{
    error::{DbError, codes},
    session::Session,
};
use engine_config::{
    filter::AccountPattern,
    options::{AnalyzeTables, DeferIndexes, GrantErrors, OnConflict},
};
use engine_processing::{
    ddl::{add_indexes_statements, parse_users_script, split_deferred_indexes, split_statements},
    dump::cancellable,
    error::TaskError,
};
use futures::future::join_all;
use model::{
    core::{
        identifiers::{ObjectName, TaskId},
        utils::{quote_identifier, quote_string},
    },
    dump::{
        files::{USERS_FILE, object_ddl_file, schema_ddl_file},
        task::ObjectKind,
    },
};
use std::{
    collections::{BTreeMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
};
use tracing::{debug, info, warn};

/// Secondary indexes taken out of `CREATE TABLE`, per table.
pub(super) type Deferred = BTreeMap<ObjectName, Vec<String>>;

fn is_create_table(statement: &str) -> bool {
    statement
        .get(..12)
        .is_some_and(|head| head.eq_ignore_ascii_case("CREATE TABLE"))
}

/// Executes statements in order, after switching to `schema`.
async fn execute_script(
    ctx: &LoadContext,
    session: &dyn Session,
    schema: Option<&str>,
    statements: &[String],
) -> Result<(u64, u64), TaskError> {
    if let Some(schema) = schema {
        cancellable(&ctx.cancel, session.execute(&format!("USE {}", quote_identifier(schema)))).await?;
    }
    let mut bytes = 0u64;
    for statement in statements {
        cancellable(&ctx.cancel, session.execute(statement)).await?;
        ctx.counters.ddl_statements.fetch_add(1, Ordering::Relaxed);
        bytes += statement.len() as u64;
    }
    Ok((0, bytes))
}

pub(super) async fn load_schemas(ctx: &LoadContext, session: &dyn Session) -> Result<(), LoadError> {
    for schema in &ctx.manifest.schemas {
        if !ctx.options.filter.schema_included(&schema.name) {
            continue;
        }
        let id = TaskId::ddl(ObjectKind::Schema.as_str(), &ObjectName::schema(schema.name.clone()));
        if ctx.state.is_done(&id) {
            continue;
        }
        let script = ctx.read_script(&schema_ddl_file(&schema.name)).await?;
        let statements = split_statements(&script);
        ctx.track(&id, execute_script(ctx, session, None, &statements)).await;
    }
    Ok(())
}

/// Quoted names of the dumped schemas the filter keeps.
fn dumped_schemas(ctx: &LoadContext) -> Vec<String> {
    ctx.manifest
        .schemas
        .iter()
        .filter(|s| ctx.options.filter.schema_included(&s.name))
        .map(|s| quote_string(&s.name))
        .collect()
}

/// Tables and views already present in the target, for the schemas of the
/// dump.
async fn existing_objects(ctx: &LoadContext, session: &dyn Session) -> Result<HashSet<ObjectName>, DbError> {
    let schemas = dumped_schemas(ctx);
    if schemas.is_empty() {
        return Ok(HashSet::new());
    }
    let result = session
        .execute(&format!(
            "SELECT TABLE_SCHEMA, TABLE_NAME FROM information_schema.TABLES WHERE TABLE_SCHEMA IN ({})",
            schemas.join(", ")
        ))
        .await?;
    Ok(result
        .rows
        .iter()
        .filter_map(|r| Some(ObjectName::new(r.get_string(0)?, r.get_string(1)?)))
        .collect())
}

/// Routines, events and triggers of the dump that pass the filter.
fn dependent_objects(ctx: &LoadContext) -> Vec<(ObjectKind, ObjectName)> {
    let filter = &ctx.options.filter;
    let mut objects = Vec::new();
    for schema in &ctx.manifest.schemas {
        if !filter.schema_included(&schema.name) {
            continue;
        }
        for routine in &schema.routines {
            if filter.routine_included(&schema.name, &routine.name) {
                objects.push((routine.kind, ObjectName::new(schema.name.clone(), routine.name.clone())));
            }
        }
        for event in &schema.events {
            if filter.event_included(&schema.name, event) {
                objects.push((ObjectKind::Event, ObjectName::new(schema.name.clone(), event.clone())));
            }
        }
        for trigger in &schema.triggers {
            let table = ObjectName::new(schema.name.clone(), trigger.table.clone());
            if filter.table_included(&table) && filter.trigger_included(&schema.name, &trigger.table, &trigger.name) {
                objects.push((ObjectKind::Trigger, ObjectName::new(schema.name.clone(), trigger.name.clone())));
            }
        }
    }
    objects
}

/// Routines, events and triggers already present in the target, for the
/// schemas of the dump.
async fn existing_programs(
    ctx: &LoadContext,
    session: &dyn Session,
) -> Result<HashSet<(ObjectKind, ObjectName)>, DbError> {
    let schemas = dumped_schemas(ctx);
    if schemas.is_empty() {
        return Ok(HashSet::new());
    }
    let schemas = schemas.join(", ");
    let mut existing = HashSet::new();

    let routines = session
        .execute(&format!(
            "SELECT ROUTINE_SCHEMA, ROUTINE_NAME, ROUTINE_TYPE FROM information_schema.ROUTINES \
             WHERE ROUTINE_SCHEMA IN ({schemas})"
        ))
        .await?;
    for row in &routines.rows {
        let kind = match row.get_str(2) {
            Some(t) if t.eq_ignore_ascii_case("FUNCTION") => ObjectKind::Function,
            _ => ObjectKind::Procedure,
        };
        if let (Some(schema), Some(name)) = (row.get_string(0), row.get_string(1)) {
            existing.insert((kind, ObjectName::new(schema, name)));
        }
    }

    for (kind, query) in [
        (
            ObjectKind::Event,
            format!("SELECT EVENT_SCHEMA, EVENT_NAME FROM information_schema.EVENTS WHERE EVENT_SCHEMA IN ({schemas})"),
        ),
        (
            ObjectKind::Trigger,
            format!(
                "SELECT TRIGGER_SCHEMA, TRIGGER_NAME FROM information_schema.TRIGGERS WHERE TRIGGER_SCHEMA IN ({schemas})"
            ),
        ),
    ] {
        let result = session.execute(&query).await?;
        existing.extend(
            result
                .rows
                .iter()
                .filter_map(|r| Some((kind, ObjectName::new(r.get_string(0)?, r.get_string(1)?)))),
        );
    }
    Ok(existing)
}

/// Creates tables, then views. Returns the indexes held back for after the
/// data phase.
pub(super) async fn load_tables(
    ctx: &LoadContext,
    session: &dyn Session,
    with_data: bool,
) -> Result<Deferred, LoadError> {
    let filter = &ctx.options.filter;
    let tables: Vec<ObjectName> = ctx.manifest.tables().filter(|t| filter.table_included(t)).collect();
    let views: Vec<ObjectName> = ctx.manifest.views().filter(|v| filter.table_included(v)).collect();

    let existing = existing_objects(ctx, session).await?;
    let mut conflicts: Vec<String> = tables
        .iter()
        .map(|t| (ObjectKind::Table, t))
        .chain(views.iter().map(|v| (ObjectKind::View, v)))
        .filter(|(kind, name)| existing.contains(name) && !ctx.state.is_done(&TaskId::ddl(kind.as_str(), name)))
        .map(|(_, name)| name.to_string())
        .collect();
    let programs = dependent_objects(ctx);
    if !programs.is_empty() {
        let present = existing_programs(ctx, session).await?;
        conflicts.extend(
            programs
                .iter()
                .filter(|(kind, name)| {
                    present.contains(&(*kind, name.clone()))
                        && !ctx.state.is_done(&TaskId::ddl(kind.as_str(), name))
                })
                .map(|(_, name)| name.to_string()),
        );
    }
    if !conflicts.is_empty() {
        match ctx.options.on_conflict {
            OnConflict::Abort => return Err(LoadError::ObjectsExist(conflicts)),
            OnConflict::DropAndRecreate => {
                info!(objects = conflicts.len(), "Replacing objects that already exist")
            }
            OnConflict::Ignore => {
                warn!(objects = %conflicts.join(", "), "Keeping objects that already exist");
                ctx.warn();
            }
        }
    }

    // Deferring only pays off when rows are loaded after the table is created.
    let mode = if with_data {
        ctx.options.defer_table_indexes
    } else {
        DeferIndexes::Off
    };

    let mut deferred = Deferred::new();
    for table in &tables {
        let id = TaskId::ddl(ObjectKind::Table.as_str(), table);
        let script = ctx.read_script(&object_ddl_file(ObjectKind::Table, table)).await?;
        let mut indexes = Vec::new();
        let mut statements: Vec<String> = split_statements(&script)
            .into_iter()
            .map(|statement| {
                if !is_create_table(&statement) {
                    return statement;
                }
                let split = split_deferred_indexes(&statement, mode);
                indexes = split.indexes;
                split.create
            })
            .collect();

        if ctx.state.is_done(&id) {
            if !indexes.is_empty() {
                deferred.insert(table.clone(), indexes);
            }
            continue;
        }
        if existing.contains(table) {
            match ctx.options.on_conflict {
                OnConflict::Ignore => {
                    debug!(table = %table, "Table exists, definition skipped");
                    continue;
                }
                _ => statements.insert(0, format!("DROP TABLE IF EXISTS {}", table.quoted())),
            }
        }
        if ctx
            .track(&id, execute_script(ctx, session, Some(&table.schema), &statements))
            .await
            && !indexes.is_empty()
        {
            deferred.insert(table.clone(), indexes);
        }
    }

    load_views(ctx, session, &views, &existing).await?;
    Ok(deferred)
}

/// Views may select from other views, so they are created in passes until a
/// pass makes no progress.
async fn load_views(
    ctx: &LoadContext,
    session: &dyn Session,
    views: &[ObjectName],
    existing: &HashSet<ObjectName>,
) -> Result<(), LoadError> {
    let mut pending = Vec::new();
    for view in views {
        let id = TaskId::ddl(ObjectKind::View.as_str(), view);
        if ctx.state.is_done(&id) {
            continue;
        }
        if existing.contains(view) && ctx.options.on_conflict == OnConflict::Ignore {
            continue;
        }
        let script = ctx.read_script(&object_ddl_file(ObjectKind::View, view)).await?;
        let mut statements = split_statements(&script);
        if existing.contains(view) {
            statements.insert(0, format!("DROP VIEW IF EXISTS {}", view.quoted()));
        }
        if let Err(e) = ctx.progress.started(&id).await {
            warn!(task = %id, error = %e, "Failed to record progress");
        }
        pending.push((view, id, statements, None));
    }

    let mut pass = 0;
    while !pending.is_empty() {
        pass += 1;
        let before = pending.len();
        let mut retry = Vec::new();
        for (view, id, statements, _) in pending {
            match execute_script(ctx, session, Some(&view.schema), &statements).await {
                Ok((_, bytes)) => {
                    ctx.metrics.increment_done();
                    if let Err(e) = ctx.progress.done(&id, 0, bytes).await {
                        warn!(task = %id, error = %e, "Failed to record progress");
                    }
                }
                Err(e) if e.is_cancelled() => return Err(LoadError::Cancelled),
                Err(e) => retry.push((view, id, statements, Some(e))),
            }
        }
        if retry.len() == before {
            for (_, id, _, error) in &retry {
                if let Some(error) = error {
                    ctx.task_failed(id, error).await;
                }
            }
            break;
        }
        debug!(pass, remaining = retry.len(), "Retrying views");
        pending = retry;
    }
    Ok(())
}

/// Adds the held-back indexes, one table per session at a time.
pub(super) async fn load_indexes(ctx: &LoadContext, sessions: &[Arc<dyn Session>], deferred: Deferred) {
    let jobs: Vec<(ObjectName, Vec<String>)> = deferred
        .into_iter()
        .filter(|(table, _)| !ctx.state.is_done(&TaskId::indexes(table)))
        .collect();
    if jobs.is_empty() {
        return;
    }
    info!(tables = jobs.len(), "Adding deferred indexes");
    let cursor = AtomicUsize::new(0);
    join_all(sessions.iter().map(|session| async {
        loop {
            if ctx.cancel.is_cancelled() {
                break;
            }
            let Some((table, indexes)) = jobs.get(cursor.fetch_add(1, Ordering::Relaxed)) else {
                break;
            };
            let statements = add_indexes_statements(table, indexes);
            let id = TaskId::indexes(table);
            if ctx
                .track(&id, execute_script(ctx, session.as_ref(), None, &statements))
                .await
            {
                ctx.counters.indexes.fetch_add(indexes.len() as u64, Ordering::Relaxed);
            }
        }
    }))
    .await;
}

/// Refreshes statistics of the loaded tables. Failures only warn.
pub(super) async fn analyze_tables(ctx: &LoadContext, session: &dyn Session) {
    let tables: Vec<ObjectName> = ctx
        .manifest
        .tables()
        .filter(|t| ctx.options.filter.table_included(t))
        .collect();
    match ctx.options.analyze_tables {
        AnalyzeTables::Off => {}
        AnalyzeTables::On => {
            for table in &tables {
                if let Err(e) = session.execute(&format!("ANALYZE TABLE {}", table.quoted())).await {
                    warn!(table = %table, error = %e, "Failed to analyze table");
                    ctx.warn();
                }
            }
        }
        AnalyzeTables::Histogram => {
            for table in &tables {
                if let Err(e) = update_histograms(session, table).await {
                    warn!(table = %table, error = %e, "Failed to update histograms");
                    ctx.warn();
                }
            }
        }
    }
}

/// Rebuilds the histograms the target already knows for `table`.
async fn update_histograms(session: &dyn Session, table: &ObjectName) -> Result<(), DbError> {
    let result = session
        .execute(&format!(
            "SELECT COLUMN_NAME, JSON_EXTRACT(HISTOGRAM, '$.\"number-of-buckets-specified\"') \
             FROM information_schema.COLUMN_STATISTICS WHERE SCHEMA_NAME = {} AND TABLE_NAME = {}",
            quote_string(&table.schema),
            quote_string(&table.name)
        ))
        .await?;
    for row in &result.rows {
        let Some(column) = row.get_str(0) else {
            continue;
        };
        let buckets = row.get_u64(1).unwrap_or(100);
        session
            .execute(&format!(
                "ANALYZE TABLE {} UPDATE HISTOGRAM ON {} WITH {buckets} BUCKETS",
                table.quoted(),
                quote_identifier(column)
            ))
            .await?;
    }
    Ok(())
}

fn already_exists(error: &TaskError) -> bool {
    matches!(
        error,
        TaskError::Db(e) if matches!(
            e.code(),
            Some(codes::ER_SP_ALREADY_EXISTS | codes::ER_TRG_ALREADY_EXISTS | codes::ER_EVT_ALREADY_EXISTS)
        )
    )
}

fn drop_statement(kind: ObjectKind, object: &ObjectName) -> String {
    format!("DROP {} IF EXISTS {}", kind.as_str().to_ascii_uppercase(), object.quoted())
}

/// Routines, events and triggers, once the tables hold their data.
pub(super) async fn load_dependent_objects(ctx: &LoadContext, session: &dyn Session) -> Result<(), LoadError> {
    let objects = dependent_objects(ctx);
    for (kind, object) in objects {
        let id = TaskId::ddl(kind.as_str(), &object);
        if ctx.state.is_done(&id) {
            continue;
        }
        let script = ctx.read_script(&object_ddl_file(kind, &object)).await?;
        let mut statements = split_statements(&script);
        if ctx.options.on_conflict == OnConflict::DropAndRecreate {
            statements.insert(0, drop_statement(kind, &object));
        }
        let ignore = ctx.options.on_conflict == OnConflict::Ignore;
        ctx.track(&id, async {
            match execute_script(ctx, session, Some(&object.schema), &statements).await {
                Err(e) if ignore && already_exists(&e) => {
                    debug!(kind = %kind, object = %object, "Object exists, definition skipped");
                    Ok((0, 0))
                }
                other => other,
            }
        })
        .await;
    }
    Ok(())
}

/// Recreates accounts and their grants from the users script.
pub(super) async fn load_grants(ctx: &LoadContext, session: &dyn Session) -> Result<(), LoadError> {
    let id = TaskId::grants();
    if ctx.state.is_done(&id) {
        return Ok(());
    }
    if !ctx.watcher.wait_for(USERS_FILE).await? {
        info!("Dump holds no accounts");
        return Ok(());
    }
    let script = ctx.storage.read_to_string(USERS_FILE).await?;
    if let Err(e) = ctx.progress.started(&id).await {
        warn!(task = %id, error = %e, "Failed to record progress");
    }

    let mut restored = 0u64;
    for account in parse_users_script(&script) {
        let included = AccountPattern::parse(&account.account).is_some_and(|p| {
            ctx.options
                .filter
                .user_included(&p.user, p.host.as_deref().unwrap_or("%"))
        });
        if !included {
            continue;
        }
        let mut failure = None;
        for statement in &account.statements {
            if let Err(e) = session.execute(statement).await {
                failure = Some(e);
                break;
            }
            ctx.counters.ddl_statements.fetch_add(1, Ordering::Relaxed);
        }
        let Some(error) = failure else {
            restored += 1;
            continue;
        };
        match ctx.options.grant_errors {
            GrantErrors::Abort => {
                if let Err(e) = ctx.progress.failed(&id, &error).await {
                    warn!(task = %id, error = %e, "Failed to record progress");
                }
                return Err(LoadError::Grant {
                    account: account.account,
                    source: error,
                });
            }
            GrantErrors::DropAccount => {
                warn!(account = %account.account, error = %error, "Dropping account whose grants failed");
                ctx.warn();
                if let Err(e) = session.execute(&format!("DROP USER IF EXISTS {}", account.account)).await {
                    warn!(account = %account.account, error = %e, "Failed to drop account");
                }
            }
            GrantErrors::Ignore => {
                warn!(account = %account.account, error = %error, "Grant failed");
                ctx.warn();
            }
        }
    }

    ctx.metrics.increment_done();
    if let Err(e) = ctx.progress.done(&id, restored, 0).await {
        warn!(task = %id, error = %e, "Failed to record progress");
    }
    info!(accounts = restored, "Accounts restored");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_table_is_recognised_case_insensitively() {
        assert!(is_create_table("CREATE TABLE `t` (\n  `id` int\n)"));
        assert!(is_create_table("create table t (id int)"));
        assert!(!is_create_table("CREATE VIEW v AS SELECT 1"));
        assert!(!is_create_table("DROP"));
    }

    #[test]
    fn drop_statement_names_the_object_kind() {
        let object = ObjectName::new("app", "tr_audit");
        assert_eq!(
            drop_statement(ObjectKind::Trigger, &object),
            "DROP TRIGGER IF EXISTS `app`.`tr_audit`"
        );
        assert_eq!(
            drop_statement(ObjectKind::Procedure, &ObjectName::new("app", "p")),
            "DROP PROCEDURE IF EXISTS `app`.`p`"
        );
    }

    #[test]
    fn existing_stored_programs_are_detected() {
        assert!(already_exists(&TaskError::Db(DbError::server(
            codes::ER_TRG_ALREADY_EXISTS,
            "Trigger already exists"
        ))));
        assert!(!already_exists(&TaskError::Db(DbError::server(
            codes::ER_NO_SUCH_TABLE,
            "no table"
        ))));
        assert!(!already_exists(&TaskError::Cancelled));
    }
}
