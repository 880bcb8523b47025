use crate::{context::RunContext, error::DumpError};
use connectors::{session::Session, storage::Storage};
use engine_config::options::{ExportOptions, Options};
use engine_processing::dump::ChunkDumper;
use model::{
    core::identifiers::{ObjectName, TaskId},
    dump::task::{ChunkTask, Compression, TaskStatus},
};
use planner::{TablePlan, catalog, error::PlanError};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportReport {
    pub file: String,
    pub rows: u64,
    pub data_bytes: u64,
    pub file_bytes: u64,
}

/// Writes the rows of one table into a single data file. No definitions and
/// no metadata are written.
pub async fn export_table(
    session: &dyn Session,
    table: &ObjectName,
    storage: Arc<dyn Storage>,
    file: &str,
    options: &ExportOptions,
) -> Result<ExportReport, DumpError> {
    options.validate()?;
    let dialect = options.dialect.resolve()?;
    let ctx = RunContext::new("export", storage, &options.storage);

    let exists = catalog::tables(session, &table.schema)
        .await?
        .iter()
        .any(|t| t.name == table.name);
    if !exists {
        return Err(PlanError::MissingTable(table.to_string()).into());
    }

    let plan = TablePlan {
        name: table.clone(),
        columns: catalog::columns(session, table).await?,
        index: None,
        has_primary_key: false,
        has_unique_key: false,
        engine: None,
        estimated_rows: 0,
        estimated_bytes: 0,
        chunk_count: 1,
        where_clause: options.where_clause.clone(),
    };
    let compression = match options.compression {
        Compression::None => Compression::from_file_name(file),
        explicit => explicit,
    };
    let task = ChunkTask {
        id: TaskId::chunk(table, 0),
        table: table.clone(),
        index: 0,
        estimated_bytes: 0,
        compression,
        file: file.to_string(),
        range: None,
        order_by: Vec::new(),
        status: TaskStatus::Pending,
    };

    let entry = ChunkDumper::new(session, ctx.storage.as_ref(), &dialect)
        .dump(&plan, &task)
        .await?;
    info!(table = %table, file, rows = entry.rows, compression = %compression, "Table exported");
    Ok(ExportReport {
        file: entry.file,
        rows: entry.rows,
        data_bytes: entry.data_bytes,
        file_bytes: entry.file_bytes,
    })
}
