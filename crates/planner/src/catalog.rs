//! Reads object metadata from `information_schema`.

use crate::error::PlanError;
use connectors::session::{Session, query_row};
use model::{
    core::{identifiers::ObjectName, utils::quote_string},
    dump::{manifest::ColumnInfo, task::ObjectKind},
};
use tracing::debug;

const QUERY_SERVER_INFO_SQL: &str = include_str!("sql/server_info.sql");
const QUERY_SCHEMAS_SQL: &str = include_str!("sql/schemas.sql");
const QUERY_TABLES_SQL: &str = include_str!("sql/tables.sql");
const QUERY_COLUMNS_SQL: &str = include_str!("sql/columns.sql");
const QUERY_INDEXES_SQL: &str = include_str!("sql/indexes.sql");
const QUERY_ROUTINES_SQL: &str = include_str!("sql/routines.sql");
const QUERY_EVENTS_SQL: &str = include_str!("sql/events.sql");
const QUERY_TRIGGERS_SQL: &str = include_str!("sql/triggers.sql");
const QUERY_ACCOUNTS_SQL: &str = include_str!("sql/accounts.sql");

pub const SYSTEM_SCHEMAS: [&str; 5] = [
    "mysql",
    "sys",
    "information_schema",
    "performance_schema",
    "ndbinfo",
];

/// Accounts created by the server itself.
const SYSTEM_ACCOUNTS: [&str; 3] = ["mysql.sys", "mysql.session", "mysql.infoschema"];

pub fn is_system_schema(schema: &str) -> bool {
    SYSTEM_SCHEMAS.iter().any(|s| s.eq_ignore_ascii_case(schema))
}

fn bind(sql: &str, schema: &str, table: Option<&str>) -> String {
    let sql = sql.replace("{schema}", &quote_string(schema));
    match table {
        Some(table) => sql.replace("{table}", &quote_string(table)),
        None => sql,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerInfo {
    pub version: String,
    pub server_uuid: String,
    pub hostname: String,
    pub sql_mode: Option<String>,
}

pub async fn server_info(session: &dyn Session) -> Result<ServerInfo, PlanError> {
    let row = query_row(session, QUERY_SERVER_INFO_SQL)
        .await?
        .ok_or_else(|| PlanError::Catalog("server variables".into()))?;
    Ok(ServerInfo {
        version: row.get_string(0).unwrap_or_default(),
        server_uuid: row.get_string(1).unwrap_or_default(),
        hostname: row.get_string(2).unwrap_or_default(),
        sql_mode: row.get_string(3),
    })
}

pub async fn schemas(session: &dyn Session) -> Result<Vec<String>, PlanError> {
    let result = session.execute(QUERY_SCHEMAS_SQL).await?;
    Ok(result.rows.iter().filter_map(|r| r.get_string(0)).collect())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableType {
    BaseTable,
    View,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableStatus {
    pub name: String,
    pub kind: TableType,
    pub engine: Option<String>,
    pub rows: u64,
    pub avg_row_length: u64,
    pub data_length: u64,
}

impl TableStatus {
    /// Size estimate used for chunking and scheduling.
    pub fn estimated_bytes(&self) -> u64 {
        if self.data_length > 0 {
            self.data_length
        } else {
            self.rows.saturating_mul(self.avg_row_length)
        }
    }
}

pub async fn tables(session: &dyn Session, schema: &str) -> Result<Vec<TableStatus>, PlanError> {
    let result = session
        .execute(&bind(QUERY_TABLES_SQL, schema, None))
        .await?;
    let mut tables = Vec::with_capacity(result.rows.len());
    for row in &result.rows {
        let name = row
            .get_string(0)
            .ok_or_else(|| PlanError::Catalog(format!("table without name in '{schema}'")))?;
        let kind = match row.get_str(1) {
            Some("VIEW") => TableType::View,
            Some("BASE TABLE") => TableType::BaseTable,
            // SYSTEM VIEW and friends are not dumped.
            other => {
                debug!(schema, table = %name, kind = ?other, "Skipping object of unsupported type");
                continue;
            }
        };
        tables.push(TableStatus {
            name,
            kind,
            engine: row.get_string(2),
            rows: row.get_u64(3).unwrap_or(0),
            avg_row_length: row.get_u64(4).unwrap_or(0),
            data_length: row.get_u64(5).unwrap_or(0),
        });
    }
    Ok(tables)
}

pub async fn columns(session: &dyn Session, table: &ObjectName) -> Result<Vec<ColumnInfo>, PlanError> {
    let result = session
        .execute(&bind(QUERY_COLUMNS_SQL, &table.schema, Some(&table.name)))
        .await?;
    Ok(result
        .rows
        .iter()
        .filter_map(|row| {
            Some(ColumnInfo {
                name: row.get_string(0)?,
                data_type: row.get_string(1).unwrap_or_default().to_ascii_lowercase(),
                nullable: row.get_str(2) == Some("YES"),
                generated: row
                    .get_str(3)
                    .is_some_and(|extra| extra.to_ascii_uppercase().contains("GENERATED")),
            })
        })
        .collect())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexInfo {
    pub name: String,
    pub unique: bool,
    pub columns: Vec<String>,
    /// Any of the columns accepts NULL.
    pub nullable: bool,
    pub kind: String,
}

impl IndexInfo {
    pub fn is_primary(&self) -> bool {
        self.name == "PRIMARY"
    }
}

pub async fn indexes(session: &dyn Session, table: &ObjectName) -> Result<Vec<IndexInfo>, PlanError> {
    let result = session
        .execute(&bind(QUERY_INDEXES_SQL, &table.schema, Some(&table.name)))
        .await?;
    let mut indexes: Vec<IndexInfo> = Vec::new();
    for row in &result.rows {
        let (Some(name), Some(column)) = (row.get_string(0), row.get_string(2)) else {
            // Functional key parts have no column name.
            continue;
        };
        let nullable = row.get_str(3) == Some("YES");
        match indexes.last_mut() {
            Some(last) if last.name == name => {
                last.columns.push(column);
                last.nullable |= nullable;
            }
            _ => indexes.push(IndexInfo {
                name,
                unique: row.get_u64(1) == Some(0),
                columns: vec![column],
                nullable,
                kind: row.get_string(4).unwrap_or_else(|| "BTREE".into()),
            }),
        }
    }
    Ok(indexes)
}

pub async fn routines(session: &dyn Session, schema: &str) -> Result<Vec<(String, ObjectKind)>, PlanError> {
    let result = session
        .execute(&bind(QUERY_ROUTINES_SQL, schema, None))
        .await?;
    Ok(result
        .rows
        .iter()
        .filter_map(|row| {
            let kind = match row.get_str(1)? {
                "FUNCTION" => ObjectKind::Function,
                _ => ObjectKind::Procedure,
            };
            Some((row.get_string(0)?, kind))
        })
        .collect())
}

pub async fn events(session: &dyn Session, schema: &str) -> Result<Vec<String>, PlanError> {
    let result = session
        .execute(&bind(QUERY_EVENTS_SQL, schema, None))
        .await?;
    Ok(result.rows.iter().filter_map(|r| r.get_string(0)).collect())
}

/// `(table, trigger)` pairs in firing order.
pub async fn triggers(session: &dyn Session, schema: &str) -> Result<Vec<(String, String)>, PlanError> {
    let result = session
        .execute(&bind(QUERY_TRIGGERS_SQL, schema, None))
        .await?;
    Ok(result
        .rows
        .iter()
        .filter_map(|r| Some((r.get_string(0)?, r.get_string(1)?)))
        .collect())
}

/// User accounts as `(user, host)`, without the server's own accounts.
pub async fn accounts(session: &dyn Session) -> Result<Vec<(String, String)>, PlanError> {
    let result = session.execute(QUERY_ACCOUNTS_SQL).await?;
    Ok(result
        .rows
        .iter()
        .filter_map(|r| Some((r.get_string(0)?, r.get_string(1)?)))
        .filter(|(user, host)| !(SYSTEM_ACCOUNTS.contains(&user.as_str()) && host == "localhost"))
        .collect())
}

pub fn account_name(user: &str, host: &str) -> String {
    format!("{}@{}", quote_string(user), quote_string(host))
}
