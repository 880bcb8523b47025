use connectors::error::{DbError, StorageError};
use model::dump::dialect::DialectError;
use thiserror::Error;

/// Failure of a single unit of work. Recorded against the task; the run
/// carries on with the remaining tasks.
#[derive(Debug, Error)]
pub enum TaskError {
    #[error("Database error: {0}")]
    Db(#[from] DbError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Compression failed for '{file}': {source}")]
    Compression {
        file: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed data in '{file}': {source}")]
    Dialect {
        file: String,
        #[source]
        source: DialectError,
    },

    #[error("Row in '{file}' has {found} fields, expected {expected}")]
    ColumnCount {
        file: String,
        expected: usize,
        found: usize,
    },

    #[error("Could not capture definition of {kind} {object}: {reason}")]
    Ddl {
        kind: String,
        object: String,
        reason: String,
    },

    #[error("Table {table} has no primary key")]
    MissingPrimaryKey { table: String },

    #[error("Corrupt binlog segment '{file}': {reason}")]
    Segment { file: String, reason: String },

    #[error("Task cancelled")]
    Cancelled,
}

impl TaskError {
    pub fn segment(file: impl Into<String>, reason: impl ToString) -> Self {
        TaskError::Segment {
            file: file.into(),
            reason: reason.to_string(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, TaskError::Cancelled | TaskError::Db(DbError::Cancelled))
    }
}
