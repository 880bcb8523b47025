use crate::error::TaskError;
use connectors::error::DbError;
use engine_core::{retry::RetryDisposition, storage::classify_storage_error};

pub fn classify_db_error(err: &DbError) -> RetryDisposition {
    if err.is_transient() {
        RetryDisposition::Retry
    } else {
        RetryDisposition::Stop
    }
}

/// Whole-task retries: a chunk that failed on a dropped connection or a
/// deadlock is redone from its first row.
pub fn classify_task_error(err: &TaskError) -> RetryDisposition {
    match err {
        TaskError::Db(db_err) => classify_db_error(db_err),
        TaskError::Storage(storage_err) => classify_storage_error(storage_err),
        TaskError::Compression { .. }
        | TaskError::Dialect { .. }
        | TaskError::ColumnCount { .. }
        | TaskError::Ddl { .. }
        | TaskError::MissingPrimaryKey { .. }
        | TaskError::Segment { .. }
        | TaskError::Cancelled => RetryDisposition::Stop,
    }
}
