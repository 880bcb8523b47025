use connectors::error::{DbError, StorageError};
use engine_config::error::ConfigError;
use engine_core::error::ProgressError;
use engine_processing::error::TaskError;
use model::core::gtid::GtidError;
use planner::error::PlanError;
use std::time::Duration;
use thiserror::Error;

/// Common error type for all actors in the engine.
#[derive(Debug, Error)]
pub enum ActorError {
    #[error("Mailbox closed")]
    MailboxClosed,

    #[error("Actor dropped the reply channel")]
    NoReply,
}

/// The consistent snapshot could not be established. Never retried; the
/// read lock is released before this is returned.
#[derive(Debug, Error)]
pub enum ConsistencyError {
    #[error("Failed to acquire a read lock: {0}")]
    Lock(#[source] DbError),

    #[error("Failed to read binary log coordinates: {0}")]
    Coordinates(#[source] DbError),

    #[error("Worker {worker} could not start its snapshot transaction: {source}")]
    Worker {
        worker: usize,
        #[source]
        source: DbError,
    },

    #[error("Workers did not start their snapshot transactions within {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Error)]
pub enum DumpError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("Database error: {0}")]
    Db(#[from] DbError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Progress error: {0}")]
    Progress(#[from] ProgressError),

    #[error("Consistency error: {0}")]
    Consistency(#[from] ConsistencyError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("Failed to encode manifest: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("{0} already contains a completed dump")]
    AlreadyComplete(String),

    #[error("{0} already contains a dump with no progress to resume from")]
    NotEmpty(String),

    #[error("{} task(s) failed: {}", .0.len(), .0.join(", "))]
    TasksFailed(Vec<String>),

    #[error("Dump cancelled")]
    Cancelled,

    #[error("Worker panicked: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Db(#[from] DbError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Progress error: {0}")]
    Progress(#[from] ProgressError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("Invalid dump metadata in '{file}': {source}")]
    Metadata {
        file: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("No dump found in {0}")]
    NoDump(String),

    #[error("Dump in {0} is incomplete and waiting for it was not requested")]
    DumpIncomplete(String),

    #[error("Timed out after {0:?} waiting for the dump to make progress")]
    WaitTimeout(Duration),

    #[error("Objects already exist in the target: {}", .0.join(", "))]
    ObjectsExist(Vec<String>),

    #[error("Failed to restore account {account}: {source}")]
    Grant {
        account: String,
        #[source]
        source: DbError,
    },

    #[error("Invalid load phase transition from {from} to {to}")]
    Phase { from: String, to: String },

    #[error("{} task(s) failed: {}", .0.len(), .0.join(", "))]
    TasksFailed(Vec<String>),

    #[error("Load cancelled")]
    Cancelled,

    #[error("Worker panicked: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

#[derive(Debug, Error)]
pub enum BinlogError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Db(#[from] DbError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Progress error: {0}")]
    Progress(#[from] ProgressError),

    #[error(transparent)]
    Task(#[from] TaskError),

    #[error("Invalid GTID set: {0}")]
    Gtid(#[from] GtidError),

    #[error("Invalid binlog metadata in '{file}': {source}")]
    Metadata {
        file: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Failed to encode binlog metadata: {0}")]
    Manifest(#[from] serde_json::Error),

    #[error("No starting point: pass 'since', 'startFrom' or dump into a location holding a previous dump")]
    NoStartPoint,

    #[error("Binary logs were dumped from server {expected}, this server is {found}")]
    ServerMismatch { expected: String, found: String },

    #[error("DDL in the binary log at {position}: {statement}")]
    DdlInRange { position: String, statement: String },

    #[error("GTID gap: {missing} missing before segment {sequence}")]
    GtidGap { sequence: u64, missing: String },

    #[error("Binlog source error: {0}")]
    Source(String),

    #[error("No binlog dump found in {0}")]
    NoBinlogDump(String),

    #[error("Binlog operation cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum CopyError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Copy failed while dumping: {0}")]
    Dump(#[from] DumpError),

    #[error("Copy failed while loading: {0}")]
    Load(#[from] LoadError),
}
