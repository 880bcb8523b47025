//! Consistent snapshot across all dump workers.
//!
//! A read lock is taken on one session, binary log coordinates are read
//! while it is held, every worker opens a `CONSISTENT SNAPSHOT`
//! transaction, and only then may the lock be released.

use crate::error::ConsistencyError;
use connectors::{
    error::DbError,
    session::{Session, variable},
};
use engine_config::settings::ConsistencyConfig;
use model::{binlog::BinlogPosition, core::identifiers::ObjectName};
use std::{collections::HashSet, fmt, sync::Arc};
use tokio::{runtime::Handle, time};
use tracing::{debug, info, warn};

/// Grant tables locked together with the dumped tables when the global read
/// lock is not available, so accounts stay consistent with the data.
const GRANT_TABLES: [&str; 8] = [
    "columns_priv",
    "db",
    "default_roles",
    "global_grants",
    "procs_priv",
    "proxies_priv",
    "role_edges",
    "tables_priv",
];
const SYNTAX_ERROR: u16 = 1064;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// `FLUSH TABLES WITH READ LOCK`
    Flush,
    /// `LOCK TABLES ... READ` on every dumped table.
    LockTables,
    None,
}

impl fmt::Display for LockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LockKind::Flush => "flush",
            LockKind::LockTables => "lock_tables",
            LockKind::None => "none",
        })
    }
}

/// Replication coordinates of the snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerCoordinates {
    pub gtid_executed: String,
    pub binlog: Option<BinlogPosition>,
}

pub async fn read_coordinates(session: &dyn Session) -> Result<ServerCoordinates, DbError> {
    let gtid_executed = variable(session, "GLOBAL.gtid_executed")
        .await?
        .unwrap_or_default()
        .replace(['\n', ' '], "");

    // 8.4 dropped SHOW MASTER STATUS.
    let status = match session.execute("SHOW MASTER STATUS").await {
        Ok(result) => result,
        Err(e) if e.code() == Some(SYNTAX_ERROR) => session.execute("SHOW BINARY LOG STATUS").await?,
        Err(e) => return Err(e),
    };
    let binlog = status.first().and_then(|row| {
        Some(BinlogPosition {
            file: row.get_string(0)?,
            position: row.get_u64(1)?,
        })
    });
    Ok(ServerCoordinates {
        gtid_executed,
        binlog,
    })
}

pub fn lock_tables_sql(tables: &[ObjectName]) -> String {
    let mut seen = HashSet::new();
    let targets: Vec<String> = tables
        .iter()
        .cloned()
        .chain(GRANT_TABLES.iter().map(|t| ObjectName::new("mysql", *t)))
        .chain(std::iter::once(ObjectName::new("mysql", "user")))
        .filter(|t| seen.insert(t.clone()))
        .map(|t| format!("{} READ", t.quoted()))
        .collect();
    format!("LOCK TABLES {}", targets.join(", "))
}

/// Lock state of a snapshot. Dropping a handle that still holds a lock
/// unlocks in the background.
pub struct SnapshotHandle {
    lock: Option<Arc<dyn Session>>,
    kind: LockKind,
    started: Vec<bool>,
    coordinates: ServerCoordinates,
}

impl SnapshotHandle {
    pub fn kind(&self) -> LockKind {
        self.kind
    }

    pub fn coordinates(&self) -> &ServerCoordinates {
        &self.coordinates
    }

    /// Per worker, whether its snapshot transaction is open.
    pub fn started(&self) -> &[bool] {
        &self.started
    }

    pub fn all_started(&self) -> bool {
        self.started.iter().all(|s| *s)
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    /// Releases the read lock. Worker transactions stay open.
    pub async fn release(mut self) -> Result<(), DbError> {
        if let Some(session) = self.lock.take() {
            session.execute("UNLOCK TABLES").await?;
            debug!(lock = %self.kind, "Read lock released");
        }
        Ok(())
    }

    async fn unlock_after_failure(&mut self) {
        if let Some(session) = self.lock.take()
            && let Err(e) = session.execute("UNLOCK TABLES").await
        {
            warn!(error = %e, "Failed to release read lock");
        }
    }
}

impl Drop for SnapshotHandle {
    fn drop(&mut self) {
        let Some(session) = self.lock.take() else {
            return;
        };
        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move {
                    if let Err(e) = session.execute("UNLOCK TABLES").await {
                        warn!(error = %e, "Failed to release read lock");
                    }
                });
            }
            Err(_) => warn!("Read lock left to be released by the server when the session closes"),
        }
    }
}

async fn acquire(session: &dyn Session, tables: &[ObjectName]) -> Result<LockKind, ConsistencyError> {
    match session.execute("FLUSH TABLES WITH READ LOCK").await {
        Ok(_) => Ok(LockKind::Flush),
        Err(e) if e.is_access_denied() => {
            warn!(error = %e, "Global read lock not permitted, locking the dumped tables instead");
            session
                .execute(&lock_tables_sql(tables))
                .await
                .map_err(ConsistencyError::Lock)?;
            Ok(LockKind::LockTables)
        }
        Err(e) => Err(ConsistencyError::Lock(e)),
    }
}

async fn start_transaction(session: &dyn Session) -> Result<(), DbError> {
    session
        .execute("SET SESSION TRANSACTION ISOLATION LEVEL REPEATABLE READ")
        .await?;
    session
        .execute("START TRANSACTION WITH CONSISTENT SNAPSHOT")
        .await?;
    Ok(())
}

/// Establishes the snapshot. With consistency disabled no lock is taken and
/// workers run in autocommit mode; coordinates are read when the account is
/// allowed to, and left empty otherwise.
pub async fn begin(
    lock_session: Arc<dyn Session>,
    workers: &[Arc<dyn Session>],
    tables: &[ObjectName],
    config: &ConsistencyConfig,
) -> Result<SnapshotHandle, ConsistencyError> {
    if !config.consistent {
        let coordinates = match read_coordinates(lock_session.as_ref()).await {
            Ok(coordinates) => coordinates,
            Err(e) => {
                warn!(error = %e, "Could not read binary log coordinates, the dump will not record them");
                ServerCoordinates::default()
            }
        };
        return Ok(SnapshotHandle {
            lock: None,
            kind: LockKind::None,
            started: vec![false; workers.len()],
            coordinates,
        });
    }

    let kind = acquire(lock_session.as_ref(), tables).await?;
    let mut handle = SnapshotHandle {
        lock: Some(lock_session.clone()),
        kind,
        started: vec![false; workers.len()],
        coordinates: ServerCoordinates::default(),
    };

    match read_coordinates(lock_session.as_ref()).await {
        Ok(coordinates) => handle.coordinates = coordinates,
        Err(e) => {
            handle.unlock_after_failure().await;
            return Err(ConsistencyError::Coordinates(e));
        }
    }

    let start_all = futures::future::try_join_all(workers.iter().enumerate().map(|(worker, session)| async move {
        start_transaction(session.as_ref())
            .await
            .map(|_| worker)
            .map_err(|source| ConsistencyError::Worker { worker, source })
    }));
    let timeout = config.snapshot_timeout();
    let outcome = match time::timeout(timeout, start_all).await {
        Ok(result) => result,
        Err(_) => Err(ConsistencyError::Timeout(timeout)),
    };
    match outcome {
        Ok(started) => {
            for worker in started {
                handle.started[worker] = true;
            }
        }
        Err(e) => {
            handle.unlock_after_failure().await;
            return Err(e);
        }
    }

    info!(
        lock = %kind,
        workers = workers.len(),
        gtid_executed = %handle.coordinates.gtid_executed,
        "Consistent snapshot established"
    );
    Ok(handle)
}
