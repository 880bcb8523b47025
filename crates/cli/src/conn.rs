use crate::error::CliError;
use connectors::{
    session::{SessionFactory, mysql::MySqlSessionFactory},
    storage::StorageRegistry,
};
use model::dump::files::{BINLOG_MANIFEST_FILE, DONE_FILE, MANIFEST_FILE};
use tracing::{error, info};

/// Connects to the server and returns its version.
pub async fn ping_server(url: &str) -> Result<String, CliError> {
    let factory = MySqlSessionFactory::from_url(url)?;
    info!("Pinging MySQL at '{}'", factory.describe());

    let session = factory.open().await.map_err(|e| {
        error!("MySQL connection to '{}' failed: {}", factory.describe(), e);
        e
    })?;
    let version = session
        .execute("SELECT VERSION()")
        .await?
        .first()
        .and_then(|row| row.get_string(0))
        .ok_or_else(|| {
            let msg = format!("MySQL ping to '{}' returned no result", factory.describe());
            error!("{}", msg);
            CliError::Unexpected(msg)
        })?;
    session.close().await?;

    info!("MySQL ping to '{}' succeeded, server {}", factory.describe(), version);
    Ok(version)
}

/// Opens a storage location and reports what kind of dump it holds.
pub async fn inspect_storage(url: &str) -> Result<String, CliError> {
    let storage = StorageRegistry::new().open(url).await?;
    let state = if storage.exists(DONE_FILE).await? {
        "complete dump"
    } else if storage.exists(MANIFEST_FILE).await? {
        "incomplete dump"
    } else {
        "no dump"
    };
    let binlogs = if storage.exists(BINLOG_MANIFEST_FILE).await? {
        ", with binary logs"
    } else {
        ""
    };

    info!("Storage '{}' holds {}{}", storage.describe(), state, binlogs);
    Ok(format!("{state}{binlogs}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn inspects_memory_storage() {
        assert_eq!(inspect_storage("memory://inspect").await.unwrap(), "no dump");
    }

    #[tokio::test]
    async fn rejects_bad_server_url() {
        let err = ping_server("postgres://nope").await.unwrap_err();
        assert!(matches!(err, CliError::Db(_)));
    }
}
