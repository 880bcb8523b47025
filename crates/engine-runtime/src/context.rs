use connectors::storage::Storage;
use engine_config::settings::{ProgressLocation, StorageConfig};
use engine_core::{
    error::ProgressError,
    metrics::Metrics,
    progress::{JsonProgressStore, ProgressStore, SledProgressStore},
    storage::RetryingStorage,
};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Per-run plumbing shared by dump, load and binlog operations.
pub struct RunContext {
    pub run_id: Uuid,
    pub storage: Arc<dyn Storage>,
    pub metrics: Metrics,
}

impl RunContext {
    /// Wraps `storage` in the configured retry policy.
    pub fn new(operation: &'static str, storage: Arc<dyn Storage>, config: &StorageConfig) -> Self {
        let run_id = Uuid::new_v4();
        let metrics = Metrics::new();
        info!(%run_id, operation, storage = %storage.describe(), "Starting");
        let storage: Arc<dyn Storage> = Arc::new(
            RetryingStorage::new(storage, config.retry.policy()).with_metrics(metrics.clone()),
        );
        Self {
            run_id,
            storage,
            metrics,
        }
    }

    pub fn progress_store(
        &self,
        config: &StorageConfig,
        default_file: &str,
    ) -> Result<Arc<dyn ProgressStore>, ProgressError> {
        open_progress_store(self.storage.clone(), config, default_file)
    }
}

/// Opens the progress log at the configured location.
///
/// A local sled database may hold progress for several dumps; each one gets
/// its own keyspace derived from the storage location and file name.
pub fn open_progress_store(
    storage: Arc<dyn Storage>,
    config: &StorageConfig,
    default_file: &str,
) -> Result<Arc<dyn ProgressStore>, ProgressError> {
    Ok(match &config.progress {
        ProgressLocation::Storage => Arc::new(JsonProgressStore::new(storage, default_file)),
        ProgressLocation::File { name } => Arc::new(JsonProgressStore::new(storage, name.clone())),
        ProgressLocation::Local { path } => {
            let scope = progress_scope(&storage.describe(), default_file);
            Arc::new(SledProgressStore::open(path, &scope)?)
        }
    })
}

fn progress_scope(location: &str, file: &str) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(location.as_bytes());
    hasher.update(b"/");
    hasher.update(file.as_bytes());
    hasher.finalize().to_hex()[..16].to_string()
}
