use crate::{
    metrics::Metrics,
    retry::{RetryDisposition, RetryPolicy},
};
use async_trait::async_trait;
use connectors::{
    error::StorageError,
    storage::{ObjectInfo, ObjectReader, ObjectWriter, Storage},
};
use std::sync::Arc;
use tracing::warn;

pub fn classify_storage_error(err: &StorageError) -> RetryDisposition {
    if err.is_transient() {
        RetryDisposition::Retry
    } else {
        RetryDisposition::Stop
    }
}

/// Wraps a storage so every operation is retried on transient failures.
/// Streamed writes are not retried piecewise: a failed upload fails its task,
/// which is redone from scratch.
pub struct RetryingStorage {
    inner: Arc<dyn Storage>,
    policy: RetryPolicy,
    metrics: Option<Metrics>,
}

impl RetryingStorage {
    pub fn new(inner: Arc<dyn Storage>, policy: RetryPolicy) -> Self {
        RetryingStorage {
            inner,
            policy,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    async fn retry<'a, T, F, Fut>(&'a self, op_name: &str, name: &str, op: F) -> Result<T, StorageError>
    where
        F: Fn(&'a dyn Storage) -> Fut,
        Fut: Future<Output = Result<T, StorageError>> + 'a,
    {
        let mut attempts = 0u64;
        let result = self
            .policy
            .run(
                || {
                    attempts += 1;
                    op(self.inner.as_ref())
                },
                classify_storage_error,
            )
            .await;

        if attempts > 1 {
            if let Some(metrics) = &self.metrics {
                metrics.increment_retries(attempts - 1);
            }
            warn!(
                operation = op_name,
                object = name,
                attempts,
                ok = result.is_ok(),
                "Storage operation needed retries"
            );
        }
        result.map_err(|e| e.into_inner())
    }
}

#[async_trait]
impl Storage for RetryingStorage {
    fn describe(&self) -> String {
        self.inner.describe()
    }

    async fn exists(&self, name: &str) -> Result<bool, StorageError> {
        self.retry("exists", name, |s| s.exists(name)).await
    }

    async fn read(&self, name: &str) -> Result<Vec<u8>, StorageError> {
        self.retry("read", name, |s| s.read(name)).await
    }

    async fn reader(&self, name: &str) -> Result<Box<dyn ObjectReader>, StorageError> {
        self.retry("reader", name, |s| s.reader(name)).await
    }

    async fn write(&self, name: &str, data: &[u8]) -> Result<(), StorageError> {
        self.retry("write", name, |s| s.write(name, data)).await
    }

    async fn append(&self, name: &str, data: &[u8]) -> Result<(), StorageError> {
        self.retry("append", name, |s| s.append(name, data)).await
    }

    async fn create(&self, name: &str) -> Result<Box<dyn ObjectWriter>, StorageError> {
        self.retry("create", name, |s| s.create(name)).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError> {
        self.retry("list", prefix, |s| s.list(prefix)).await
    }

    async fn remove(&self, name: &str) -> Result<(), StorageError> {
        self.retry("remove", name, |s| s.remove(name)).await
    }
}
