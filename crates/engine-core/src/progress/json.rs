use super::ProgressStore;
use crate::error::ProgressError;
use async_trait::async_trait;
use connectors::{error::StorageError, storage::Storage};
use model::progress::state::ProgressEntry;
use std::sync::Arc;
use tracing::warn;

/// Progress kept as JSON lines in a file next to the dump.
pub struct JsonProgressStore {
    storage: Arc<dyn Storage>,
    file: String,
}

impl JsonProgressStore {
    pub fn new(storage: Arc<dyn Storage>, file: impl Into<String>) -> Self {
        JsonProgressStore {
            storage,
            file: file.into(),
        }
    }

    pub fn file(&self) -> &str {
        &self.file
    }
}

#[async_trait]
impl ProgressStore for JsonProgressStore {
    async fn append(&self, entry: &ProgressEntry) -> Result<(), ProgressError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');
        self.storage.append(&self.file, &line).await?;
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<ProgressEntry>, ProgressError> {
        let content = match self.storage.read(&self.file).await {
            Ok(bytes) => bytes,
            Err(StorageError::NotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for (n, line) in content.split(|b| *b == b'\n').enumerate() {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<ProgressEntry>(line) {
                Ok(entry) => entries.push(entry),
                // A crash mid-append leaves a torn last line.
                Err(e) => warn!(file = %self.file, line = n + 1, error = %e, "Skipping unreadable progress entry"),
            }
        }
        Ok(entries)
    }

    async fn reset(&self) -> Result<(), ProgressError> {
        self.storage.remove(&self.file).await?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("{}/{}", self.storage.describe(), self.file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use connectors::storage::MemoryStorage;
    use model::{core::identifiers::TaskId, dump::task::TaskStatus};

    #[tokio::test]
    async fn last_entry_wins_and_torn_lines_are_skipped() {
        let storage = Arc::new(MemoryStorage::new("p"));
        let store = JsonProgressStore::new(storage.clone(), "load-progress.x.json");
        let id = TaskId::new("chunk:s@t@0");

        store
            .append(&ProgressEntry::new(id.clone(), TaskStatus::InProgress))
            .await
            .unwrap();
        store
            .append(&ProgressEntry::new(id.clone(), TaskStatus::Done).with_counts(10, 100))
            .await
            .unwrap();
        storage
            .append("load-progress.x.json", b"{\"id\":\"chunk:s@t@1\",\"sta")
            .await
            .unwrap();

        let state = store.load().await.unwrap();
        assert!(state.is_done(&id));
        assert_eq!(state.rows(&id), Some(10));
        assert_eq!(state.len(), 1);
    }

    #[tokio::test]
    async fn reset_discards_everything() {
        let storage = Arc::new(MemoryStorage::new("p"));
        let store = JsonProgressStore::new(storage, "dump-progress.json");
        store
            .append(&ProgressEntry::new(TaskId::grants(), TaskStatus::Done))
            .await
            .unwrap();
        store.reset().await.unwrap();
        assert!(store.load().await.unwrap().is_empty());
    }
}
