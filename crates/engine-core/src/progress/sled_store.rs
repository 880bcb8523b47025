use super::ProgressStore;
use crate::error::ProgressError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use model::{
    core::identifiers::TaskId,
    dump::task::TaskStatus,
    progress::state::ProgressEntry,
};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Progress kept in a local sled database, one tree per dump.
pub struct SledProgressStore {
    db: sled::Db,
    tree: sled::Tree,
    scope: String,
}

/// Fixed-layout form of [`ProgressEntry`] for bincode.
#[derive(Serialize, Deserialize)]
struct StoredEntry {
    id: String,
    status: TaskStatus,
    at: DateTime<Utc>,
    rows: Option<u64>,
    bytes: Option<u64>,
    gtid: Option<String>,
    error: Option<String>,
}

impl From<&ProgressEntry> for StoredEntry {
    fn from(entry: &ProgressEntry) -> Self {
        StoredEntry {
            id: entry.id.as_str().to_string(),
            status: entry.status,
            at: entry.at,
            rows: entry.rows,
            bytes: entry.bytes,
            gtid: entry.gtid.clone(),
            error: entry.error.clone(),
        }
    }
}

impl From<StoredEntry> for ProgressEntry {
    fn from(stored: StoredEntry) -> Self {
        ProgressEntry {
            id: TaskId::new(stored.id),
            status: stored.status,
            at: stored.at,
            rows: stored.rows,
            bytes: stored.bytes,
            gtid: stored.gtid,
            error: stored.error,
        }
    }
}

impl SledProgressStore {
    pub fn open(path: impl AsRef<Path>, scope: &str) -> Result<Self, ProgressError> {
        let db = sled::open(path)?;
        let tree = db.open_tree(Self::tree_name(scope))?;
        Ok(Self {
            db,
            tree,
            scope: scope.to_string(),
        })
    }

    #[inline]
    fn tree_name(scope: &str) -> String {
        format!("progress:{scope}")
    }
}

#[async_trait]
impl ProgressStore for SledProgressStore {
    async fn append(&self, entry: &ProgressEntry) -> Result<(), ProgressError> {
        // generate_id is monotonic, so big-endian keys iterate in append order.
        let seq = self.db.generate_id()?;
        let value = bincode::serialize(&StoredEntry::from(entry))?;
        self.tree.insert(seq.to_be_bytes(), value)?;
        self.tree.flush_async().await?;
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<ProgressEntry>, ProgressError> {
        let mut entries = Vec::new();
        for item in self.tree.iter() {
            let (_key, value) = item?;
            let stored: StoredEntry = bincode::deserialize(&value)?;
            entries.push(stored.into());
        }
        Ok(entries)
    }

    async fn reset(&self) -> Result<(), ProgressError> {
        self.tree.clear()?;
        self.tree.flush_async().await?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("sled:{}", Self::tree_name(&self.scope))
    }
}
