#![allow(dead_code)]

use crate::server::{FakeServer, Rows};
use async_trait::async_trait;
use connectors::{
    error::StorageError,
    storage::{MemoryStorage, ObjectInfo, ObjectWriter, Storage},
};
use engine_config::{
    options::{DumpOptions, LoadOptions},
    settings::{chunking::MIN_BYTES_PER_CHUNK, storage::StorageConfig},
};
use model::dump::files::{DONE_FILE, MANIFEST_FILE};
use std::sync::{
    Arc, Mutex,
    atomic::{AtomicU64, Ordering},
};

pub const SOURCE_UUID: &str = "3e11fa47-71ca-11e1-9e33-c80aa9429562";
pub const TARGET_UUID: &str = "8a94f357-aab4-11df-86ab-c80aa9429562";

/// Names that exercise every escape of the data file and SQL literal
/// encodings.
pub fn name_for(id: i64) -> Option<String> {
    match id % 7 {
        0 => None,
        1 => Some(format!("O'Brien {id}")),
        2 => Some(format!("tab\there {id}")),
        3 => Some(format!("line\nbreak {id}")),
        4 => Some(format!("back\\slash {id}")),
        5 => Some(format!("zażółć {id}")),
        _ => Some(format!("name-{id}")),
    }
}

pub fn people(count: i64) -> impl Iterator<Item = (i64, Option<String>)> {
    (1..=count).map(|id| (id, name_for(id)))
}

/// A source holding `app.people` with `count` rows and an empty
/// `app.audit`.
pub fn source_server(count: i64) -> FakeServer {
    FakeServer::new(SOURCE_UUID)
        .with_table("app", "people", people(count))
        .with_table("app", "audit", std::iter::empty())
        .with_gtid_executed(&format!("{SOURCE_UUID}:1-3"))
        .with_binlog_position("binlog.000002", 4)
}

pub fn target_server() -> FakeServer {
    FakeServer::new(TARGET_UUID)
}

/// Storage retries without the production delays.
pub fn quick_retries() -> StorageConfig {
    let mut storage = StorageConfig::default();
    storage.retry.base_delay_ms = 1;
    storage.retry.max_delay_ms = 5;
    storage
}

pub fn dump_options(threads: usize, bytes_per_chunk: u64) -> DumpOptions {
    let mut options = DumpOptions {
        threads,
        show_progress: false,
        storage: quick_retries(),
        ..Default::default()
    };
    options.chunking.bytes_per_chunk = bytes_per_chunk.max(MIN_BYTES_PER_CHUNK);
    options
}

pub fn load_options(threads: usize) -> LoadOptions {
    LoadOptions {
        threads,
        show_progress: false,
        storage: quick_retries(),
        ..Default::default()
    }
}

pub fn assert_same_rows(source: &FakeServer, target: &FakeServer, schema: &str, table: &str) {
    let expected: Rows = source
        .rows(schema, table)
        .unwrap_or_else(|| panic!("source has no {schema}.{table}"));
    let actual: Rows = target
        .rows(schema, table)
        .unwrap_or_else(|| panic!("target has no {schema}.{table}"));
    assert_eq!(actual.len(), expected.len(), "row count of {schema}.{table}");
    for (id, name) in &expected {
        assert_eq!(actual.get(id), Some(name), "row {id} of {schema}.{table}");
    }
}

pub async fn assert_dump_complete(storage: &dyn Storage) {
    assert!(storage.exists(DONE_FILE).await.unwrap(), "dump has no completion marker");
    let manifest: serde_json::Value = serde_json::from_slice(&storage.read(MANIFEST_FILE).await.unwrap()).unwrap();
    assert_eq!(manifest["complete"], serde_json::Value::Bool(true));
}

pub async fn data_files(storage: &dyn Storage, prefix: &str) -> Vec<String> {
    storage
        .list(prefix)
        .await
        .unwrap()
        .into_iter()
        .map(|o| o.name)
        .filter(|n| n.contains(".tsv"))
        .collect()
}

pub fn count_statements(server: &FakeServer, needle: &str) -> usize {
    server.statements().iter().filter(|s| s.contains(needle)).count()
}

/// Memory storage whose writes fail a given number of times with a
/// transient error.
pub struct FlakyStorage {
    inner: MemoryStorage,
    faults: Mutex<Vec<(String, usize)>>,
    failures: AtomicU64,
}

impl FlakyStorage {
    pub fn new(inner: MemoryStorage) -> Self {
        FlakyStorage {
            inner,
            faults: Mutex::new(Vec::new()),
            failures: AtomicU64::new(0),
        }
    }

    /// The next `times` writes of objects named `name` fail.
    pub fn fail_writes(self, name: &str, times: usize) -> Self {
        if let Ok(mut faults) = self.faults.lock() {
            faults.push((name.to_string(), times));
        }
        self
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    fn check(&self, name: &str) -> Result<(), StorageError> {
        let mut faults = self.faults.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((_, remaining)) = faults.iter_mut().find(|(n, r)| n == name && *r > 0) {
            *remaining -= 1;
            self.failures.fetch_add(1, Ordering::Relaxed);
            return Err(StorageError::Transient(format!("connection reset writing {name}")));
        }
        Ok(())
    }
}

#[async_trait]
impl Storage for FlakyStorage {
    fn describe(&self) -> String {
        format!("flaky {}", self.inner.describe())
    }

    async fn exists(&self, name: &str) -> Result<bool, StorageError> {
        self.inner.exists(name).await
    }

    async fn read(&self, name: &str) -> Result<Vec<u8>, StorageError> {
        self.inner.read(name).await
    }

    async fn write(&self, name: &str, data: &[u8]) -> Result<(), StorageError> {
        self.check(name)?;
        self.inner.write(name, data).await
    }

    async fn append(&self, name: &str, data: &[u8]) -> Result<(), StorageError> {
        self.check(name)?;
        self.inner.append(name, data).await
    }

    async fn create(&self, name: &str) -> Result<Box<dyn ObjectWriter>, StorageError> {
        self.check(name)?;
        self.inner.create(name).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError> {
        self.inner.list(prefix).await
    }

    async fn remove(&self, name: &str) -> Result<(), StorageError> {
        self.inner.remove(name).await
    }
}

pub fn shared(storage: &MemoryStorage) -> Arc<dyn Storage> {
    Arc::new(storage.clone())
}
