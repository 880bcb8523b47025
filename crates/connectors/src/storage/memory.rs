use super::{ObjectInfo, ObjectWriter, Storage};
use crate::error::StorageError;
use async_trait::async_trait;
use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
};

/// Objects kept in process memory. Clones share the same objects, which is
/// how a dump and a concurrent load exchange data during a copy.
#[derive(Debug, Clone)]
pub struct MemoryStorage {
    name: String,
    objects: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new(name: impl Into<String>) -> Self {
        MemoryStorage {
            name: name.into(),
            objects: Arc::default(),
        }
    }

    fn poisoned() -> StorageError {
        StorageError::Transient("memory storage lock poisoned".into())
    }

    fn put(&self, name: &str, data: Vec<u8>) -> Result<(), StorageError> {
        self.objects
            .write()
            .map_err(|_| Self::poisoned())?
            .insert(name.to_string(), data);
        Ok(())
    }

    pub fn total_bytes(&self) -> u64 {
        self.objects
            .read()
            .map(|o| o.values().map(|v| v.len() as u64).sum())
            .unwrap_or(0)
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn describe(&self) -> String {
        format!("memory://{}", self.name)
    }

    async fn exists(&self, name: &str) -> Result<bool, StorageError> {
        Ok(self
            .objects
            .read()
            .map_err(|_| Self::poisoned())?
            .contains_key(name))
    }

    async fn read(&self, name: &str) -> Result<Vec<u8>, StorageError> {
        self.objects
            .read()
            .map_err(|_| Self::poisoned())?
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(name.to_string()))
    }

    async fn write(&self, name: &str, data: &[u8]) -> Result<(), StorageError> {
        self.put(name, data.to_vec())
    }

    async fn append(&self, name: &str, data: &[u8]) -> Result<(), StorageError> {
        self.objects
            .write()
            .map_err(|_| Self::poisoned())?
            .entry(name.to_string())
            .or_default()
            .extend_from_slice(data);
        Ok(())
    }

    async fn create(&self, name: &str) -> Result<Box<dyn ObjectWriter>, StorageError> {
        Ok(Box::new(MemoryWriter {
            storage: self.clone(),
            name: name.to_string(),
            buffer: Vec::new(),
        }))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError> {
        Ok(self
            .objects
            .read()
            .map_err(|_| Self::poisoned())?
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, data)| ObjectInfo {
                name: name.clone(),
                size: data.len() as u64,
            })
            .collect())
    }

    async fn remove(&self, name: &str) -> Result<(), StorageError> {
        self.objects
            .write()
            .map_err(|_| Self::poisoned())?
            .remove(name);
        Ok(())
    }
}

struct MemoryWriter {
    storage: MemoryStorage,
    name: String,
    buffer: Vec<u8>,
}

#[async_trait]
impl ObjectWriter for MemoryWriter {
    async fn write(&mut self, data: &[u8]) -> Result<(), StorageError> {
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<u64, StorageError> {
        let size = self.buffer.len() as u64;
        self.storage.put(&self.name, self.buffer)?;
        Ok(size)
    }

    async fn abort(self: Box<Self>) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn clones_share_objects() {
        let a = MemoryStorage::new("t");
        let b = a.clone();
        let mut writer = a.create("obj").await.unwrap();
        writer.write(b"abc").await.unwrap();
        assert!(!b.exists("obj").await.unwrap());
        writer.finish().await.unwrap();
        assert_eq!(b.read("obj").await.unwrap(), b"abc");
        b.append("obj", b"d").await.unwrap();
        assert_eq!(a.total_bytes(), 4);
    }
}
