use super::{BufferedReader, ObjectInfo, ObjectReader, ObjectWriter, Storage};
use crate::error::StorageError;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::{
    fs::{self, File, OpenOptions},
    io::{AsyncReadExt, AsyncWriteExt},
};
use tracing::debug;

const PARTIAL_SUFFIX: &str = ".partial";

/// A directory on the local filesystem. Files are created owner-only.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    /// Opens the directory, creating it (and its parents) when missing.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        let root = root.into();
        if !fs::try_exists(&root)
            .await
            .map_err(|e| StorageError::io(root.display().to_string(), e))?
        {
            fs::create_dir_all(&root)
                .await
                .map_err(|e| StorageError::io(root.display().to_string(), e))?;
            set_mode(&root, 0o700).await?;
            debug!(path = %root.display(), "Created output directory");
        }
        Ok(LocalStorage { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn partial_path(&self, name: &str) -> PathBuf {
        self.root.join(format!(".{name}{PARTIAL_SUFFIX}"))
    }
}

#[cfg(unix)]
async fn set_mode(path: &Path, mode: u32) -> Result<(), StorageError> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
        .await
        .map_err(|e| StorageError::io(path.display().to_string(), e))
}

#[cfg(not(unix))]
async fn set_mode(_path: &Path, _mode: u32) -> Result<(), StorageError> {
    Ok(())
}

fn create_options(append: bool) -> OpenOptions {
    let mut options = OpenOptions::new();
    options.create(true);
    if append {
        options.append(true);
    } else {
        options.write(true).truncate(true);
    }
    #[cfg(unix)]
    options.mode(0o600);
    options
}

#[async_trait]
impl Storage for LocalStorage {
    fn describe(&self) -> String {
        self.root.display().to_string()
    }

    async fn exists(&self, name: &str) -> Result<bool, StorageError> {
        fs::try_exists(self.path(name))
            .await
            .map_err(|e| StorageError::io(name, e))
    }

    async fn read(&self, name: &str) -> Result<Vec<u8>, StorageError> {
        match fs::read(self.path(name)).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(name.to_string()))
            }
            Err(e) => Err(StorageError::io(name, e)),
        }
    }

    async fn reader(&self, name: &str) -> Result<Box<dyn ObjectReader>, StorageError> {
        match File::open(self.path(name)).await {
            Ok(file) => Ok(Box::new(LocalReader {
                name: name.to_string(),
                file,
            })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StorageError::NotFound(name.to_string()))
            }
            Err(e) => Err(StorageError::io(name, e)),
        }
    }

    async fn write(&self, name: &str, data: &[u8]) -> Result<(), StorageError> {
        let mut writer = self.create(name).await?;
        writer.write(data).await?;
        writer.finish().await.map(|_| ())
    }

    async fn append(&self, name: &str, data: &[u8]) -> Result<(), StorageError> {
        let mut file = create_options(true)
            .open(self.path(name))
            .await
            .map_err(|e| StorageError::io(name, e))?;
        file.write_all(data)
            .await
            .map_err(|e| StorageError::io(name, e))?;
        file.flush().await.map_err(|e| StorageError::io(name, e))
    }

    async fn create(&self, name: &str) -> Result<Box<dyn ObjectWriter>, StorageError> {
        let partial = self.partial_path(name);
        let file = create_options(false)
            .open(&partial)
            .await
            .map_err(|e| StorageError::io(name, e))?;
        Ok(Box::new(LocalWriter {
            name: name.to_string(),
            file,
            partial,
            target: self.path(name),
            written: 0,
        }))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError> {
        let root = self.root.display().to_string();
        let mut entries = fs::read_dir(&self.root)
            .await
            .map_err(|e| StorageError::io(&root, e))?;
        let mut objects = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StorageError::io(&root, e))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !name.starts_with(prefix) {
                continue;
            }
            let meta = entry
                .metadata()
                .await
                .map_err(|e| StorageError::io(&name, e))?;
            if meta.is_file() {
                objects.push(ObjectInfo {
                    name,
                    size: meta.len(),
                });
            }
        }
        objects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(objects)
    }

    async fn remove(&self, name: &str) -> Result<(), StorageError> {
        for path in [self.path(name), self.partial_path(name)] {
            match fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(StorageError::io(name, e)),
            }
        }
        Ok(())
    }
}

struct LocalReader {
    name: String,
    file: File,
}

#[async_trait]
impl ObjectReader for LocalReader {
    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, StorageError> {
        let mut buf = vec![0; BufferedReader::CHUNK];
        let n = self
            .file
            .read(&mut buf)
            .await
            .map_err(|e| StorageError::io(&self.name, e))?;
        if n == 0 {
            return Ok(None);
        }
        buf.truncate(n);
        Ok(Some(buf))
    }
}

struct LocalWriter {
    name: String,
    file: File,
    partial: PathBuf,
    target: PathBuf,
    written: u64,
}

#[async_trait]
impl ObjectWriter for LocalWriter {
    async fn write(&mut self, data: &[u8]) -> Result<(), StorageError> {
        self.file
            .write_all(data)
            .await
            .map_err(|e| StorageError::io(&self.name, e))?;
        self.written += data.len() as u64;
        Ok(())
    }

    async fn finish(mut self: Box<Self>) -> Result<u64, StorageError> {
        self.file
            .flush()
            .await
            .map_err(|e| StorageError::io(&self.name, e))?;
        self.file
            .sync_all()
            .await
            .map_err(|e| StorageError::io(&self.name, e))?;
        fs::rename(&self.partial, &self.target)
            .await
            .map_err(|e| StorageError::io(&self.name, e))?;
        Ok(self.written)
    }

    async fn abort(self: Box<Self>) -> Result<(), StorageError> {
        let LocalWriter {
            name, file, partial, ..
        } = *self;
        drop(file);
        match fs::remove_file(&partial).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::io(name, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn objects_appear_only_after_finish() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::open(dir.path().join("out")).await.unwrap();

        let mut writer = storage.create("a@t@0.tsv").await.unwrap();
        writer.write(b"1\tone\n").await.unwrap();
        assert!(!storage.exists("a@t@0.tsv").await.unwrap());
        assert!(storage.list("").await.unwrap().is_empty());

        assert_eq!(writer.finish().await.unwrap(), 6);
        assert_eq!(storage.read("a@t@0.tsv").await.unwrap(), b"1\tone\n");
    }

    #[tokio::test]
    async fn opened_objects_are_read_in_pieces() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::open(dir.path()).await.unwrap();
        let data = vec![7u8; BufferedReader::CHUNK + 10];
        storage.write("big", &data).await.unwrap();

        let mut reader = storage.reader("big").await.unwrap();
        let mut pieces = Vec::new();
        while let Some(piece) = reader.read_chunk().await.unwrap() {
            pieces.push(piece.len());
        }
        assert!(pieces.len() >= 2);
        assert_eq!(pieces.iter().sum::<usize>(), data.len());
        assert!(matches!(storage.reader("missing").await, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn aborted_writer_leaves_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::open(dir.path()).await.unwrap();
        let mut writer = storage.create("x").await.unwrap();
        writer.write(b"partial").await.unwrap();
        writer.abort().await.unwrap();
        assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    }

    #[tokio::test]
    async fn append_and_list_by_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::open(dir.path()).await.unwrap();
        storage.append("load-progress.x.json", b"{}\n").await.unwrap();
        storage.append("load-progress.x.json", b"{}\n").await.unwrap();
        storage.write("@.json", b"{}").await.unwrap();

        let listed = storage.list("load-progress").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].size, 6);
        assert!(matches!(
            storage.read("missing").await,
            Err(StorageError::NotFound(_))
        ));
        storage.remove("missing").await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn files_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("dump");
        let storage = LocalStorage::open(&root).await.unwrap();
        storage.write("@.json", b"{}").await.unwrap();

        let dir_mode = std::fs::metadata(&root).unwrap().permissions().mode() & 0o777;
        let file_mode = std::fs::metadata(root.join("@.json"))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(dir_mode, 0o700);
        assert_eq!(file_mode, 0o600);
    }
}
