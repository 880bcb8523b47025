use crate::error::StorageError;
use async_trait::async_trait;
use std::{
    collections::HashMap,
    fmt,
    path::PathBuf,
    sync::{Arc, Mutex},
};

pub mod http;
pub mod local;
pub mod memory;

pub use http::HttpStorage;
pub use local::LocalStorage;
pub use memory::MemoryStorage;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub name: String,
    pub size: u64,
}

/// A flat namespace of named objects: a directory, a bucket prefix or an
/// in-memory map. Objects written through [`Storage::create`] become
/// visible only when the writer finishes.
#[async_trait]
pub trait Storage: Send + Sync {
    fn describe(&self) -> String;

    async fn exists(&self, name: &str) -> Result<bool, StorageError>;

    async fn read(&self, name: &str) -> Result<Vec<u8>, StorageError>;

    /// Opens an object to be read in pieces.
    async fn reader(&self, name: &str) -> Result<Box<dyn ObjectReader>, StorageError> {
        Ok(Box::new(BufferedReader::new(self.read(name).await?)))
    }

    /// Replaces the object atomically.
    async fn write(&self, name: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Appends to an object, creating it when missing.
    async fn append(&self, name: &str, data: &[u8]) -> Result<(), StorageError> {
        let mut existing = match self.read(name).await {
            Ok(bytes) => bytes,
            Err(StorageError::NotFound(_)) => Vec::new(),
            Err(e) => return Err(e),
        };
        existing.extend_from_slice(data);
        self.write(name, &existing).await
    }

    /// Starts a streamed upload of a new object.
    async fn create(&self, name: &str) -> Result<Box<dyn ObjectWriter>, StorageError>;

    /// Lists objects whose name starts with `prefix`, sorted by name.
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError>;

    /// Removes an object. Missing objects are not an error.
    async fn remove(&self, name: &str) -> Result<(), StorageError>;

    async fn read_to_string(&self, name: &str) -> Result<String, StorageError> {
        let bytes = self.read(name).await?;
        String::from_utf8(bytes).map_err(|e| StorageError::InvalidData {
            name: name.to_string(),
            reason: e.to_string(),
        })
    }
}

#[async_trait]
pub trait ObjectWriter: Send {
    async fn write(&mut self, data: &[u8]) -> Result<(), StorageError>;

    /// Publishes the object and returns its size.
    async fn finish(self: Box<Self>) -> Result<u64, StorageError>;

    /// Drops everything written so far.
    async fn abort(self: Box<Self>) -> Result<(), StorageError>;
}

#[async_trait]
pub trait ObjectReader: Send {
    /// The next piece of the object, `None` past its end.
    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, StorageError>;
}

/// Pieces of an object that was already read in full.
pub struct BufferedReader {
    data: Vec<u8>,
    offset: usize,
}

impl BufferedReader {
    pub const CHUNK: usize = 1 << 20;

    pub fn new(data: Vec<u8>) -> Self {
        BufferedReader { data, offset: 0 }
    }
}

#[async_trait]
impl ObjectReader for BufferedReader {
    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, StorageError> {
        if self.offset >= self.data.len() {
            return Ok(None);
        }
        let end = (self.offset + Self::CHUNK).min(self.data.len());
        let piece = self.data[self.offset..end].to_vec();
        self.offset = end;
        Ok(Some(piece))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BucketScheme {
    S3,
    Oci,
    Azure,
}

impl BucketScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            BucketScheme::S3 => "s3",
            BucketScheme::Oci => "oci",
            BucketScheme::Azure => "azure",
        }
    }
}

/// What a pre-authenticated request URL grants access to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParScope {
    /// A bucket or a prefix inside it; the URL ends with `/`.
    Prefix,
    /// One object only.
    Object,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageUrl {
    Local(PathBuf),
    Memory(String),
    Preauthenticated { url: String, scope: ParScope },
    Bucket {
        scheme: BucketScheme,
        bucket: String,
        prefix: String,
    },
}

impl StorageUrl {
    pub fn parse(url: &str) -> Result<Self, StorageError> {
        let invalid = |reason: &str| StorageError::InvalidUrl {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        if url.trim().is_empty() {
            return Err(invalid("empty location"));
        }
        if let Some(rest) = url.strip_prefix("file://") {
            return Ok(StorageUrl::Local(PathBuf::from(rest)));
        }
        if let Some(rest) = url.strip_prefix("memory://") {
            return Ok(StorageUrl::Memory(rest.to_string()));
        }
        if url.starts_with("https://") {
            let scope = if url.ends_with('/') {
                ParScope::Prefix
            } else {
                ParScope::Object
            };
            return Ok(StorageUrl::Preauthenticated {
                url: url.to_string(),
                scope,
            });
        }
        if url.starts_with("http://") {
            return Err(invalid("only https pre-authenticated URLs are supported"));
        }

        for scheme in [BucketScheme::S3, BucketScheme::Oci, BucketScheme::Azure] {
            let marker = format!("{}://", scheme.as_str());
            if let Some(rest) = url.strip_prefix(&marker) {
                let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
                if bucket.is_empty() {
                    return Err(invalid("missing bucket name"));
                }
                return Ok(StorageUrl::Bucket {
                    scheme,
                    bucket: bucket.to_string(),
                    prefix: prefix.trim_end_matches('/').to_string(),
                });
            }
        }

        if url.contains("://") {
            return Err(invalid("unknown scheme"));
        }
        Ok(StorageUrl::Local(PathBuf::from(url)))
    }

    pub fn is_local(&self) -> bool {
        matches!(self, StorageUrl::Local(_))
    }
}

impl fmt::Display for StorageUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageUrl::Local(path) => write!(f, "{}", path.display()),
            StorageUrl::Memory(name) => write!(f, "memory://{name}"),
            StorageUrl::Preauthenticated { .. } => write!(f, "<pre-authenticated URL>"),
            StorageUrl::Bucket {
                scheme,
                bucket,
                prefix,
            } => write!(f, "{}://{bucket}/{prefix}", scheme.as_str()),
        }
    }
}

type BucketOpener =
    dyn Fn(&str, &str) -> Result<Arc<dyn Storage>, StorageError> + Send + Sync;

/// Resolves storage URLs to backends. Cloud bucket backends are supplied by
/// the embedding application; local, memory and pre-authenticated HTTPS
/// storages are built in.
#[derive(Clone, Default)]
pub struct StorageRegistry {
    buckets: HashMap<BucketScheme, Arc<BucketOpener>>,
    memory: Arc<Mutex<HashMap<String, MemoryStorage>>>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_bucket<F>(&mut self, scheme: BucketScheme, opener: F)
    where
        F: Fn(&str, &str) -> Result<Arc<dyn Storage>, StorageError> + Send + Sync + 'static,
    {
        self.buckets.insert(scheme, Arc::new(opener));
    }

    /// Returns the named in-memory storage, creating it on first use.
    pub fn memory(&self, name: &str) -> MemoryStorage {
        match self.memory.lock() {
            Ok(mut map) => map
                .entry(name.to_string())
                .or_insert_with(|| MemoryStorage::new(name))
                .clone(),
            Err(_) => MemoryStorage::new(name),
        }
    }

    pub async fn open(&self, url: &str) -> Result<Arc<dyn Storage>, StorageError> {
        match StorageUrl::parse(url)? {
            StorageUrl::Local(path) => Ok(Arc::new(LocalStorage::open(path).await?)),
            StorageUrl::Memory(name) => Ok(Arc::new(self.memory(&name))),
            StorageUrl::Preauthenticated { url, scope } => {
                Ok(Arc::new(HttpStorage::new(&url, scope)?))
            }
            StorageUrl::Bucket {
                scheme,
                bucket,
                prefix,
            } => match self.buckets.get(&scheme) {
                Some(opener) => opener(&bucket, &prefix),
                None => Err(StorageError::Unsupported(scheme.as_str().to_string())),
            },
        }
    }
}
