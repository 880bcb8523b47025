use super::{ObjectInfo, ObjectReader, ObjectWriter, ParScope, Storage};
use crate::error::StorageError;
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use tracing::debug;

/// Storage behind a pre-authenticated HTTPS URL. A prefix URL (ending with
/// `/`) gives access to every object below it; an object URL gives access
/// to that single object, read only.
#[derive(Debug, Clone)]
pub struct HttpStorage {
    client: Client,
    base: String,
    scope: ParScope,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    objects: Vec<ListedObject>,
    #[serde(default)]
    next_start_with: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ListedObject {
    name: String,
    #[serde(default)]
    size: u64,
}

impl HttpStorage {
    pub fn new(url: &str, scope: ParScope) -> Result<Self, StorageError> {
        let client = Client::builder().build()?;
        Ok(HttpStorage {
            client,
            base: url.to_string(),
            scope,
        })
    }

    fn object_url(&self, name: &str) -> Result<String, StorageError> {
        match self.scope {
            ParScope::Prefix => Ok(format!("{}{}", self.base, encode_path(name))),
            ParScope::Object => {
                let own = self.base.rsplit('/').next().unwrap_or_default();
                if own == encode_path(name) || own == name {
                    Ok(self.base.clone())
                } else {
                    Err(StorageError::NotPermitted(format!(
                        "URL only grants access to '{own}', not '{name}'"
                    )))
                }
            }
        }
    }

    fn writable(&self) -> Result<(), StorageError> {
        match self.scope {
            ParScope::Prefix => Ok(()),
            ParScope::Object => Err(StorageError::NotPermitted(
                "object URLs are read only".into(),
            )),
        }
    }

    async fn put(&self, name: &str, data: Vec<u8>) -> Result<(), StorageError> {
        self.writable()?;
        let url = self.object_url(name)?;
        let response = self.client.put(url).body(data).send().await?;
        check(response.status(), name)
    }
}

fn check(status: StatusCode, name: &str) -> Result<(), StorageError> {
    if status == StatusCode::NOT_FOUND {
        Err(StorageError::NotFound(name.to_string()))
    } else if !status.is_success() {
        Err(StorageError::Status {
            status: status.as_u16(),
            name: name.to_string(),
        })
    } else {
        Ok(())
    }
}

fn encode_path(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for b in name.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

#[async_trait]
impl Storage for HttpStorage {
    fn describe(&self) -> String {
        "<pre-authenticated URL>".to_string()
    }

    async fn exists(&self, name: &str) -> Result<bool, StorageError> {
        let url = self.object_url(name)?;
        let response = self.client.head(url).send().await?;
        match check(response.status(), name) {
            Ok(()) => Ok(true),
            Err(StorageError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn read(&self, name: &str) -> Result<Vec<u8>, StorageError> {
        let url = self.object_url(name)?;
        let response = self.client.get(url).send().await?;
        check(response.status(), name)?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn reader(&self, name: &str) -> Result<Box<dyn ObjectReader>, StorageError> {
        let url = self.object_url(name)?;
        let response = self.client.get(url).send().await?;
        check(response.status(), name)?;
        Ok(Box::new(HttpReader { response }))
    }

    async fn write(&self, name: &str, data: &[u8]) -> Result<(), StorageError> {
        self.put(name, data.to_vec()).await
    }

    async fn create(&self, name: &str) -> Result<Box<dyn ObjectWriter>, StorageError> {
        self.writable()?;
        Ok(Box::new(HttpWriter {
            storage: self.clone(),
            name: name.to_string(),
            buffer: Vec::new(),
        }))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, StorageError> {
        if self.scope == ParScope::Object {
            return Err(StorageError::NotPermitted(
                "object URLs cannot list".into(),
            ));
        }
        let mut objects = Vec::new();
        let mut start: Option<String> = None;
        loop {
            let mut query = vec![("prefix", prefix.to_string()), ("fields", "name,size".into())];
            if let Some(start) = &start {
                query.push(("start", start.clone()));
            }
            let response = self.client.get(&self.base).query(&query).send().await?;
            check(response.status(), prefix)?;
            let page: ListResponse = response.json().await?;
            objects.extend(page.objects.into_iter().map(|o| ObjectInfo {
                name: o.name,
                size: o.size,
            }));
            match page.next_start_with {
                Some(next) => start = Some(next),
                None => break,
            }
        }
        debug!(count = objects.len(), prefix, "Listed remote objects");
        objects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(objects)
    }

    async fn remove(&self, name: &str) -> Result<(), StorageError> {
        self.writable()?;
        let url = self.object_url(name)?;
        let response = self.client.delete(url).send().await?;
        match check(response.status(), name) {
            Err(StorageError::NotFound(_)) => Ok(()),
            other => other,
        }
    }
}

/// Hands out the response body as it arrives.
struct HttpReader {
    response: Response,
}

#[async_trait]
impl ObjectReader for HttpReader {
    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.response.chunk().await?.map(|bytes| bytes.to_vec()))
    }
}

/// Buffers the object and uploads it in one request on finish.
struct HttpWriter {
    storage: HttpStorage,
    name: String,
    buffer: Vec<u8>,
}

#[async_trait]
impl ObjectWriter for HttpWriter {
    async fn write(&mut self, data: &[u8]) -> Result<(), StorageError> {
        self.buffer.extend_from_slice(data);
        Ok(())
    }

    async fn finish(self: Box<Self>) -> Result<u64, StorageError> {
        let size = self.buffer.len() as u64;
        self.storage.put(&self.name, self.buffer).await?;
        Ok(size)
    }

    async fn abort(self: Box<Self>) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_scope_restricts_names() {
        let storage = HttpStorage::new(
            "https://host/p/token/n/ns/b/bkt/o/dump/%40.json",
            ParScope::Object,
        )
        .unwrap();
        assert!(storage.object_url("@.json").is_ok());
        assert!(matches!(
            storage.object_url("other.json"),
            Err(StorageError::NotPermitted(_))
        ));
        assert!(storage.writable().is_err());
    }

    #[test]
    fn prefix_scope_encodes_names() {
        let storage = HttpStorage::new("https://host/p/token/o/", ParScope::Prefix).unwrap();
        assert_eq!(
            storage.object_url("s@t@0.tsv.zst").unwrap(),
            "https://host/p/token/o/s%40t%400.tsv.zst"
        );
    }
}
