use super::bytes::deserialize_bytes;
use crate::error::ConfigError;
use serde::Deserialize;

pub const MIN_BYTES_PER_CHUNK: u64 = 128 * 1024;
pub const DEFAULT_BYTES_PER_CHUNK: u64 = 64 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ChunkingConfig {
    pub chunking: bool,
    #[serde(deserialize_with = "deserialize_bytes")]
    pub bytes_per_chunk: u64,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunking: true,
            bytes_per_chunk: DEFAULT_BYTES_PER_CHUNK,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bytes_per_chunk < MIN_BYTES_PER_CHUNK {
            return Err(ConfigError::invalid(
                "bytesPerChunk",
                format!("must be at least {MIN_BYTES_PER_CHUNK}"),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_size_strings() {
        let cfg: ChunkingConfig = serde_json::from_str(r#"{"bytesPerChunk":"1M"}"#).unwrap();
        assert!(cfg.chunking);
        assert_eq!(cfg.bytes_per_chunk, 1 << 20);
        cfg.validate().unwrap();
    }

    #[test]
    fn rejects_tiny_chunks() {
        let cfg = ChunkingConfig {
            chunking: true,
            bytes_per_chunk: 1000,
        };
        assert!(cfg.validate().is_err());
    }
}
