//! Small option groups shared by the dump, load and binlog operations.

pub(crate) mod bytes;
pub mod chunking;
pub mod compatibility;
pub mod consistency;
pub mod dialect;
pub mod storage;

pub use bytes::{format_bytes, parse_bytes};
pub use chunking::ChunkingConfig;
pub use compatibility::{CompatibilityConfig, CompatibilityOption};
pub use consistency::ConsistencyConfig;
pub use dialect::DialectConfig;
pub use storage::{ProgressLocation, RetryConfig, StorageConfig};
