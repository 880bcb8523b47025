use crate::error::ProgressError;
use async_trait::async_trait;
use model::progress::state::{ProgressEntry, ProgressState};

pub mod json;
pub mod sled_store;

pub use json::JsonProgressStore;
pub use sled_store::SledProgressStore;

/// Durable, append-only log of task status transitions.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn append(&self, entry: &ProgressEntry) -> Result<(), ProgressError>;

    /// All entries in the order they were appended.
    async fn entries(&self) -> Result<Vec<ProgressEntry>, ProgressError>;

    /// Discards every recorded transition.
    async fn reset(&self) -> Result<(), ProgressError>;

    fn describe(&self) -> String;

    async fn load(&self) -> Result<ProgressState, ProgressError> {
        let entries = self.entries().await?;
        Ok(ProgressState::from_entries(&entries))
    }
}
