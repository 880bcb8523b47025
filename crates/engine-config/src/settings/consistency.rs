use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConsistencyConfig {
    pub consistent: bool,
    /// Upper bound for every worker to open its snapshot transaction.
    pub snapshot_timeout_ms: u64,
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            consistent: true,
            snapshot_timeout_ms: 30_000,
        }
    }
}

impl ConsistencyConfig {
    pub fn snapshot_timeout(&self) -> Duration {
        Duration::from_millis(self.snapshot_timeout_ms)
    }
}
