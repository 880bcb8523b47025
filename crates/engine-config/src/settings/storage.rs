use crate::error::ConfigError;
use engine_core::retry::RetryPolicy;
use serde::Deserialize;
use std::{path::PathBuf, time::Duration};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    pub max_attempts: usize,
    /// Retries made at a fixed delay before exponential backoff starts.
    pub fixed_attempts: usize,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        let policy = RetryPolicy::for_storage();
        Self {
            max_attempts: policy.max_attempts,
            fixed_attempts: policy.fixed_attempts,
            base_delay_ms: policy.base_delay.as_millis() as u64,
            max_delay_ms: policy.max_delay.as_millis() as u64,
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
        .with_fixed_attempts(self.fixed_attempts)
    }
}

/// Where the progress log lives.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind")]
pub enum ProgressLocation {
    /// JSON lines next to the dump, through the storage.
    #[default]
    Storage,
    /// JSON lines in a specific file name inside the storage.
    File { name: String },
    /// A local sled database.
    Local { path: PathBuf },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StorageConfig {
    pub retry: RetryConfig,
    pub progress: ProgressLocation,
    /// Object storage namespace, for backends that need one.
    pub namespace: Option<String>,
}

impl StorageConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::invalid("retry.maxAttempts", "must be at least 1"));
        }
        if let ProgressLocation::File { name } = &self.progress
            && (name.is_empty() || name.contains('/'))
        {
            return Err(ConfigError::invalid(
                "progress.name",
                "must be a plain file name",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_progress_location() {
        let cfg: StorageConfig =
            serde_json::from_str(r#"{"progress":{"kind":"local","path":"/var/lib/p"}}"#).unwrap();
        assert_eq!(
            cfg.progress,
            ProgressLocation::Local {
                path: PathBuf::from("/var/lib/p")
            }
        );
        assert_eq!(cfg.retry, RetryConfig::default());
        cfg.validate().unwrap();
    }

    #[test]
    fn retry_policy_from_config() {
        let policy = RetryConfig {
            max_attempts: 4,
            fixed_attempts: 2,
            base_delay_ms: 10,
            max_delay_ms: 100,
        }
        .policy();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.backoff_delay(1), Duration::from_millis(10));
        assert_eq!(policy.backoff_delay(3), Duration::from_millis(20));
    }
}
