//! Engine configuration.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use intsync_common::{Error, Result};

use crate::batch::BatchConfig;
use crate::retry::RetryConfig;

/// Due tasks drained per scheduler tick.
pub const DEFAULT_DUE_TASK_LIMIT: usize = 10;

/// Process-wide configuration of a [`SyncEngine`](crate::SyncEngine).
///
/// Immutable once the engine is constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Per-record retry policy.
    pub retry: RetryConfig,
    /// Batch sizing and throttling.
    pub batch: BatchConfig,
    /// Maximum tasks picked up by one `process_due_tasks` call.
    pub due_task_limit: usize,
    /// Period of the due-task scheduler loop.
    pub scheduler_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            retry: RetryConfig::default(),
            batch: BatchConfig::default(),
            due_task_limit: DEFAULT_DUE_TASK_LIMIT,
            scheduler_interval_secs: 60,
        }
    }
}

impl EngineConfig {
    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the batch policy.
    pub fn with_batch(mut self, batch: BatchConfig) -> Self {
        self.batch = batch;
        self
    }

    /// Set the due-task limit.
    pub fn with_due_task_limit(mut self, limit: usize) -> Self {
        self.due_task_limit = limit;
        self
    }

    /// Set the scheduler period.
    pub fn with_scheduler_interval(mut self, interval: Duration) -> Self {
        self.scheduler_interval_secs = interval.as_secs();
        self
    }

    pub fn scheduler_interval(&self) -> Duration {
        Duration::from_secs(self.scheduler_interval_secs)
    }

    /// Check all sections.
    pub fn validate(&self) -> Result<()> {
        self.retry.validate()?;
        self.batch.validate()?;
        if self.due_task_limit == 0 {
            return Err(Error::InvalidInput(
                "due_task_limit must be at least 1".to_string(),
            ));
        }
        if self.scheduler_interval_secs == 0 {
            return Err(Error::InvalidInput(
                "scheduler_interval_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Serialize to pretty JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
