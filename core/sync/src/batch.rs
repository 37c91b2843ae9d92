//! Batch sizing and throttling between batches.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use intsync_common::{Error, Result};

/// How fetched records are chunked and paced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Records per batch.
    pub batch_size: usize,
    /// Pause between consecutive batches (not after the last one).
    pub delay_between_batches_ms: u64,
}

impl BatchConfig {
    pub fn new(batch_size: usize, delay_between_batches: Duration) -> Self {
        Self {
            batch_size,
            delay_between_batches_ms: u64::try_from(delay_between_batches.as_millis())
                .unwrap_or(u64::MAX),
        }
    }

    pub fn delay_between_batches(&self) -> Duration {
        Duration::from_millis(self.delay_between_batches_ms)
    }

    /// Number of batches needed for `total` records.
    pub fn batch_count(&self, total: usize) -> usize {
        total.div_ceil(self.batch_size.max(1))
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidInput(
                "batch.batch_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            delay_between_batches_ms: 100,
        }
    }
}
