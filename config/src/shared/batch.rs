use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Batching used by sinks when fetching from a pipeline channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct BatchConfig {
    /// Maximum number of records returned by a single fetch.
    #[serde(default = "default_batch_max_size")]
    pub max_size: usize,
    /// Maximum time, in milliseconds, a fetch waits for the first record.
    #[serde(default = "default_batch_max_fetch_ms")]
    pub max_fetch_ms: u64,
}

impl BatchConfig {
    pub const DEFAULT_MAX_SIZE: usize = 1000;

    pub const DEFAULT_MAX_FETCH_MS: u64 = 1000;

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_size == 0 {
            return Err(ValidationError::must_be_positive("batch.max_size"));
        }

        Ok(())
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_size: default_batch_max_size(),
            max_fetch_ms: default_batch_max_fetch_ms(),
        }
    }
}

fn default_batch_max_size() -> usize {
    BatchConfig::DEFAULT_MAX_SIZE
}

fn default_batch_max_fetch_ms() -> u64 {
    BatchConfig::DEFAULT_MAX_FETCH_MS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_batch_size_is_rejected() {
        let config = BatchConfig {
            max_size: 0,
            max_fetch_ms: 10,
        };
        assert_eq!(
            config.validate(),
            Err(ValidationError::must_be_positive("batch.max_size"))
        );
        assert!(BatchConfig::default().validate().is_ok());
    }
}
