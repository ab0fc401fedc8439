use std::time::Duration;

use thiserror::Error;

/// Rejected map configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("granularity must be at least one millisecond")]
    ZeroGranularity,

    /// A sweep could otherwise drop the newest bucket of a partition.
    #[error("minimum guaranteed lifetime ({lifetime:?}) is shorter than the granularity ({granularity:?})")]
    LifetimeShorterThanGranularity {
        lifetime: Duration,
        granularity: Duration,
    },

    #[error("shard count must be a non-zero power of two, got {0}")]
    InvalidShardCount(usize),
}
