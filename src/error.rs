use std::time::Duration;

/// Errors raised while building a [`MemoryCache`](crate::MemoryCache).
///
/// Contract violations on a live cache (empty keys, contradictory policies)
/// panic instead; only construction-time configuration goes through `Result`.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("cache name must not be empty")]
    EmptyName,

    #[error("cache name \"default\" is reserved for the default cache")]
    ReservedName,

    #[error("polling interval must be greater than zero, got {0:?}")]
    InvalidPollingInterval(Duration),

    #[error("physical memory limit must be a percentage in 1..=100, got {0}")]
    InvalidPhysicalMemoryLimit(u32),

    #[error("shard count must be greater than zero")]
    InvalidShardCount,
}
