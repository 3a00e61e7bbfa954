// ABOUTME: The DurableStore trait every persistence medium implements, plus its typed failures.
// ABOUTME: Operations return StoreError instead of panicking so callers can pick a fallback.

use async_trait::async_trait;
use thiserror::Error;

/// Key written and removed by `probe` to check that a medium accepts writes.
pub const PROBE_KEY: &str = "__hearth_probe__";

/// Typed failures of a persistence medium.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("quota exceeded writing {key}: {needed} bytes needed, limit {limit:?}")]
    QuotaExceeded {
        key: String,
        needed: u64,
        limit: Option<u64>,
    },

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("invalid key: {0:?}")]
    InvalidKey(String),
}

impl StoreError {
    pub fn is_quota(&self) -> bool {
        matches!(self, StoreError::QuotaExceeded { .. })
    }
}

/// A string-keyed, string-valued persistent medium.
///
/// Implementations complete promptly or fail; none of them block
/// indefinitely. `get` returns `Ok(None)` for a key that was never written.
#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    async fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;

    /// Removing a missing key succeeds.
    async fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Keys starting with `prefix`, sorted ascending. The result is a copy
    /// taken at call time, not a live view.
    async fn keys(&self, prefix: &str) -> Result<Vec<String>, StoreError>;

    /// Write and remove a sentinel key to check the medium is usable.
    async fn probe(&self) -> Result<(), StoreError> {
        self.set(PROBE_KEY, "1").await?;
        self.remove(PROBE_KEY).await
    }
}

/// Size an entry counts against a quota: key bytes plus value bytes.
pub(crate) fn entry_size(key: &str, value: &str) -> u64 {
    (key.len() + value.len()) as u64
}

/// Reject a write that would push usage over `limit`. `used_by_others` is the
/// usage of every entry except the one being replaced.
pub(crate) fn check_quota(
    limit: Option<u64>,
    key: &str,
    value: &str,
    used_by_others: u64,
) -> Result<(), StoreError> {
    let Some(limit) = limit else {
        return Ok(());
    };
    let needed = used_by_others + entry_size(key, value);
    if needed > limit {
        return Err(StoreError::QuotaExceeded {
            key: key.to_string(),
            needed,
            limit: Some(limit),
        });
    }
    Ok(())
}
