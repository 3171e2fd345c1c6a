use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("counter store unavailable: {0}")]
    Unavailable(String),
    #[error("counter store call `{op}` timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },
}

impl From<redis::RedisError> for StoreError {
    fn from(err: redis::RedisError) -> Self {
        Self::Unavailable(err.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Ordered-set primitives the sliding-log limiter needs from a shared store.
///
/// Scores are seconds since the Unix epoch. Implementations must be safe to
/// call from many tasks and many processes at once; no call is expected to
/// be atomic with any other.
#[async_trait]
pub trait CounterStore: Send + Sync {
    fn name(&self) -> &'static str;

    async fn add(&self, key: &str, member: &str, score: f64) -> StoreResult<()>;

    /// Removes every member with `score <= max_score`, returning how many went.
    async fn remove_up_to(&self, key: &str, max_score: f64) -> StoreResult<u64>;

    async fn cardinality(&self, key: &str) -> StoreResult<u64>;

    /// Lowest-ranked member's score, if the set is non-empty.
    async fn oldest_score(&self, key: &str) -> StoreResult<Option<f64>>;

    async fn expire(&self, key: &str, ttl_secs: u64) -> StoreResult<()>;

    async fn delete(&self, keys: &[String]) -> StoreResult<()>;

    async fn ping(&self) -> StoreResult<()>;
}
