//! The shared in-memory store: ephemeral, reconstructable state only (repetition
//! windows, task leases, queued markers). Losing it must never lose data.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

mod memory;
mod redis_store;

pub use memory::MemoryStore;
pub use redis_store::RedisStore;

/// Repetition counts saturate here so a stuck loop cannot grow the value forever.
pub const MAX_REPETITION_COUNT: u32 = 99;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

#[async_trait]
pub trait SharedStore: Send + Sync + 'static {
    /// Records `digest` as the latest text sent to `member` inside the window hash `key`
    /// and returns how many times in a row that same text has now been seen. One atomic
    /// round trip; the window expires `ttl` after its last write.
    async fn record_repetition(
        &self,
        key: &str,
        member: &str,
        digest: &str,
        ttl: Duration,
    ) -> StoreResult<u32>;

    /// Takes the lease `key` for `token` if nobody holds it.
    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> StoreResult<bool>;

    /// Pushes out the expiry of a lease still held by `token`.
    async fn extend_lock(&self, key: &str, token: &str, ttl: Duration) -> StoreResult<bool>;

    /// Releases the lease if `token` still holds it.
    async fn unlock(&self, key: &str, token: &str) -> StoreResult<bool>;

    /// Marks every member of `members` under `key` in one round trip and returns the
    /// ones that were not already marked. Each marker expires `ttl` after it was set,
    /// independent of the others.
    async fn mark_all(&self, key: &str, members: &[String], ttl: Duration) -> StoreResult<Vec<String>>;

    async fn unmark(&self, key: &str, members: &[String]) -> StoreResult<()>;
}

/// Next `(count, stored value)` for a repetition window entry.
pub(crate) fn next_repetition(previous: Option<&str>, digest: &str) -> (u32, String) {
    let count = previous
        .and_then(|value| value.split_once(':'))
        .filter(|(_, last_digest)| *last_digest == digest)
        .and_then(|(count, _)| count.parse::<u32>().ok())
        .map(|count| (count + 1).min(MAX_REPETITION_COUNT))
        .unwrap_or(1);
    (count, format!("{count}:{digest}"))
}
