//! Per-contact repetition windows used to catch messaging loops.

use std::time::Duration;

use chrono::{DateTime, DurationRound, Utc};
use sha2::{Digest, Sha256};
use tracing::warn;
use uuid::Uuid;

use crate::shared::SharedStore;

/// Messages whose identical text has been sent this many times in a row within one
/// window are failed as looping.
pub const LOOP_THRESHOLD: u32 = 20;

const WINDOW: Duration = Duration::from_secs(5 * 60);

pub fn window_key(now: DateTime<Utc>) -> String {
    let window = chrono::Duration::from_std(WINDOW).unwrap_or_else(|_| chrono::Duration::minutes(5));
    let start = now.duration_trunc(window).unwrap_or(now);
    format!("msg_repetitions:{}", start.format("%Y-%m-%dT%H:%M"))
}

pub fn text_digest(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// How many times in a row `contact_id` has now been sent `text` in the current
/// window. `None` when the store could not be reached, in which case nothing is
/// suppressed.
pub async fn record_repetition(
    store: &dyn SharedStore,
    contact_id: Uuid,
    text: &str,
    now: DateTime<Utc>,
) -> Option<u32> {
    let key = window_key(now);
    match store
        .record_repetition(&key, &contact_id.to_string(), &text_digest(text), WINDOW)
        .await
    {
        Ok(count) => Some(count),
        Err(err) => {
            warn!(%contact_id, error = %err, "repetition check unavailable, not suppressing");
            None
        }
    }
}

pub fn is_looping(count: Option<u32>) -> bool {
    count.is_some_and(|count| count >= LOOP_THRESHOLD)
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use chrono::TimeZone;

    use super::*;
    use crate::shared::{MemoryStore, StoreError, StoreResult};

    #[test]
    fn windows_are_five_minute_buckets() {
        let at = |m, s| Utc.with_ymd_and_hms(2024, 5, 1, 10, m, s).unwrap();
        assert_eq!(window_key(at(0, 0)), "msg_repetitions:2024-05-01T10:00");
        assert_eq!(window_key(at(4, 59)), "msg_repetitions:2024-05-01T10:00");
        assert_eq!(window_key(at(5, 0)), "msg_repetitions:2024-05-01T10:05");
    }

    #[tokio::test]
    async fn twentieth_identical_message_is_looping_and_new_text_resets() {
        let store = MemoryStore::new();
        let contact_id = Uuid::new_v4();
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 10, 1, 0).unwrap();

        let mut looping = Vec::new();
        for _ in 0..25 {
            let count = record_repetition(&store, contact_id, "Are you there?", now).await;
            looping.push(is_looping(count));
        }
        assert!(looping[..19].iter().all(|flag| !flag));
        assert!(looping[19..].iter().all(|flag| *flag));

        let count = record_repetition(&store, contact_id, "Something else", now).await;
        assert_eq!(count, Some(1));
    }

    #[tokio::test]
    async fn other_contacts_are_counted_separately() {
        let store = MemoryStore::new();
        let now = Utc::now();
        let first = Uuid::new_v4();
        for _ in 0..3 {
            record_repetition(&store, first, "hi", now).await;
        }
        assert_eq!(record_repetition(&store, Uuid::new_v4(), "hi", now).await, Some(1));
    }

    struct DownStore;

    #[async_trait]
    impl SharedStore for DownStore {
        async fn record_repetition(&self, _: &str, _: &str, _: &str, _: Duration) -> StoreResult<u32> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn try_lock(&self, _: &str, _: &str, _: Duration) -> StoreResult<bool> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn extend_lock(&self, _: &str, _: &str, _: Duration) -> StoreResult<bool> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn unlock(&self, _: &str, _: &str) -> StoreResult<bool> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn mark_all(&self, _: &str, _: &[String], _: Duration) -> StoreResult<Vec<String>> {
            Err(StoreError::Unavailable("down".into()))
        }
        async fn unmark(&self, _: &str, _: &[String]) -> StoreResult<()> {
            Err(StoreError::Unavailable("down".into()))
        }
    }

    #[tokio::test]
    async fn unavailable_store_never_suppresses() {
        let count = record_repetition(&DownStore, Uuid::new_v4(), "hi", Utc::now()).await;
        assert_eq!(count, None);
        assert!(!is_looping(count));
    }
}
