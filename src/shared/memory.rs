use std::collections::{hash_map, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;

use super::{next_repetition, SharedStore, StoreResult};

#[derive(Debug, Clone)]
struct Expiring<T> {
    value: T,
    expires_at: Instant,
}

impl<T: Default> Expiring<T> {
    fn fresh(ttl: Duration) -> Self {
        Self {
            value: T::default(),
            expires_at: Instant::now() + ttl,
        }
    }

    /// Resets an expired value in place and pushes the expiry out by `ttl`.
    fn touch(&mut self, ttl: Duration) -> &mut T {
        let now = Instant::now();
        if self.expires_at <= now {
            self.value = T::default();
        }
        self.expires_at = now + ttl;
        &mut self.value
    }
}

impl<T> Expiring<T> {
    fn live(&self) -> bool {
        self.expires_at > Instant::now()
    }
}

/// Process-local store. Every operation on a key runs under its dashmap shard lock,
/// which makes each call atomic with respect to other callers in this process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    hashes: DashMap<String, Expiring<HashMap<String, String>>>,
    leases: DashMap<String, Expiring<String>>,
    markers: DashMap<String, HashMap<String, Instant>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    async fn record_repetition(
        &self,
        key: &str,
        member: &str,
        digest: &str,
        ttl: Duration,
    ) -> StoreResult<u32> {
        self.hashes.retain(|_, window| window.live());

        let mut window = self
            .hashes
            .entry(key.to_string())
            .or_insert_with(|| Expiring::fresh(ttl));
        let fields = window.touch(ttl);
        let (count, stored) = next_repetition(fields.get(member).map(String::as_str), digest);
        fields.insert(member.to_string(), stored);
        Ok(count)
    }

    async fn try_lock(&self, key: &str, token: &str, ttl: Duration) -> StoreResult<bool> {
        let lease = Expiring {
            value: token.to_string(),
            expires_at: Instant::now() + ttl,
        };
        match self.leases.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().live() {
                    return Ok(false);
                }
                occupied.insert(lease);
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(lease);
                Ok(true)
            }
        }
    }

    async fn extend_lock(&self, key: &str, token: &str, ttl: Duration) -> StoreResult<bool> {
        let Some(mut lease) = self.leases.get_mut(key) else {
            return Ok(false);
        };
        if !lease.live() || lease.value != token {
            return Ok(false);
        }
        lease.expires_at = Instant::now() + ttl;
        Ok(true)
    }

    async fn unlock(&self, key: &str, token: &str) -> StoreResult<bool> {
        let removed = self
            .leases
            .remove_if(key, |_, lease| lease.live() && lease.value == token)
            .is_some();
        Ok(removed)
    }

    async fn mark_all(&self, key: &str, members: &[String], ttl: Duration) -> StoreResult<Vec<String>> {
        let now = Instant::now();
        let mut markers = self.markers.entry(key.to_string()).or_default();
        markers.retain(|_, expires_at| *expires_at > now);

        let mut added = Vec::new();
        for member in members {
            if let hash_map::Entry::Vacant(vacant) = markers.entry(member.clone()) {
                vacant.insert(now + ttl);
                added.push(member.clone());
            }
        }
        Ok(added)
    }

    async fn unmark(&self, key: &str, members: &[String]) -> StoreResult<()> {
        if let Some(mut markers) = self.markers.get_mut(key) {
            for member in members {
                markers.remove(member);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_secs(300);

    #[tokio::test(start_paused = true)]
    async fn repetition_windows_expire() {
        let store = MemoryStore::new();
        assert_eq!(store.record_repetition("w", "c1", "d", TTL).await.unwrap(), 1);
        assert_eq!(store.record_repetition("w", "c1", "d", TTL).await.unwrap(), 2);
        assert_eq!(store.record_repetition("w", "c2", "d", TTL).await.unwrap(), 1);

        tokio::time::advance(TTL + Duration::from_secs(1)).await;
        assert_eq!(store.record_repetition("w", "c1", "d", TTL).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn locks_are_exclusive_until_released_or_expired() {
        let store = MemoryStore::new();
        assert!(store.try_lock("lock:a", "one", TTL).await.unwrap());
        assert!(!store.try_lock("lock:a", "two", TTL).await.unwrap());

        assert!(!store.unlock("lock:a", "two").await.unwrap());
        assert!(store.extend_lock("lock:a", "one", TTL).await.unwrap());
        assert!(!store.extend_lock("lock:a", "two", TTL).await.unwrap());
        assert!(store.unlock("lock:a", "one").await.unwrap());
        assert!(store.try_lock("lock:a", "two", TTL).await.unwrap());

        tokio::time::advance(TTL + Duration::from_secs(1)).await;
        assert!(store.try_lock("lock:a", "three", TTL).await.unwrap());
    }

    fn ids(members: &[&str]) -> Vec<String> {
        members.iter().map(|member| member.to_string()).collect()
    }

    #[tokio::test]
    async fn markers_report_first_insert_only() {
        let store = MemoryStore::new();
        assert_eq!(store.mark_all("queued", &ids(&["f1", "f2"]), TTL).await.unwrap(), ids(&["f1", "f2"]));
        assert_eq!(store.mark_all("queued", &ids(&["f1", "f3"]), TTL).await.unwrap(), ids(&["f3"]));

        store.unmark("queued", &ids(&["f1"])).await.unwrap();
        assert_eq!(store.mark_all("queued", &ids(&["f1"]), TTL).await.unwrap(), ids(&["f1"]));
    }

    #[tokio::test(start_paused = true)]
    async fn each_marker_expires_on_its_own() {
        let store = MemoryStore::new();
        let ttl = Duration::from_secs(60 * 60);
        assert_eq!(store.mark_all("queued", &ids(&["f1"]), ttl).await.unwrap(), ids(&["f1"]));

        // other fires keep getting marked every minute; f1's marker still runs out
        let mut requeued_after = None;
        for minute in 1..=6 * 60 {
            tokio::time::advance(Duration::from_secs(60)).await;
            let other = format!("other-{minute}");
            store.mark_all("queued", &[other], ttl).await.unwrap();
            if !store.mark_all("queued", &ids(&["f1"]), ttl).await.unwrap().is_empty() {
                requeued_after = Some(minute);
                break;
            }
        }
        assert_eq!(requeued_after, Some(60));
    }
}
