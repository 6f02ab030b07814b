//! Named leases in the shared store, so a periodic task runs on one instance at a time.

use std::sync::Arc;
use std::time::Duration;

use crate::shared::{SharedStore, StoreResult};

/// Proof of holding a lock. Only the holder's token can renew or release it.
#[derive(Debug)]
pub struct Lease {
    key: String,
    token: String,
}

impl Lease {
    pub fn key(&self) -> &str {
        &self.key
    }
}

#[derive(Clone)]
pub struct Locker {
    store: Arc<dyn SharedStore>,
    key: String,
    ttl: Duration,
}

impl Locker {
    pub fn new(store: Arc<dyn SharedStore>, name: &str, ttl: Duration) -> Self {
        Self {
            store,
            key: format!("lock:{name}"),
            ttl,
        }
    }

    /// Takes the lock if it is free. `None` when someone else holds it.
    pub async fn acquire(&self) -> StoreResult<Option<Lease>> {
        let token = hex::encode(rand::random::<[u8; 16]>());
        if self.store.try_lock(&self.key, &token, self.ttl).await? {
            Ok(Some(Lease {
                key: self.key.clone(),
                token,
            }))
        } else {
            Ok(None)
        }
    }

    /// Pushes the expiry out by another TTL. False when the lease was lost.
    pub async fn renew(&self, lease: &Lease) -> StoreResult<bool> {
        self.store.extend_lock(&lease.key, &lease.token, self.ttl).await
    }

    /// Releases the lock unless it already expired and was taken by someone else.
    pub async fn release(&self, lease: Lease) -> StoreResult<bool> {
        self.store.unlock(&lease.key, &lease.token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shared::MemoryStore;

    #[tokio::test(start_paused = true)]
    async fn only_one_holder_at_a_time() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let first = Locker::new(store.clone(), "retry-msgs", Duration::from_secs(60));
        let second = Locker::new(store, "retry-msgs", Duration::from_secs(60));

        let lease = first.acquire().await.unwrap().expect("lock is free");
        assert_eq!(lease.key(), "lock:retry-msgs");
        assert!(second.acquire().await.unwrap().is_none());

        assert!(first.release(lease).await.unwrap());
        assert!(second.acquire().await.unwrap().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn expired_leases_cannot_be_renewed_or_released() {
        let store: Arc<dyn SharedStore> = Arc::new(MemoryStore::new());
        let slow = Locker::new(store.clone(), "campaign-fires", Duration::from_secs(10));
        let other = Locker::new(store, "campaign-fires", Duration::from_secs(10));

        let stale = slow.acquire().await.unwrap().unwrap();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(slow.renew(&stale).await.unwrap());
        tokio::time::advance(Duration::from_secs(11)).await;

        let fresh = other.acquire().await.unwrap().expect("expired lease is free again");
        assert!(!slow.renew(&stale).await.unwrap());
        assert!(!slow.release(stale).await.unwrap());
        assert!(other.release(fresh).await.unwrap());
    }
}
