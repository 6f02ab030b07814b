//! A fixed number of concurrent workers sharing one request budget.

use std::future::Future;
use std::time::Duration;

use futures_util::stream::{self, StreamExt};
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};

/// Hands out evenly spaced request slots. Every caller reserves the next free slot
/// under the lock and then waits for it outside the lock, so any number of workers
/// together stay under the configured rate.
#[derive(Debug)]
pub struct RateLimiter {
    interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn per_second(requests: u32) -> Self {
        let requests = requests.max(1);
        Self {
            interval: Duration::from_secs(1) / requests,
            next_slot: Mutex::new(None),
        }
    }

    pub async fn acquire(&self) {
        let slot = {
            let mut next_slot = self.next_slot.lock().await;
            let now = Instant::now();
            let slot = next_slot.map_or(now, |next| next.max(now));
            *next_slot = Some(slot + self.interval);
            slot
        };
        sleep_until(slot).await;
    }
}

pub struct WorkerPool {
    workers: usize,
    limiter: RateLimiter,
}

impl WorkerPool {
    pub fn new(workers: usize, requests_per_second: u32) -> Self {
        Self {
            workers: workers.max(1),
            limiter: RateLimiter::per_second(requests_per_second),
        }
    }

    /// Runs `work` over every item with at most `workers` in flight, each call waiting
    /// for its rate slot first. Results come back in completion order.
    pub async fn run<T, O, F, Fut>(&self, items: Vec<T>, work: F) -> Vec<O>
    where
        F: Fn(T) -> Fut,
        Fut: Future<Output = O>,
    {
        let limiter = &self.limiter;
        let work = &work;
        stream::iter(items)
            .map(|item| async move {
                limiter.acquire().await;
                work(item).await
            })
            .buffer_unordered(self.workers)
            .collect()
            .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn workers_share_the_rate_ceiling() {
        let pool = WorkerPool::new(8, 5);
        let start = Instant::now();
        let stamps = Arc::new(std::sync::Mutex::new(Vec::new()));

        let recorded = stamps.clone();
        pool.run((0..20).collect(), |_: u32| {
            let recorded = recorded.clone();
            async move {
                recorded.lock().unwrap().push(start.elapsed());
            }
        })
        .await;

        let stamps = stamps.lock().unwrap().clone();
        assert_eq!(stamps.len(), 20);
        for window_start in 0..4u64 {
            let from = Duration::from_secs(window_start);
            let to = from + Duration::from_secs(1);
            let in_window = stamps.iter().filter(|at| **at >= from && **at < to).count();
            assert!(in_window <= 5, "{in_window} requests in second {window_start}");
        }
        assert!(start.elapsed() >= Duration::from_millis(3800));
    }

    #[tokio::test(start_paused = true)]
    async fn idle_limiter_does_not_bank_slots() {
        let limiter = RateLimiter::per_second(10);
        limiter.acquire().await;
        tokio::time::sleep(Duration::from_secs(5)).await;

        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert_eq!(start.elapsed(), Duration::from_millis(100));
    }
}
