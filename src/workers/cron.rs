//! Periodic tasks. Each runs on every instance but only does work while holding its
//! lease, and each run is cut off after the configured task timeout.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::campaigns::queue_due_fires;
use crate::error::CoreResult;
use crate::locks::Locker;
use crate::retry::{
    expire_sessions, harvest_errored_calls, harvest_errored_msgs, sweep_stale_connections,
    sweep_stale_msgs,
};
use crate::state::AppState;

const LEASE_TTL: Duration = Duration::from_secs(30);

/// Runs `work` every `every` for as long as the process lives.
pub async fn run_cron<F, Fut>(state: Arc<AppState>, name: &'static str, every: Duration, work: F)
where
    F: Fn(Arc<AppState>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CoreResult<()>> + Send,
{
    let locker = Locker::new(state.store.clone(), name, LEASE_TTL);
    let task_timeout = state.config.task_timeout;
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    info!(task = name, every_secs = every.as_secs(), "cron task started");

    loop {
        ticker.tick().await;

        let lease = match locker.acquire().await {
            Ok(Some(lease)) => lease,
            Ok(None) => {
                debug!(task = name, "lease held elsewhere, skipping run");
                continue;
            }
            Err(err) => {
                warn!(task = name, error = %err, "shared store unavailable, skipping run");
                continue;
            }
        };

        let run = timeout(task_timeout, work(state.clone()));
        tokio::pin!(run);
        let mut heartbeat = interval(LEASE_TTL / 3);
        heartbeat.tick().await;

        let outcome = loop {
            tokio::select! {
                outcome = &mut run => break outcome,
                _ = heartbeat.tick() => {
                    if !matches!(locker.renew(&lease).await, Ok(true)) {
                        warn!(task = name, "lost lease while running");
                    }
                }
            }
        };

        match outcome {
            Ok(Ok(())) => debug!(task = name, "cron run finished"),
            Ok(Err(err)) => error!(task = name, error = %err, "cron run failed"),
            Err(_) => error!(task = name, timeout_secs = task_timeout.as_secs(), "cron run timed out"),
        }

        if let Err(err) = locker.release(lease).await {
            warn!(task = name, error = %err, "failed to release lease");
        }
    }
}

/// Spawns every periodic task and waits on them.
pub async fn run_all(state: Arc<AppState>) {
    let tasks = vec![
        tokio::spawn(run_cron(
            state.clone(),
            "campaign-fires",
            Duration::from_secs(60),
            |state| async move { queue_due_fires(&state, Utc::now()).await.map(|_| ()) },
        )),
        tokio::spawn(run_cron(
            state.clone(),
            "retry-msgs",
            Duration::from_secs(60),
            |state| async move { harvest_errored_msgs(&state, Utc::now()).await.map(|_| ()) },
        )),
        tokio::spawn(run_cron(
            state.clone(),
            "retry-calls",
            Duration::from_secs(60),
            |state| async move { harvest_errored_calls(&state, Utc::now()).await.map(|_| ()) },
        )),
        tokio::spawn(run_cron(
            state.clone(),
            "expire-sessions",
            Duration::from_secs(60),
            |state| async move { expire_sessions(&state, Utc::now()).await.map(|_| ()) },
        )),
        tokio::spawn(run_cron(
            state,
            "sweep-stale",
            Duration::from_secs(15 * 60),
            |state| async move {
                let pool = state.pool.clone();
                let stale_after = state.config.retry.stale_connection_after;
                task::spawn_blocking(move || -> CoreResult<()> {
                    let mut conn = pool.get()?;
                    let now = Utc::now();
                    sweep_stale_connections(&mut conn, stale_after, now)?;
                    sweep_stale_msgs(&mut conn, stale_after, now)?;
                    Ok(())
                })
                .await?
            },
        )),
    ];

    for handle in tasks {
        if let Err(err) = handle.await {
            error!(error = %err, "cron task panicked");
        }
    }
}
