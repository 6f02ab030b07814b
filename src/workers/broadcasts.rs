use std::sync::Arc;

use async_trait::async_trait;
use tokio::task;
use tracing::{error, info, warn};

use crate::{
    broadcasts::{create_messages, mark_broadcast_sent, queue_batches, Broadcast, BroadcastBatch},
    delivery::send_msgs,
    error::CoreResult,
    jobs::{JOB_SEND_BROADCAST, JOB_SEND_BROADCAST_BATCH},
    models::Job,
    state::AppState,
};

use super::{JobExecution, JobHandler};

/// Splits a broadcast into batch jobs.
pub struct SendBroadcastJob;

impl SendBroadcastJob {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl JobHandler for SendBroadcastJob {
    fn job_type(&self) -> &'static str {
        JOB_SEND_BROADCAST
    }

    async fn handle(&self, state: Arc<AppState>, job: Job) -> JobExecution {
        let broadcast: Broadcast = match serde_json::from_value(job.payload.clone()) {
            Ok(broadcast) => broadcast,
            Err(err) => {
                return JobExecution::Failed {
                    error: format!("invalid broadcast payload: {err}"),
                }
            }
        };
        let broadcast_id = broadcast.id;

        let pool = state.pool.clone();
        let result = task::spawn_blocking(move || -> CoreResult<usize> {
            let mut conn = pool.get()?;
            queue_batches(&mut conn, broadcast)
        })
        .await;

        match result {
            Ok(Ok(batches)) => {
                info!(job_id = %job.id, ?broadcast_id, batches, "broadcast split into batches");
                JobExecution::Success
            }
            Ok(Err(err)) => {
                warn!(job_id = %job.id, ?broadcast_id, error = %err, "failed to split broadcast");
                JobExecution::from_error(err)
            }
            Err(join_err) => {
                error!(job_id = %job.id, error = %join_err, "broadcast split task panicked");
                JobExecution::Retry {
                    delay: std::time::Duration::from_secs(60),
                    error: format!("worker panicked: {join_err}"),
                }
            }
        }
    }
}

/// Creates and sends the messages of one batch.
pub struct SendBroadcastBatchJob;

impl SendBroadcastBatchJob {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl JobHandler for SendBroadcastBatchJob {
    fn job_type(&self) -> &'static str {
        JOB_SEND_BROADCAST_BATCH
    }

    async fn handle(&self, state: Arc<AppState>, job: Job) -> JobExecution {
        let batch: BroadcastBatch = match serde_json::from_value(job.payload.clone()) {
            Ok(batch) => batch,
            Err(err) => {
                return JobExecution::Failed {
                    error: format!("invalid broadcast batch payload: {err}"),
                }
            }
        };

        let assets = match state.org_assets(batch.org_id).await {
            Ok(assets) => assets,
            Err(err) => return JobExecution::from_error(err),
        };

        let msgs = match create_messages(&state, &assets, &batch).await {
            Ok(msgs) => msgs,
            Err(err) => {
                warn!(job_id = %job.id, broadcast_id = ?batch.broadcast_id, error = %err, "failed to create batch messages");
                return JobExecution::from_error(err);
            }
        };

        // messages exist from here on; retrying the job would create them twice
        if let Err(err) = send_msgs(&state, &assets, &msgs).await {
            return JobExecution::Failed {
                error: format!("messages created but sending stopped: {err}"),
            };
        }

        if let (true, Some(broadcast_id)) = (batch.is_last, batch.broadcast_id) {
            let pool = state.pool.clone();
            let marked = task::spawn_blocking(move || -> CoreResult<usize> {
                let mut conn = pool.get()?;
                Ok(mark_broadcast_sent(&mut conn, broadcast_id)?)
            })
            .await;
            if !matches!(marked, Ok(Ok(_))) {
                warn!(%broadcast_id, "failed to mark broadcast as sent");
            }
        }

        JobExecution::Success
    }
}
