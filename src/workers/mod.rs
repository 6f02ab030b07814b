use std::{collections::HashMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::{
    error::CoreError,
    jobs::{mark_job_failed, mark_job_succeeded, reserve_job, retry_job_after, JobQueueError},
    models::Job,
    state::AppState,
};

pub mod broadcasts;
pub mod campaigns;
pub mod cron;

#[derive(Debug)]
pub enum JobExecution {
    Success,
    Retry { delay: Duration, error: String },
    Failed { error: String },
}

impl JobExecution {
    /// Bad input fails the job for good; anything else is worth another attempt.
    pub fn from_error(err: CoreError) -> Self {
        match err {
            CoreError::Validation(_)
            | CoreError::NotFound(_)
            | CoreError::Schedule(_)
            | CoreError::Serialization(_) => JobExecution::Failed {
                error: err.to_string(),
            },
            other => JobExecution::Retry {
                delay: Duration::from_secs(30),
                error: other.to_string(),
            },
        }
    }
}

#[async_trait]
pub trait JobHandler: Send + Sync {
    fn job_type(&self) -> &'static str;
    async fn handle(&self, state: Arc<AppState>, job: Job) -> JobExecution;
}

pub struct Worker {
    state: Arc<AppState>,
    handlers: HashMap<&'static str, Arc<dyn JobHandler>>,
    poll_interval: Duration,
}

impl Worker {
    pub fn new(
        state: Arc<AppState>,
        handlers: Vec<Arc<dyn JobHandler>>,
        poll_interval: Duration,
    ) -> Self {
        let map = handlers
            .into_iter()
            .map(|handler| (handler.job_type(), handler))
            .collect();
        Self {
            state,
            handlers: map,
            poll_interval,
        }
    }

    pub async fn run(&self) {
        info!(job_types = ?self.handlers.keys().collect::<Vec<_>>(), "worker started");
        loop {
            match self.tick().await {
                Ok(true) => {}
                Ok(false) => sleep(self.poll_interval).await,
                Err(err) => {
                    error!(error = %err, "worker tick failed");
                    sleep(self.poll_interval).await;
                }
            }
        }
    }

    /// Runs at most one job. Returns whether a job was found.
    pub async fn tick(&self) -> Result<bool, JobQueueError> {
        let job_types: Vec<&str> = self.handlers.keys().copied().collect();
        if job_types.is_empty() {
            return Ok(false);
        }

        let mut conn = match self.state.db() {
            Ok(conn) => conn,
            Err(err) => {
                error!(?err, "failed to obtain database connection in worker");
                return Ok(false);
            }
        };
        let Some(job) = reserve_job(&mut conn, &job_types)? else {
            return Ok(false);
        };
        drop(conn);

        let execution = match self.handlers.get(job.job_type.as_str()) {
            Some(handler) => handler.handle(self.state.clone(), job.clone()).await,
            None => JobExecution::Failed {
                error: "no handler registered".to_string(),
            },
        };
        self.record(&job, execution)?;
        Ok(true)
    }

    fn record(&self, job: &Job, execution: JobExecution) -> Result<(), JobQueueError> {
        let Ok(mut conn) = self.state.db() else {
            error!(job_id = %job.id, "failed to record job outcome due to pool error");
            return Ok(());
        };
        match execution {
            JobExecution::Success => {
                mark_job_succeeded(&mut conn, job.id)?;
                info!(job_id = %job.id, job_type = %job.job_type, "job completed successfully");
            }
            JobExecution::Retry { delay, error } => {
                warn!(job_id = %job.id, job_type = %job.job_type, attempts = job.attempts, %error, "job will retry");
                retry_job_after(&mut conn, job.id, delay, &error)?;
            }
            JobExecution::Failed { error } => {
                error!(job_id = %job.id, job_type = %job.job_type, %error, "job failed");
                mark_job_failed(&mut conn, job.id, &error)?;
            }
        }
        Ok(())
    }
}

pub fn default_handlers() -> Vec<Arc<dyn JobHandler>> {
    vec![
        Arc::new(broadcasts::SendBroadcastJob::new()),
        Arc::new(broadcasts::SendBroadcastBatchJob::new()),
        Arc::new(campaigns::FireCampaignEventJob::new()),
        Arc::new(campaigns::ScheduleCampaignEventJob::new()),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::campaigns::ScheduleError;

    #[test]
    fn bad_input_fails_and_infrastructure_retries() {
        assert!(matches!(
            JobExecution::from_error(CoreError::validation("no translations")),
            JobExecution::Failed { .. }
        ));
        assert!(matches!(
            JobExecution::from_error(ScheduleError::UnknownUnit("Y".to_string()).into()),
            JobExecution::Failed { .. }
        ));
        assert!(matches!(
            JobExecution::from_error(diesel::result::Error::RollbackTransaction.into()),
            JobExecution::Retry { .. }
        ));
    }
}
