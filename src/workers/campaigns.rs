use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::task;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::{
    assets::AssetKind,
    broadcasts::queue_broadcast,
    campaigns::{
        claim_fires, clear_queued_markers, schedule_campaign_event, unclaim_fires,
        FireCampaignEventPayload, FIRED_RESULT_FIRED, FIRED_RESULT_SKIPPED,
    },
    error::CoreResult,
    flows::{FlowStart, FlowTrigger},
    jobs::{JOB_FIRE_CAMPAIGN_EVENT, JOB_SCHEDULE_CAMPAIGN_EVENT},
    models::{EventFire, Job},
    state::AppState,
};

use super::{JobExecution, JobHandler};

/// Starts the event flow for a group of due fires.
pub struct FireCampaignEventJob;

impl FireCampaignEventJob {
    pub fn new() -> Self {
        Self
    }
}

async fn claim(state: &AppState, fire_ids: Vec<Uuid>, result: &'static str) -> CoreResult<Vec<EventFire>> {
    let pool = state.pool.clone();
    task::spawn_blocking(move || -> CoreResult<Vec<EventFire>> {
        let mut conn = pool.get()?;
        Ok(claim_fires(&mut conn, &fire_ids, result, Utc::now())?)
    })
    .await?
}

#[async_trait]
impl JobHandler for FireCampaignEventJob {
    fn job_type(&self) -> &'static str {
        JOB_FIRE_CAMPAIGN_EVENT
    }

    async fn handle(&self, state: Arc<AppState>, job: Job) -> JobExecution {
        let payload: FireCampaignEventPayload = match serde_json::from_value(job.payload.clone()) {
            Ok(payload) => payload,
            Err(err) => {
                return JobExecution::Failed {
                    error: format!("invalid campaign fire payload: {err}"),
                }
            }
        };
        let execution = fire_event(&state, &payload).await;
        clear_queued_markers(&state, &payload.fire_ids).await;
        execution
    }
}

async fn fire_event(state: &AppState, payload: &FireCampaignEventPayload) -> JobExecution {
    let assets = match state.org_assets(payload.org_id).await {
        Ok(assets) => assets,
        Err(err) => return JobExecution::from_error(err),
    };

    let target = assets
        .campaign_event(payload.event_id)
        .filter(|(_, event)| assets.flow(event.flow_id).is_some_and(|flow| flow.is_active))
        .map(|(campaign, event)| (campaign.id, event.flow_id));

    let Some((campaign_id, flow_id)) = target else {
        debug!(event_id = %payload.event_id, "event or its flow is gone, skipping fires");
        return match claim(state, payload.fire_ids.clone(), FIRED_RESULT_SKIPPED).await {
            Ok(skipped) => {
                info!(event_id = %payload.event_id, skipped = skipped.len(), "skipped campaign fires");
                JobExecution::Success
            }
            Err(err) => JobExecution::from_error(err),
        };
    };

    let claimed = match claim(state, payload.fire_ids.clone(), FIRED_RESULT_FIRED).await {
        Ok(claimed) => claimed,
        Err(err) => return JobExecution::from_error(err),
    };
    if claimed.is_empty() {
        debug!(event_id = %payload.event_id, "fires already claimed elsewhere");
        return JobExecution::Success;
    }

    let claimed_ids: Vec<Uuid> = claimed.iter().map(|fire| fire.id).collect();
    let start = FlowStart {
        org_id: payload.org_id,
        flow_id,
        contact_ids: claimed.iter().map(|fire| fire.contact_id).collect(),
        trigger: FlowTrigger::Campaign {
            campaign_id,
            event_id: payload.event_id,
        },
    };

    let started = match state.engine.start_flow(&start).await {
        Ok(started) => started,
        Err(err) => {
            warn!(event_id = %payload.event_id, error = %err, "flow start failed, returning fires to pending");
            let pool = state.pool.clone();
            let ids = claimed_ids.clone();
            let unclaimed = task::spawn_blocking(move || -> CoreResult<usize> {
                let mut conn = pool.get()?;
                Ok(unclaim_fires(&mut conn, &ids)?)
            })
            .await;
            if !matches!(unclaimed, Ok(Ok(_))) {
                error!(event_id = %payload.event_id, "failed to return fires to pending");
            }
            return JobExecution::Failed {
                error: format!("flow start failed: {err}"),
            };
        }
    };

    let sessions = started.session_ids.len();
    let broadcasts = started.broadcasts;
    if !broadcasts.is_empty() {
        let pool = state.pool.clone();
        let queued = task::spawn_blocking(move || -> CoreResult<usize> {
            let mut conn = pool.get()?;
            let count = broadcasts.len();
            for broadcast in broadcasts {
                queue_broadcast(&mut conn, broadcast)?;
            }
            Ok(count)
        })
        .await;
        match queued {
            Ok(Ok(count)) => debug!(event_id = %payload.event_id, count, "queued flow broadcasts"),
            Ok(Err(err)) => warn!(event_id = %payload.event_id, error = %err, "failed to queue flow broadcasts"),
            Err(err) => error!(event_id = %payload.event_id, error = %err, "broadcast queue task panicked"),
        }
    }

    info!(
        org_id = %payload.org_id,
        event_id = %payload.event_id,
        fired = claimed_ids.len(),
        sessions,
        "fired campaign event"
    );
    JobExecution::Success
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleCampaignEventPayload {
    pub org_id: Uuid,
    pub event_id: Uuid,
}

/// Schedules fires for a newly created or changed campaign event.
pub struct ScheduleCampaignEventJob;

impl ScheduleCampaignEventJob {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl JobHandler for ScheduleCampaignEventJob {
    fn job_type(&self) -> &'static str {
        JOB_SCHEDULE_CAMPAIGN_EVENT
    }

    async fn handle(&self, state: Arc<AppState>, job: Job) -> JobExecution {
        let payload: ScheduleCampaignEventPayload = match serde_json::from_value(job.payload.clone()) {
            Ok(payload) => payload,
            Err(err) => {
                return JobExecution::Failed {
                    error: format!("invalid schedule payload: {err}"),
                }
            }
        };

        let state_clone = state.clone();
        let result = task::spawn_blocking(move || -> CoreResult<usize> {
            let assets = state_clone
                .assets
                .refresh(payload.org_id, &[AssetKind::Campaigns, AssetKind::Flows])?;
            let mut conn = state_clone.pool.get()?;
            schedule_campaign_event(&mut conn, &assets, payload.event_id, Utc::now())
        })
        .await;

        match result {
            Ok(Ok(inserted)) => {
                info!(job_id = %job.id, inserted, "campaign event scheduled");
                JobExecution::Success
            }
            Ok(Err(err)) => JobExecution::from_error(err),
            Err(join_err) => {
                error!(job_id = %job.id, error = %join_err, "schedule task panicked");
                JobExecution::Retry {
                    delay: Duration::from_secs(60),
                    error: format!("worker panicked: {join_err}"),
                }
            }
        }
    }
}
