//! Replays errored messages and calls once their next attempt is due, and cleans up
//! connections and sessions nobody is going to hear back about.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use tokio::task;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::assets::OrgAssets;
use crate::contacts::contact_urn;
use crate::delivery::{after_error, send_msg};
use crate::error::CoreResult;
use crate::ivr::{
    mark_connection_errored, mark_connection_wired, mark_connections_failed, CallOutcome,
    ConnectionStatus,
};
use crate::models::{ChannelConnection, Msg};
use crate::msgs::{mark_msgs_failed, MsgFailedReason, MsgStatus};
use crate::schema::{channel_connections, msgs};
use crate::state::AppState;

pub mod expiry;
pub mod pool;
pub mod sweep;

pub use expiry::{expire_sessions, ExpirySummary};
pub use pool::{RateLimiter, WorkerPool};
pub use sweep::{sweep_stale_connections, sweep_stale_msgs};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RetrySummary {
    pub harvested: usize,
    pub retried: usize,
    pub failed: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Triage {
    Retry,
    Fail(MsgFailedReason),
}

fn triage_msg(msg: &Msg, assets: &OrgAssets, now: DateTime<Utc>, max_age: Duration) -> Triage {
    match msg.channel_id {
        None => Triage::Fail(MsgFailedReason::NoDestination),
        Some(channel_id) if assets.channel(channel_id).is_none() => {
            Triage::Fail(MsgFailedReason::ChannelRemoved)
        }
        Some(_) if msg.created_on < now - max_age => Triage::Fail(MsgFailedReason::TooOld),
        Some(_) => Triage::Retry,
    }
}

fn load_errored_msgs(conn: &mut PgConnection, now: DateTime<Utc>, limit: i64) -> QueryResult<Vec<Msg>> {
    msgs::table
        .filter(msgs::status.eq(MsgStatus::Errored.as_code()))
        .filter(msgs::next_attempt.le(now))
        .order(msgs::next_attempt.asc())
        .limit(limit)
        .load(conn)
}

fn load_errored_connections(
    conn: &mut PgConnection,
    now: DateTime<Utc>,
    limit: i64,
) -> QueryResult<Vec<ChannelConnection>> {
    channel_connections::table
        .filter(channel_connections::status.eq(ConnectionStatus::Errored.as_code()))
        .filter(channel_connections::next_attempt.le(now))
        .order(channel_connections::next_attempt.asc())
        .limit(limit)
        .load(conn)
}

/// Snapshots for every org in `org_ids`. Orgs whose assets cannot be loaded are left
/// out and their rows wait for the next tick.
async fn assets_for_orgs(
    state: &AppState,
    org_ids: impl IntoIterator<Item = Uuid>,
) -> HashMap<Uuid, Arc<OrgAssets>> {
    let mut loaded = HashMap::new();
    for org_id in org_ids {
        if loaded.contains_key(&org_id) {
            continue;
        }
        match state.org_assets(org_id).await {
            Ok(assets) => {
                loaded.insert(org_id, assets);
            }
            Err(err) => warn!(%org_id, error = %err, "failed to load org assets for retry"),
        }
    }
    loaded
}

async fn fail_msgs(state: &AppState, ids: Vec<Uuid>, reason: MsgFailedReason) -> CoreResult<usize> {
    if ids.is_empty() {
        return Ok(0);
    }
    let pool = state.pool.clone();
    let failed = task::spawn_blocking(move || -> CoreResult<usize> {
        let mut conn = pool.get()?;
        Ok(mark_msgs_failed(&mut conn, &ids, reason, Utc::now())?)
    })
    .await??;
    info!(count = failed, reason = reason.as_code(), "failed errored messages");
    Ok(failed)
}

/// Re-resolves the message's URN and sends it again.
async fn retry_msg(state: &AppState, assets: &OrgAssets, msg: &Msg) -> CoreResult<MsgStatus> {
    let urn = match msg.contact_urn_id {
        Some(urn_id) => {
            let pool = state.pool.clone();
            let contact_id = msg.contact_id;
            task::spawn_blocking(move || -> CoreResult<_> {
                let mut conn = pool.get()?;
                Ok(contact_urn(&mut conn, contact_id, urn_id)?)
            })
            .await??
        }
        None => None,
    };

    if urn.is_none() {
        debug!(msg_id = %msg.id, "urn is gone, failing message");
        fail_msgs(state, vec![msg.id], MsgFailedReason::NoDestination).await?;
        return Ok(MsgStatus::Failed);
    }

    send_msg(state, assets, msg).await
}

/// One pass over errored messages whose next attempt is due.
pub async fn harvest_errored_msgs(state: &AppState, now: DateTime<Utc>) -> CoreResult<RetrySummary> {
    let retry = state.config.retry.clone();
    let pool = state.pool.clone();
    let batch_size = retry.batch_size;
    let errored = task::spawn_blocking(move || -> CoreResult<Vec<Msg>> {
        let mut conn = pool.get()?;
        Ok(load_errored_msgs(&mut conn, now, batch_size)?)
    })
    .await??;

    let mut summary = RetrySummary {
        harvested: errored.len(),
        ..RetrySummary::default()
    };
    if errored.is_empty() {
        return Ok(summary);
    }

    let assets_by_org = assets_for_orgs(state, errored.iter().map(|msg| msg.org_id).collect::<Vec<_>>()).await;

    let mut to_fail: HashMap<&'static str, (MsgFailedReason, Vec<Uuid>)> = HashMap::new();
    let mut to_retry = Vec::new();
    for msg in errored {
        let Some(assets) = assets_by_org.get(&msg.org_id) else {
            continue;
        };
        match triage_msg(&msg, assets, now, retry.msg_max_age) {
            Triage::Retry => to_retry.push((assets.clone(), msg)),
            Triage::Fail(reason) => to_fail
                .entry(reason.as_code())
                .or_insert_with(|| (reason, Vec::new()))
                .1
                .push(msg.id),
        }
    }

    for (_, (reason, ids)) in to_fail {
        summary.failed += fail_msgs(state, ids, reason).await?;
    }

    let workers = WorkerPool::new(retry.workers, retry.max_requests_per_second);
    let results = workers
        .run(to_retry, |(assets, msg): (Arc<OrgAssets>, Msg)| async move {
            let result = retry_msg(state, &assets, &msg).await;
            (msg.id, result)
        })
        .await;

    for (msg_id, result) in results {
        match result {
            Ok(MsgStatus::Failed) => summary.failed += 1,
            Ok(_) => summary.retried += 1,
            Err(err) => {
                summary.errors += 1;
                warn!(%msg_id, error = %err, "message retry failed");
            }
        }
    }

    info!(
        harvested = summary.harvested,
        retried = summary.retried,
        failed = summary.failed,
        errors = summary.errors,
        "retried errored messages"
    );
    Ok(summary)
}

async fn fail_connections(state: &AppState, ids: Vec<Uuid>) -> CoreResult<usize> {
    if ids.is_empty() {
        return Ok(0);
    }
    let pool = state.pool.clone();
    let failed = task::spawn_blocking(move || -> CoreResult<usize> {
        let mut conn = pool.get()?;
        Ok(mark_connections_failed(&mut conn, &ids, Utc::now())?)
    })
    .await??;
    Ok(failed)
}

async fn retry_call(
    state: &AppState,
    assets: &OrgAssets,
    connection: &ChannelConnection,
) -> CoreResult<ConnectionStatus> {
    let Some(channel) = assets.channel(connection.channel_id) else {
        fail_connections(state, vec![connection.id]).await?;
        return Ok(ConnectionStatus::Failed);
    };

    let pool = state.pool.clone();
    let (contact_id, urn_id) = (connection.contact_id, connection.contact_urn_id);
    let urn = task::spawn_blocking(move || -> CoreResult<_> {
        let mut conn = pool.get()?;
        Ok(contact_urn(&mut conn, contact_id, urn_id)?)
    })
    .await??;
    let Some(urn) = urn else {
        debug!(connection_id = %connection.id, "urn is gone, failing call");
        fail_connections(state, vec![connection.id]).await?;
        return Ok(ConnectionStatus::Failed);
    };

    let outcome = match state.calls.request_call(channel, connection.id, &urn.identity).await {
        Ok(outcome) => outcome,
        Err(err) => CallOutcome::Rejected {
            reason: err.to_string(),
        },
    };

    let pool = state.pool.clone();
    let retry = state.config.retry.clone();
    let connection_id = connection.id;
    let previous_errors = connection.error_count;
    let status = task::spawn_blocking(move || -> CoreResult<ConnectionStatus> {
        let mut conn = pool.get()?;
        let now = Utc::now();
        match outcome {
            CallOutcome::Accepted { external_id } => {
                mark_connection_wired(&mut conn, connection_id, &external_id, now)?;
                Ok(ConnectionStatus::Wired)
            }
            CallOutcome::Throttled => {
                let next_attempt = now + retry.backoff_for(previous_errors.max(1));
                mark_connection_errored(&mut conn, connection_id, previous_errors, next_attempt, now)?;
                Ok(ConnectionStatus::Errored)
            }
            CallOutcome::Rejected { reason } => {
                debug!(%connection_id, %reason, "call request rejected");
                let error_count = previous_errors + 1;
                match after_error(&retry, error_count, now) {
                    Ok(next_attempt) => {
                        mark_connection_errored(&mut conn, connection_id, error_count, next_attempt, now)?;
                        Ok(ConnectionStatus::Errored)
                    }
                    Err(_) => {
                        mark_connections_failed(&mut conn, &[connection_id], now)?;
                        Ok(ConnectionStatus::Failed)
                    }
                }
            }
        }
    })
    .await??;
    Ok(status)
}

/// One pass over errored outgoing calls whose next attempt is due.
pub async fn harvest_errored_calls(state: &AppState, now: DateTime<Utc>) -> CoreResult<RetrySummary> {
    let retry = state.config.retry.clone();
    let pool = state.pool.clone();
    let batch_size = retry.batch_size;
    let errored = task::spawn_blocking(move || -> CoreResult<Vec<ChannelConnection>> {
        let mut conn = pool.get()?;
        Ok(load_errored_connections(&mut conn, now, batch_size)?)
    })
    .await??;

    let mut summary = RetrySummary {
        harvested: errored.len(),
        ..RetrySummary::default()
    };
    if errored.is_empty() {
        return Ok(summary);
    }

    let assets_by_org = assets_for_orgs(state, errored.iter().map(|c| c.org_id).collect::<Vec<_>>()).await;
    let to_retry: Vec<(Arc<OrgAssets>, ChannelConnection)> = errored
        .into_iter()
        .filter_map(|connection| {
            assets_by_org
                .get(&connection.org_id)
                .map(|assets| (assets.clone(), connection))
        })
        .collect();

    let workers = WorkerPool::new(retry.workers, retry.max_requests_per_second);
    let results = workers
        .run(to_retry, |(assets, connection): (Arc<OrgAssets>, ChannelConnection)| async move {
            let result = retry_call(state, &assets, &connection).await;
            (connection.id, result)
        })
        .await;

    for (connection_id, result) in results {
        match result {
            Ok(ConnectionStatus::Failed) => summary.failed += 1,
            Ok(_) => summary.retried += 1,
            Err(err) => {
                summary.errors += 1;
                warn!(%connection_id, error = %err, "call retry failed");
            }
        }
    }

    info!(
        harvested = summary.harvested,
        retried = summary.retried,
        failed = summary.failed,
        errors = summary.errors,
        "retried errored calls"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assets::{fixtures, ChannelRole};

    fn errored_msg(channel_id: Option<Uuid>, created_on: DateTime<Utc>) -> Msg {
        Msg {
            id: Uuid::new_v4(),
            org_id: Uuid::new_v4(),
            broadcast_id: None,
            channel_id,
            contact_id: Uuid::new_v4(),
            contact_urn_id: Some(Uuid::new_v4()),
            urn: Some("tel:+1555".to_string()),
            text: "hi".to_string(),
            attachments: vec![],
            quick_replies: vec![],
            status: "E".to_string(),
            failed_reason: None,
            error_count: 1,
            next_attempt: Some(created_on),
            external_id: None,
            topup_id: None,
            created_on,
            modified_on: created_on,
            sent_on: None,
        }
    }

    #[test]
    fn triage_fails_removed_channels_and_old_messages() {
        let org = fixtures::org(chrono_tz::UTC);
        let channel = fixtures::channel(org.id, "tel", &[ChannelRole::Send]);
        let assets = OrgAssets::new(org).with_channels(vec![channel.clone()]);
        let now = Utc::now();
        let max_age = Duration::days(7);

        let fresh = errored_msg(Some(channel.id), now - Duration::hours(1));
        assert_eq!(triage_msg(&fresh, &assets, now, max_age), Triage::Retry);

        let old = errored_msg(Some(channel.id), now - Duration::days(8));
        assert_eq!(
            triage_msg(&old, &assets, now, max_age),
            Triage::Fail(MsgFailedReason::TooOld)
        );

        let orphaned = errored_msg(Some(Uuid::new_v4()), now - Duration::days(8));
        assert_eq!(
            triage_msg(&orphaned, &assets, now, max_age),
            Triage::Fail(MsgFailedReason::ChannelRemoved)
        );

        let nowhere = errored_msg(None, now);
        assert_eq!(
            triage_msg(&nowhere, &assets, now, max_age),
            Triage::Fail(MsgFailedReason::NoDestination)
        );
    }
}
