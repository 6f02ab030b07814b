use std::collections::HashMap;

use chrono::{DateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use tokio::task;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::CoreResult;
use crate::ivr::{set_connection_status, ConnectionStatus};
use crate::models::{ChannelConnection, FlowSession};
use crate::schema::{channel_connections, flow_sessions};
use crate::state::AppState;

pub const SESSION_WAITING: &str = "W";
pub const SESSION_EXPIRED: &str = "X";

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExpirySummary {
    pub expired: usize,
    pub hung_up: usize,
    pub skipped: usize,
}

fn load_expired_sessions(
    conn: &mut PgConnection,
    now: DateTime<Utc>,
    limit: i64,
) -> QueryResult<Vec<FlowSession>> {
    flow_sessions::table
        .filter(flow_sessions::status.eq(SESSION_WAITING))
        .filter(flow_sessions::wait_expires_on.le(now))
        .order(flow_sessions::wait_expires_on.asc())
        .limit(limit)
        .load(conn)
}

fn expire_session_rows(conn: &mut PgConnection, session_ids: &[Uuid], now: DateTime<Utc>) -> QueryResult<usize> {
    if session_ids.is_empty() {
        return Ok(0);
    }
    diesel::update(
        flow_sessions::table
            .filter(flow_sessions::id.eq_any(session_ids))
            .filter(flow_sessions::status.eq(SESSION_WAITING)),
    )
    .set((
        flow_sessions::status.eq(SESSION_EXPIRED),
        flow_sessions::ended_on.eq(Some(now)),
    ))
    .execute(conn)
}

/// Expires the session and completes its call in one transaction.
fn expire_with_connection(
    conn: &mut PgConnection,
    session_id: Uuid,
    connection_id: Uuid,
    now: DateTime<Utc>,
) -> QueryResult<()> {
    conn.transaction(|conn| {
        expire_session_rows(conn, &[session_id], now)?;
        set_connection_status(conn, connection_id, ConnectionStatus::Completed, now)?;
        Ok(())
    })
}

/// Ends waiting sessions whose wait has run out. A session on a live call is only
/// expired once the provider has hung the call up; if that fails, both are left as
/// they are and the next pass tries again.
pub async fn expire_sessions(state: &AppState, now: DateTime<Utc>) -> CoreResult<ExpirySummary> {
    let pool = state.pool.clone();
    let limit = state.config.retry.batch_size;
    let (sessions, connections) = task::spawn_blocking(
        move || -> CoreResult<(Vec<FlowSession>, HashMap<Uuid, ChannelConnection>)> {
            let mut conn = pool.get()?;
            let sessions = load_expired_sessions(&mut conn, now, limit)?;
            let connection_ids: Vec<Uuid> = sessions.iter().filter_map(|s| s.connection_id).collect();
            let connections = if connection_ids.is_empty() {
                HashMap::new()
            } else {
                channel_connections::table
                    .filter(channel_connections::id.eq_any(&connection_ids))
                    .load::<ChannelConnection>(&mut conn)?
                    .into_iter()
                    .map(|connection| (connection.id, connection))
                    .collect()
            };
            Ok((sessions, connections))
        },
    )
    .await??;

    let mut summary = ExpirySummary::default();
    if sessions.is_empty() {
        return Ok(summary);
    }

    let (on_call, plain): (Vec<FlowSession>, Vec<FlowSession>) = sessions.into_iter().partition(|session| {
        session
            .connection_id
            .and_then(|id| connections.get(&id))
            .and_then(|connection| connection.status())
            .is_some_and(|status| !status.is_terminal())
    });

    let plain_ids: Vec<Uuid> = plain.iter().map(|session| session.id).collect();
    let pool = state.pool.clone();
    summary.expired += task::spawn_blocking(move || -> CoreResult<usize> {
        let mut conn = pool.get()?;
        Ok(expire_session_rows(&mut conn, &plain_ids, now)?)
    })
    .await??;

    for session in on_call {
        let Some(connection) = session.connection_id.and_then(|id| connections.get(&id)) else {
            continue;
        };

        let channel = match state.org_assets(session.org_id).await {
            Ok(assets) => assets.channel(connection.channel_id).cloned(),
            Err(err) => {
                warn!(session_id = %session.id, error = %err, "failed to load org assets, skipping session");
                summary.skipped += 1;
                continue;
            }
        };

        if let (Some(channel), Some(external_id)) = (channel, connection.external_id.as_deref()) {
            if let Err(err) = state.calls.hangup(&channel, external_id).await {
                warn!(
                    session_id = %session.id,
                    connection_id = %connection.id,
                    error = %err,
                    "hangup failed, leaving session waiting"
                );
                summary.skipped += 1;
                continue;
            }
            summary.hung_up += 1;
        } else {
            debug!(connection_id = %connection.id, "nothing to hang up");
        }

        let pool = state.pool.clone();
        let (session_id, connection_id) = (session.id, connection.id);
        task::spawn_blocking(move || -> CoreResult<()> {
            let mut conn = pool.get()?;
            Ok(expire_with_connection(&mut conn, session_id, connection_id, Utc::now())?)
        })
        .await??;
        summary.expired += 1;
    }

    info!(
        expired = summary.expired,
        hung_up = summary.hung_up,
        skipped = summary.skipped,
        "expired waiting sessions"
    );
    Ok(summary)
}
