use chrono::{DateTime, Duration, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use tracing::info;

use crate::ivr::ConnectionStatus;
use crate::msgs::{MsgFailedReason, MsgStatus};
use crate::schema::{channel_connections, msgs};

/// Force-fails connections still open but untouched for `stale_after`. Statuses only
/// ever move forward, so anything that old will not be heard about again.
pub fn sweep_stale_connections(
    conn: &mut PgConnection,
    stale_after: Duration,
    now: DateTime<Utc>,
) -> QueryResult<usize> {
    let open: Vec<&str> = ConnectionStatus::OPEN.iter().map(|status| status.as_code()).collect();
    let swept = diesel::update(
        channel_connections::table
            .filter(channel_connections::status.eq_any(open))
            .filter(channel_connections::modified_on.lt(now - stale_after)),
    )
    .set((
        channel_connections::status.eq(ConnectionStatus::Failed.as_code()),
        channel_connections::next_attempt.eq(None::<DateTime<Utc>>),
        channel_connections::ended_on.eq(Some(now)),
        channel_connections::modified_on.eq(now),
    ))
    .execute(conn)?;

    if swept > 0 {
        info!(count = swept, "failed stale channel connections");
    }
    Ok(swept)
}

/// Fails messages that never left our hands: still pending, queued or wired with no
/// callback for `stale_after`. Sent messages are left alone since many channels never
/// report delivery.
pub fn sweep_stale_msgs(
    conn: &mut PgConnection,
    stale_after: Duration,
    now: DateTime<Utc>,
) -> QueryResult<usize> {
    let stuck: Vec<&str> = [MsgStatus::Pending, MsgStatus::Queued, MsgStatus::Wired]
        .iter()
        .map(|status| status.as_code())
        .collect();
    let swept = diesel::update(
        msgs::table
            .filter(msgs::status.eq_any(stuck))
            .filter(msgs::modified_on.lt(now - stale_after)),
    )
    .set((
        msgs::status.eq(MsgStatus::Failed.as_code()),
        msgs::failed_reason.eq(Some(MsgFailedReason::TooOld.as_code())),
        msgs::next_attempt.eq(None::<DateTime<Utc>>),
        msgs::modified_on.eq(now),
    ))
    .execute(conn)?;

    if swept > 0 {
        info!(count = swept, "failed stale messages");
    }
    Ok(swept)
}
