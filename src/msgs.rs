//! Outbound message rows: status codes, quota billing and the bulk writes used by
//! dispatch, delivery and retries.

use chrono::{DateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use diesel::sql_types;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Msg, NewMsg};
use crate::schema::msgs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsgStatus {
    Pending,
    Queued,
    Wired,
    Sent,
    Delivered,
    Handled,
    Errored,
    Failed,
    Resent,
}

impl MsgStatus {
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "P" => Some(Self::Pending),
            "Q" => Some(Self::Queued),
            "W" => Some(Self::Wired),
            "S" => Some(Self::Sent),
            "D" => Some(Self::Delivered),
            "H" => Some(Self::Handled),
            "E" => Some(Self::Errored),
            "F" => Some(Self::Failed),
            "R" => Some(Self::Resent),
            _ => None,
        }
    }

    pub fn as_code(&self) -> &'static str {
        match self {
            Self::Pending => "P",
            Self::Queued => "Q",
            Self::Wired => "W",
            Self::Sent => "S",
            Self::Delivered => "D",
            Self::Handled => "H",
            Self::Errored => "E",
            Self::Failed => "F",
            Self::Resent => "R",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Handled | Self::Failed | Self::Resent)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Queued | Self::Errored => 1,
            Self::Wired => 2,
            Self::Sent => 3,
            Self::Delivered | Self::Handled | Self::Failed | Self::Resent => 4,
        }
    }

    /// Whether a status callback may move a message from `self` to `next`. Statuses
    /// only move forward; erroring is allowed until the message leaves our hands.
    pub fn can_become(&self, next: MsgStatus) -> bool {
        if self.is_terminal() || *self == next {
            return false;
        }
        match next {
            Self::Failed => true,
            Self::Errored => matches!(self, Self::Pending | Self::Queued | Self::Wired | Self::Errored),
            _ => next.rank() > self.rank(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsgFailedReason {
    Suspended,
    Looping,
    ErrorLimit,
    TooOld,
    NoDestination,
    SuspendedTemplate,
    ChannelRemoved,
}

impl MsgFailedReason {
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "S" => Some(Self::Suspended),
            "L" => Some(Self::Looping),
            "E" => Some(Self::ErrorLimit),
            "O" => Some(Self::TooOld),
            "D" => Some(Self::NoDestination),
            "T" => Some(Self::SuspendedTemplate),
            "R" => Some(Self::ChannelRemoved),
            _ => None,
        }
    }

    pub fn as_code(&self) -> &'static str {
        match self {
            Self::Suspended => "S",
            Self::Looping => "L",
            Self::ErrorLimit => "E",
            Self::TooOld => "O",
            Self::NoDestination => "D",
            Self::SuspendedTemplate => "T",
            Self::ChannelRemoved => "R",
        }
    }
}

impl Msg {
    pub fn status(&self) -> Option<MsgStatus> {
        MsgStatus::from_code(&self.status)
    }

    pub fn failed_reason(&self) -> Option<MsgFailedReason> {
        self.failed_reason.as_deref().and_then(MsgFailedReason::from_code)
    }
}

#[derive(QueryableByName)]
struct AllocatedTopup {
    #[diesel(sql_type = sql_types::Uuid)]
    id: Uuid,
}

/// Debits `amount` credits from the org's earliest-expiring topup that can cover them,
/// in one statement. `Ok(None)` when no active topup has enough credit left.
pub fn allocate_topup(
    conn: &mut PgConnection,
    org_id: Uuid,
    amount: i32,
    now: DateTime<Utc>,
) -> QueryResult<Option<Uuid>> {
    if amount <= 0 {
        return Ok(None);
    }

    diesel::sql_query(
        "UPDATE topups SET used = used + $1 \
         WHERE id = (SELECT id FROM topups \
                     WHERE org_id = $2 AND is_active AND expires_on > $3 AND credits - used >= $1 \
                     ORDER BY expires_on ASC, id ASC LIMIT 1 FOR UPDATE SKIP LOCKED) \
         RETURNING id",
    )
    .bind::<sql_types::Integer, _>(amount)
    .bind::<sql_types::Uuid, _>(org_id)
    .bind::<sql_types::Timestamptz, _>(now)
    .get_result::<AllocatedTopup>(conn)
    .optional()
    .map(|allocated| allocated.map(|topup| topup.id))
}

pub fn insert_msgs(conn: &mut PgConnection, new_msgs: &[NewMsg]) -> QueryResult<Vec<Msg>> {
    if new_msgs.is_empty() {
        return Ok(Vec::new());
    }
    diesel::insert_into(msgs::table)
        .values(new_msgs)
        .get_results(conn)
}

pub fn load_msg_by_external_id(conn: &mut PgConnection, external_id: &str) -> QueryResult<Option<Msg>> {
    msgs::table
        .filter(msgs::external_id.eq(external_id))
        .order(msgs::created_on.desc())
        .first(conn)
        .optional()
}

pub fn mark_msg_wired(
    conn: &mut PgConnection,
    msg_id: Uuid,
    external_id: Option<&str>,
    now: DateTime<Utc>,
) -> QueryResult<usize> {
    diesel::update(msgs::table.find(msg_id))
        .set((
            msgs::status.eq(MsgStatus::Wired.as_code()),
            msgs::external_id.eq(external_id),
            msgs::next_attempt.eq(None::<DateTime<Utc>>),
            msgs::sent_on.eq(Some(now)),
            msgs::modified_on.eq(now),
        ))
        .execute(conn)
}

pub fn mark_msg_errored(
    conn: &mut PgConnection,
    msg_id: Uuid,
    error_count: i32,
    next_attempt: DateTime<Utc>,
    now: DateTime<Utc>,
) -> QueryResult<usize> {
    diesel::update(msgs::table.find(msg_id))
        .set((
            msgs::status.eq(MsgStatus::Errored.as_code()),
            msgs::error_count.eq(error_count),
            msgs::next_attempt.eq(Some(next_attempt)),
            msgs::modified_on.eq(now),
        ))
        .execute(conn)
}

pub fn mark_msgs_failed(
    conn: &mut PgConnection,
    msg_ids: &[Uuid],
    reason: MsgFailedReason,
    now: DateTime<Utc>,
) -> QueryResult<usize> {
    if msg_ids.is_empty() {
        return Ok(0);
    }
    diesel::update(msgs::table.filter(msgs::id.eq_any(msg_ids)))
        .set((
            msgs::status.eq(MsgStatus::Failed.as_code()),
            msgs::failed_reason.eq(Some(reason.as_code())),
            msgs::next_attempt.eq(None::<DateTime<Utc>>),
            msgs::modified_on.eq(now),
        ))
        .execute(conn)
}

pub fn set_msg_status(
    conn: &mut PgConnection,
    msg_id: Uuid,
    status: MsgStatus,
    now: DateTime<Utc>,
) -> QueryResult<usize> {
    diesel::update(msgs::table.find(msg_id))
        .set((msgs::status.eq(status.as_code()), msgs::modified_on.eq(now)))
        .execute(conn)
}
