//! Call connections and the IVR provider boundary.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

use crate::assets::Channel;
use crate::models::ChannelConnection;
use crate::schema::channel_connections;

#[derive(Debug, Error)]
pub enum CallError {
    #[error("call provider request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("call provider returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("invalid call provider url: {0}")]
    Url(#[from] url::ParseError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Pending,
    Queued,
    Wired,
    Ringing,
    InProgress,
    Completed,
    Busy,
    Failed,
    NoAnswer,
    Canceled,
    Errored,
    Throttled,
}

impl ConnectionStatus {
    /// Statuses a connection can sit in while we still wait to hear back about it.
    pub const OPEN: [ConnectionStatus; 5] = [
        Self::Pending,
        Self::Queued,
        Self::Wired,
        Self::Ringing,
        Self::InProgress,
    ];

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "P" => Some(Self::Pending),
            "Q" => Some(Self::Queued),
            "W" => Some(Self::Wired),
            "R" => Some(Self::Ringing),
            "I" => Some(Self::InProgress),
            "D" => Some(Self::Completed),
            "B" => Some(Self::Busy),
            "F" => Some(Self::Failed),
            "N" => Some(Self::NoAnswer),
            "C" => Some(Self::Canceled),
            "E" => Some(Self::Errored),
            "T" => Some(Self::Throttled),
            _ => None,
        }
    }

    pub fn as_code(&self) -> &'static str {
        match self {
            Self::Pending => "P",
            Self::Queued => "Q",
            Self::Wired => "W",
            Self::Ringing => "R",
            Self::InProgress => "I",
            Self::Completed => "D",
            Self::Busy => "B",
            Self::Failed => "F",
            Self::NoAnswer => "N",
            Self::Canceled => "C",
            Self::Errored => "E",
            Self::Throttled => "T",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Busy | Self::Failed | Self::NoAnswer | Self::Canceled
        )
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Queued | Self::Errored | Self::Throttled => 1,
            Self::Wired => 2,
            Self::Ringing => 3,
            Self::InProgress => 4,
            _ => 5,
        }
    }

    pub fn can_become(&self, next: ConnectionStatus) -> bool {
        if self.is_terminal() || *self == next {
            return false;
        }
        next.is_terminal()
            || (next == Self::Errored && self.rank() <= Self::Wired.rank())
            || next.rank() > self.rank()
    }
}

impl ChannelConnection {
    pub fn status(&self) -> Option<ConnectionStatus> {
        ConnectionStatus::from_code(&self.status)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome {
    Accepted { external_id: String },
    Throttled,
    Rejected { reason: String },
}

#[async_trait]
pub trait CallProvider: Send + Sync {
    async fn request_call(
        &self,
        channel: &Channel,
        connection_id: Uuid,
        urn: &str,
    ) -> Result<CallOutcome, CallError>;

    async fn hangup(&self, channel: &Channel, external_id: &str) -> Result<(), CallError>;
}

pub struct HttpCallProvider {
    client: Client,
    base_url: Url,
}

impl HttpCallProvider {
    pub fn new(base_url: &str) -> Result<Self, CallError> {
        Ok(Self {
            client: Client::new(),
            base_url: Url::parse(base_url)?,
        })
    }

    fn url(&self, channel: &Channel, action: &str) -> Result<Url, CallError> {
        let path = format!(
            "c/{}/{}/{action}",
            channel.channel_type.to_ascii_lowercase(),
            channel.id
        );
        Ok(self.base_url.join(&path)?)
    }
}

#[derive(Deserialize)]
struct CallResponse {
    external_id: String,
}

#[async_trait]
impl CallProvider for HttpCallProvider {
    async fn request_call(
        &self,
        channel: &Channel,
        connection_id: Uuid,
        urn: &str,
    ) -> Result<CallOutcome, CallError> {
        let response = self
            .client
            .post(self.url(channel, "call")?)
            .json(&json!({ "connection_id": connection_id, "urn": urn }))
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Ok(CallOutcome::Throttled);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Ok(CallOutcome::Rejected {
                reason: format!("{status}: {body}"),
            });
        }
        let parsed: CallResponse = response.json().await?;
        Ok(CallOutcome::Accepted {
            external_id: parsed.external_id,
        })
    }

    async fn hangup(&self, channel: &Channel, external_id: &str) -> Result<(), CallError> {
        let response = self
            .client
            .post(self.url(channel, "hangup")?)
            .json(&json!({ "external_id": external_id }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CallError::Status { status, body });
        }
        Ok(())
    }
}

pub fn load_connection_by_external_id(
    conn: &mut PgConnection,
    external_id: &str,
) -> QueryResult<Option<ChannelConnection>> {
    channel_connections::table
        .filter(channel_connections::external_id.eq(external_id))
        .order(channel_connections::created_on.desc())
        .first(conn)
        .optional()
}

pub fn set_connection_status(
    conn: &mut PgConnection,
    connection_id: Uuid,
    status: ConnectionStatus,
    now: DateTime<Utc>,
) -> QueryResult<usize> {
    let target = channel_connections::table.find(connection_id);
    let code = status.as_code();
    if status == ConnectionStatus::InProgress {
        diesel::update(target)
            .set((
                channel_connections::status.eq(code),
                channel_connections::started_on.eq(Some(now)),
                channel_connections::modified_on.eq(now),
            ))
            .execute(conn)
    } else if status.is_terminal() {
        diesel::update(target)
            .set((
                channel_connections::status.eq(code),
                channel_connections::ended_on.eq(Some(now)),
                channel_connections::next_attempt.eq(None::<DateTime<Utc>>),
                channel_connections::modified_on.eq(now),
            ))
            .execute(conn)
    } else {
        diesel::update(target)
            .set((
                channel_connections::status.eq(code),
                channel_connections::modified_on.eq(now),
            ))
            .execute(conn)
    }
}

pub fn mark_connection_wired(
    conn: &mut PgConnection,
    connection_id: Uuid,
    external_id: &str,
    now: DateTime<Utc>,
) -> QueryResult<usize> {
    diesel::update(channel_connections::table.find(connection_id))
        .set((
            channel_connections::status.eq(ConnectionStatus::Wired.as_code()),
            channel_connections::external_id.eq(Some(external_id)),
            channel_connections::next_attempt.eq(None::<DateTime<Utc>>),
            channel_connections::retry_count.eq(channel_connections::retry_count + 1),
            channel_connections::modified_on.eq(now),
        ))
        .execute(conn)
}

pub fn mark_connection_errored(
    conn: &mut PgConnection,
    connection_id: Uuid,
    error_count: i32,
    next_attempt: DateTime<Utc>,
    now: DateTime<Utc>,
) -> QueryResult<usize> {
    diesel::update(channel_connections::table.find(connection_id))
        .set((
            channel_connections::status.eq(ConnectionStatus::Errored.as_code()),
            channel_connections::error_count.eq(error_count),
            channel_connections::next_attempt.eq(Some(next_attempt)),
            channel_connections::modified_on.eq(now),
        ))
        .execute(conn)
}

pub fn mark_connections_failed(
    conn: &mut PgConnection,
    connection_ids: &[Uuid],
    now: DateTime<Utc>,
) -> QueryResult<usize> {
    if connection_ids.is_empty() {
        return Ok(0);
    }
    diesel::update(channel_connections::table.filter(channel_connections::id.eq_any(connection_ids)))
        .set((
            channel_connections::status.eq(ConnectionStatus::Failed.as_code()),
            channel_connections::next_attempt.eq(None::<DateTime<Utc>>),
            channel_connections::ended_on.eq(Some(now)),
            channel_connections::modified_on.eq(now),
        ))
        .execute(conn)
}
