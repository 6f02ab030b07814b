//! Hand-off to the channel delivery service and the status callbacks coming back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tokio::task;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::assets::{Channel, OrgAssets};
use crate::config::RetryConfig;
use crate::error::{CoreError, CoreResult};
use crate::ivr::{load_connection_by_external_id, set_connection_status, ConnectionStatus};
use crate::models::Msg;
use crate::msgs::{
    load_msg_by_external_id, mark_msg_errored, mark_msg_wired, mark_msgs_failed, set_msg_status,
    MsgFailedReason, MsgStatus,
};
use crate::state::AppState;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("delivery request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("invalid delivery url: {0}")]
    Url(#[from] url::ParseError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    Accepted { external_id: Option<String> },
    Rejected { reason: String },
}

#[async_trait]
pub trait MsgSender: Send + Sync {
    async fn send(&self, channel: &Channel, msg: &Msg) -> Result<SendOutcome, DeliveryError>;
}

pub struct HttpMsgSender {
    client: Client,
    base_url: Url,
}

impl HttpMsgSender {
    pub fn new(base_url: &str) -> Result<Self, DeliveryError> {
        Ok(Self {
            client: Client::new(),
            base_url: Url::parse(base_url)?,
        })
    }

    fn send_url(&self, channel: &Channel) -> Result<Url, DeliveryError> {
        let path = format!(
            "c/{}/{}/send",
            channel.channel_type.to_ascii_lowercase(),
            channel.id
        );
        Ok(self.base_url.join(&path)?)
    }
}

#[derive(Deserialize)]
struct SendResponse {
    #[serde(default)]
    external_id: Option<String>,
}

#[async_trait]
impl MsgSender for HttpMsgSender {
    async fn send(&self, channel: &Channel, msg: &Msg) -> Result<SendOutcome, DeliveryError> {
        let body = json!({
            "id": msg.id,
            "contact_id": msg.contact_id,
            "urn": msg.urn,
            "text": msg.text,
            "attachments": msg.attachments,
            "quick_replies": msg.quick_replies,
            "error_count": msg.error_count,
        });

        let response = self
            .client
            .post(self.send_url(channel)?)
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            let parsed: SendResponse = response.json().await?;
            return Ok(SendOutcome::Accepted {
                external_id: parsed.external_id,
            });
        }

        let detail = response.text().await.unwrap_or_default();
        Ok(SendOutcome::Rejected {
            reason: format!("{status}: {detail}"),
        })
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SendSummary {
    pub wired: usize,
    pub errored: usize,
    pub failed: usize,
}

impl SendSummary {
    fn record(&mut self, status: MsgStatus) {
        match status {
            MsgStatus::Wired => self.wired += 1,
            MsgStatus::Errored => self.errored += 1,
            MsgStatus::Failed => self.failed += 1,
            _ => {}
        }
    }
}

/// Status and retry schedule after a failed attempt that was the `error_count`th.
pub(crate) fn after_error(
    retry: &RetryConfig,
    error_count: i32,
    now: DateTime<Utc>,
) -> Result<DateTime<Utc>, MsgFailedReason> {
    if error_count >= retry.max_msg_errors {
        Err(MsgFailedReason::ErrorLimit)
    } else {
        Ok(now + retry.backoff_for(error_count))
    }
}

/// Records a failed attempt: errored with a next attempt, or failed once the error
/// limit is reached.
fn record_msg_error(
    conn: &mut PgConnection,
    retry: &RetryConfig,
    msg_id: Uuid,
    previous_errors: i32,
    now: DateTime<Utc>,
) -> QueryResult<MsgStatus> {
    let error_count = previous_errors + 1;
    match after_error(retry, error_count, now) {
        Ok(next_attempt) => {
            mark_msg_errored(conn, msg_id, error_count, next_attempt, now)?;
            Ok(MsgStatus::Errored)
        }
        Err(reason) => {
            mark_msgs_failed(conn, &[msg_id], reason, now)?;
            Ok(MsgStatus::Failed)
        }
    }
}

/// Sends one message and records the result on its row.
pub async fn send_msg(state: &AppState, assets: &OrgAssets, msg: &Msg) -> CoreResult<MsgStatus> {
    let channel = match msg.channel_id.and_then(|id| assets.channel(id)) {
        Some(channel) => channel,
        None => {
            let reason = if msg.channel_id.is_some() {
                MsgFailedReason::ChannelRemoved
            } else {
                MsgFailedReason::NoDestination
            };
            warn!(msg_id = %msg.id, reason = reason.as_code(), "message has no usable channel");
            let pool = state.pool.clone();
            let msg_id = msg.id;
            task::spawn_blocking(move || -> CoreResult<()> {
                let mut conn = pool.get()?;
                mark_msgs_failed(&mut conn, &[msg_id], reason, Utc::now())?;
                Ok(())
            })
            .await??;
            return Ok(MsgStatus::Failed);
        }
    };

    let outcome = match state.sender.send(channel, msg).await {
        Ok(outcome) => outcome,
        Err(err) => SendOutcome::Rejected {
            reason: err.to_string(),
        },
    };

    let pool = state.pool.clone();
    let retry = state.config.retry.clone();
    let msg_id = msg.id;
    let previous_errors = msg.error_count;
    let status = task::spawn_blocking(move || -> CoreResult<MsgStatus> {
        let mut conn = pool.get()?;
        let now = Utc::now();
        match outcome {
            SendOutcome::Accepted { external_id } => {
                mark_msg_wired(&mut conn, msg_id, external_id.as_deref(), now)?;
                Ok(MsgStatus::Wired)
            }
            SendOutcome::Rejected { reason } => {
                debug!(%msg_id, %reason, "message send rejected");
                Ok(record_msg_error(&mut conn, &retry, msg_id, previous_errors, now)?)
            }
        }
    })
    .await??;

    Ok(status)
}

/// Sends every queued message in `msgs`. Messages created as failed are left alone.
pub async fn send_msgs(state: &AppState, assets: &OrgAssets, msgs: &[Msg]) -> CoreResult<SendSummary> {
    let mut summary = SendSummary::default();
    for msg in msgs
        .iter()
        .filter(|msg| msg.status() == Some(MsgStatus::Queued))
    {
        summary.record(send_msg(state, assets, msg).await?);
    }

    if !msgs.is_empty() {
        info!(
            org_id = %assets.org().id,
            wired = summary.wired,
            errored = summary.errored,
            failed = summary.failed,
            "sent messages"
        );
    }
    Ok(summary)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub external_id: String,
    pub status: String,
    #[serde(default)]
    pub error_detail: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum StatusApplied {
    Msg { id: Uuid, status: MsgStatus },
    Connection { id: Uuid, status: ConnectionStatus },
    Ignored,
    NotFound,
}

fn parse_code<T: serde::de::DeserializeOwned>(raw: &str, from_code: fn(&str) -> Option<T>) -> Option<T> {
    from_code(raw).or_else(|| serde_json::from_value(serde_json::Value::String(raw.to_string())).ok())
}

/// Applies a delivery status callback to the message or call it refers to. Status only
/// ever moves forward; callbacks that would move it back are ignored.
pub fn apply_status_update(
    conn: &mut PgConnection,
    retry: &RetryConfig,
    update: &StatusUpdate,
    now: DateTime<Utc>,
) -> CoreResult<StatusApplied> {
    if let Some(msg) = load_msg_by_external_id(conn, &update.external_id)? {
        let Some(next) = parse_code(&update.status, MsgStatus::from_code) else {
            return Err(CoreError::validation(format!(
                "unknown message status: {}",
                update.status
            )));
        };
        let current = msg.status().unwrap_or(MsgStatus::Pending);
        if !current.can_become(next) {
            debug!(msg_id = %msg.id, ?current, ?next, "ignoring backwards status update");
            return Ok(StatusApplied::Ignored);
        }

        let applied = if next == MsgStatus::Errored {
            if let Some(detail) = update.error_detail.as_deref() {
                debug!(msg_id = %msg.id, %detail, "delivery reported an error");
            }
            record_msg_error(conn, retry, msg.id, msg.error_count, now)?
        } else {
            set_msg_status(conn, msg.id, next, now)?;
            next
        };
        return Ok(StatusApplied::Msg {
            id: msg.id,
            status: applied,
        });
    }

    if let Some(connection) = load_connection_by_external_id(conn, &update.external_id)? {
        let Some(next) = parse_code(&update.status, ConnectionStatus::from_code) else {
            return Err(CoreError::validation(format!(
                "unknown call status: {}",
                update.status
            )));
        };
        let current = connection.status().unwrap_or(ConnectionStatus::Pending);
        if !current.can_become(next) {
            return Ok(StatusApplied::Ignored);
        }
        set_connection_status(conn, connection.id, next, now)?;
        return Ok(StatusApplied::Connection {
            id: connection.id,
            status: next,
        });
    }

    Ok(StatusApplied::NotFound)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::config::BackoffPolicy;

    #[test]
    fn errors_back_off_until_the_limit() {
        let retry = RetryConfig {
            backoff: BackoffPolicy::Exponential,
            backoff_base: Duration::from_secs(60),
            max_msg_errors: 3,
            ..RetryConfig::default()
        };
        let now = Utc::now();

        assert_eq!(after_error(&retry, 1, now), Ok(now + chrono::Duration::minutes(1)));
        assert_eq!(after_error(&retry, 2, now), Ok(now + chrono::Duration::minutes(2)));
        assert_eq!(after_error(&retry, 3, now), Err(MsgFailedReason::ErrorLimit));
    }

    #[test]
    fn statuses_parse_from_codes_or_names() {
        assert_eq!(parse_code("D", MsgStatus::from_code), Some(MsgStatus::Delivered));
        assert_eq!(parse_code("delivered", MsgStatus::from_code), Some(MsgStatus::Delivered));
        assert_eq!(
            parse_code("no_answer", ConnectionStatus::from_code),
            Some(ConnectionStatus::NoAnswer)
        );
        assert_eq!(parse_code("exploded", MsgStatus::from_code), None);
    }

    #[test]
    fn send_urls_include_channel_type_and_id() {
        let sender = HttpMsgSender::new("http://courier:8080/").unwrap();
        let channel = crate::assets::fixtures::channel(Uuid::new_v4(), "tel", &[]);
        let url = sender.send_url(&channel).unwrap();
        assert_eq!(url.as_str(), format!("http://courier:8080/c/t/{}/send", channel.id));
    }
}
