//! The boundary to the external flow engine. The core only decides what to start;
//! running the flow is the engine's business.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

use crate::broadcasts::Broadcast;
use crate::triggers::InboundEvent;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("flow engine request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("flow engine returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("invalid flow engine url: {0}")]
    Url(#[from] url::ParseError),
}

/// Why a flow is being started.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FlowTrigger {
    Trigger { trigger_id: Uuid, event: InboundEvent },
    Campaign { campaign_id: Uuid, event_id: Uuid },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowStart {
    pub org_id: Uuid,
    pub flow_id: Uuid,
    pub contact_ids: Vec<Uuid>,
    pub trigger: FlowTrigger,
}

/// What the engine hands back. Broadcasts it emitted are persisted and sent by us.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowStartResult {
    #[serde(default)]
    pub session_ids: Vec<Uuid>,
    #[serde(default)]
    pub broadcasts: Vec<Broadcast>,
}

#[async_trait]
pub trait FlowEngine: Send + Sync {
    async fn start_flow(&self, start: &FlowStart) -> Result<FlowStartResult, EngineError>;
}

pub struct HttpFlowEngine {
    client: Client,
    start_url: Url,
}

impl HttpFlowEngine {
    pub fn new(base_url: &str) -> Result<Self, EngineError> {
        let start_url = Url::parse(base_url)?.join("flow/start")?;
        Ok(Self {
            client: Client::new(),
            start_url,
        })
    }
}

#[async_trait]
impl FlowEngine for HttpFlowEngine {
    async fn start_flow(&self, start: &FlowStart) -> Result<FlowStartResult, EngineError> {
        let response = self
            .client
            .post(self.start_url.clone())
            .json(start)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::Status { status, body });
        }
        Ok(response.json().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_url_is_relative_to_base() {
        let engine = HttpFlowEngine::new("http://engine.internal:8091/").unwrap();
        assert_eq!(engine.start_url.as_str(), "http://engine.internal:8091/flow/start");
    }

    #[test]
    fn campaign_triggers_are_tagged() {
        let trigger = FlowTrigger::Campaign {
            campaign_id: Uuid::nil(),
            event_id: Uuid::nil(),
        };
        let value = serde_json::to_value(&trigger).unwrap();
        assert_eq!(value["type"], "campaign");
    }

    #[test]
    fn empty_engine_responses_parse() {
        let result: FlowStartResult = serde_json::from_str("{}").unwrap();
        assert!(result.session_ids.is_empty());
        assert!(result.broadcasts.is_empty());
    }
}
