use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broadcasts::queue_broadcast;
use crate::contacts::load_contacts;
use crate::error::{AppError, AppResult};
use crate::flows::{FlowStart, FlowTrigger};
use crate::state::AppState;
use crate::triggers::{find_matching_trigger, EventKind, InboundEvent};

#[derive(Deserialize)]
pub struct EventRequest {
    pub org_id: Uuid,
    pub kind: EventKind,
    pub contact_id: Uuid,
    #[serde(default)]
    pub channel_id: Option<Uuid>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub referrer_id: Option<String>,
}

#[derive(Serialize, Default)]
pub struct EventResponse {
    pub trigger_id: Option<Uuid>,
    pub session_ids: Vec<Uuid>,
}

/// Matches an inbound event against the org's triggers and starts the winning flow.
pub async fn handle_event(
    State(state): State<AppState>,
    Json(payload): Json<EventRequest>,
) -> AppResult<Json<EventResponse>> {
    let assets = state.org_assets(payload.org_id).await?;

    let mut conn = state.db()?;
    let contact = load_contacts(&mut conn, payload.org_id, &[payload.contact_id])?
        .into_iter()
        .next()
        .ok_or_else(AppError::not_found)?;
    drop(conn);

    if !contact.is_active() {
        debug!(contact_id = %contact.id, "ignoring event from inactive contact");
        return Ok(Json(EventResponse::default()));
    }

    let event = InboundEvent {
        kind: payload.kind,
        channel_id: payload.channel_id,
        text: payload.text,
        referrer_id: payload.referrer_id,
    };
    let Some(trigger) = find_matching_trigger(&assets, &event, &contact) else {
        return Ok(Json(EventResponse::default()));
    };

    if !assets.flow(trigger.flow_id).is_some_and(|flow| flow.is_active) {
        warn!(trigger_id = %trigger.id, flow_id = %trigger.flow_id, "trigger flow is not active");
        return Ok(Json(EventResponse::default()));
    }

    let start = FlowStart {
        org_id: payload.org_id,
        flow_id: trigger.flow_id,
        contact_ids: vec![contact.id],
        trigger: FlowTrigger::Trigger {
            trigger_id: trigger.id,
            event,
        },
    };
    let started = state
        .engine
        .start_flow(&start)
        .await
        .map_err(|err| AppError::new(StatusCode::BAD_GATEWAY, err.to_string()))?;

    if !started.broadcasts.is_empty() {
        let mut conn = state.db()?;
        for broadcast in started.broadcasts {
            queue_broadcast(&mut conn, broadcast)?;
        }
    }

    info!(
        org_id = %payload.org_id,
        contact_id = %contact.id,
        trigger_id = %trigger.id,
        sessions = started.session_ids.len(),
        "trigger started flow"
    );
    Ok(Json(EventResponse {
        trigger_id: Some(trigger.id),
        session_ids: started.session_ids,
    }))
}
