use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use crate::broadcasts::{queue_broadcast, Broadcast};
use crate::error::{AppError, AppResult};
use crate::state::AppState;

#[derive(Serialize)]
pub struct QueuedBroadcast {
    pub broadcast_id: Uuid,
}

pub async fn queue(
    State(state): State<AppState>,
    Json(broadcast): Json<Broadcast>,
) -> AppResult<(StatusCode, Json<QueuedBroadcast>)> {
    if broadcast.contact_ids.is_empty() && broadcast.group_ids.is_empty() && broadcast.urns.is_empty() {
        return Err(AppError::bad_request("broadcast has no recipients"));
    }

    let org_id = broadcast.org_id;
    let mut conn = state.db()?;
    let broadcast_id = queue_broadcast(&mut conn, broadcast)?;
    info!(%org_id, %broadcast_id, "queued broadcast");
    Ok((StatusCode::ACCEPTED, Json(QueuedBroadcast { broadcast_id })))
}
