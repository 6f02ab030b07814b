use axum::{extract::State, Json};
use chrono::Utc;

use crate::delivery::{apply_status_update, StatusApplied, StatusUpdate};
use crate::error::AppResult;
use crate::state::AppState;

pub async fn handle_status(
    State(state): State<AppState>,
    Json(update): Json<StatusUpdate>,
) -> AppResult<Json<StatusApplied>> {
    let mut conn = state.db()?;
    let applied = apply_status_update(&mut conn, &state.config.retry, &update, Utc::now())?;
    Ok(Json(applied))
}
