use axum::{extract::State, http::StatusCode, response::Json};
use diesel::prelude::*;
use serde_json::json;

use crate::state::AppState;

pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let database = state
        .db()
        .ok()
        .and_then(|mut conn| diesel::sql_query("SELECT 1").execute(&mut conn).ok())
        .is_some();

    let status = if database {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (
        status,
        Json(json!({ "status": if database { "ok" } else { "degraded" }, "database": database })),
    )
}
