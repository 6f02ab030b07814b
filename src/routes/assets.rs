use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use tokio::task;
use uuid::Uuid;

use crate::assets::AssetKind;
use crate::error::{AppError, AppResult};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct RefreshRequest {
    pub org_id: Uuid,
    #[serde(default)]
    pub kinds: Vec<AssetKind>,
}

#[derive(Serialize)]
pub struct RefreshResponse {
    pub org_id: Uuid,
    pub versions: Vec<(AssetKind, u64)>,
}

/// Reloads the given kinds of an org's assets; no kinds means all of them.
pub async fn refresh(
    State(state): State<AppState>,
    Json(payload): Json<RefreshRequest>,
) -> AppResult<Json<RefreshResponse>> {
    let kinds = if payload.kinds.is_empty() {
        AssetKind::ALL.to_vec()
    } else {
        payload.kinds
    };

    let cache = state.assets.clone();
    let org_id = payload.org_id;
    let assets = task::spawn_blocking(move || cache.refresh(org_id, &kinds))
        .await
        .map_err(AppError::internal)??;

    Ok(Json(RefreshResponse {
        org_id,
        versions: AssetKind::ALL
            .iter()
            .map(|kind| (*kind, assets.version(*kind)))
            .collect(),
    }))
}
