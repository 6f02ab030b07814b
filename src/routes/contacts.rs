use std::collections::BTreeMap;

use axum::{extract::State, Json};
use chrono::Utc;
use diesel::Connection;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::campaigns::{delete_unfired_fires_for_groups, schedule_fires_for_contacts};
use crate::contacts::{self, load_contacts, release_contacts};
use crate::error::{AppError, AppResult, CoreError};
use crate::models::GroupMembership;
use crate::state::AppState;

#[derive(Deserialize)]
pub struct GroupChangeRequest {
    pub org_id: Uuid,
    pub contact_ids: Vec<Uuid>,
    #[serde(default)]
    pub add: Vec<Uuid>,
    #[serde(default)]
    pub remove: Vec<Uuid>,
}

#[derive(Serialize)]
pub struct GroupChangeResponse {
    pub added: usize,
    pub removed: usize,
    pub fires_scheduled: usize,
    pub fires_deleted: usize,
}

fn by_group(memberships: &[GroupMembership]) -> BTreeMap<Uuid, Vec<Uuid>> {
    let mut grouped: BTreeMap<Uuid, Vec<Uuid>> = BTreeMap::new();
    for membership in memberships {
        grouped
            .entry(membership.group_id)
            .or_default()
            .push(membership.contact_id);
    }
    grouped
}

/// Applies a membership change and keeps campaign fires in step with it.
pub async fn change_groups(
    State(state): State<AppState>,
    Json(payload): Json<GroupChangeRequest>,
) -> AppResult<Json<GroupChangeResponse>> {
    if payload.contact_ids.is_empty() {
        return Err(AppError::bad_request("contact_ids must not be empty"));
    }
    let assets = state.org_assets(payload.org_id).await?;
    if let Some(unknown) = payload
        .add
        .iter()
        .chain(&payload.remove)
        .find(|group_id| assets.group(**group_id).is_none())
    {
        return Err(AppError::bad_request(format!("unknown group {unknown}")));
    }

    let mut conn = state.db()?;
    let now = Utc::now();
    let response = conn.transaction(|conn| -> Result<GroupChangeResponse, CoreError> {
        let (added, removed) = contacts::change_groups(conn, &payload.contact_ids, &payload.add, &payload.remove)?;

        let mut fires_deleted = 0;
        for (group_id, contact_ids) in by_group(&removed) {
            fires_deleted += delete_unfired_fires_for_groups(conn, &contact_ids, &[group_id])?;
        }

        let mut fires_scheduled = 0;
        for (group_id, contact_ids) in by_group(&added) {
            let joined = load_contacts(conn, payload.org_id, &contact_ids)?;
            fires_scheduled += schedule_fires_for_contacts(conn, &assets, &joined, &[group_id], now)?;
        }

        Ok(GroupChangeResponse {
            added: added.len(),
            removed: removed.len(),
            fires_scheduled,
            fires_deleted,
        })
    })?;

    info!(
        org_id = %payload.org_id,
        added = response.added,
        removed = response.removed,
        fires_scheduled = response.fires_scheduled,
        fires_deleted = response.fires_deleted,
        "changed contact groups"
    );
    Ok(Json(response))
}

#[derive(Deserialize)]
pub struct ReleaseRequest {
    pub org_id: Uuid,
    pub contact_ids: Vec<Uuid>,
}

#[derive(Serialize)]
pub struct ReleaseResponse {
    pub archived_triggers: Vec<Uuid>,
}

pub async fn release(
    State(state): State<AppState>,
    Json(payload): Json<ReleaseRequest>,
) -> AppResult<Json<ReleaseResponse>> {
    let mut conn = state.db()?;
    let archived_triggers = release_contacts(&mut conn, &payload.contact_ids)?;
    drop(conn);

    if !archived_triggers.is_empty() {
        state.assets.invalidate(payload.org_id);
    }
    info!(org_id = %payload.org_id, contacts = payload.contact_ids.len(), "released contacts");
    Ok(Json(ReleaseResponse { archived_triggers }))
}
