use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use diesel::pg::PgConnection;
use diesel::prelude::*;
use tracing::warn;
use uuid::Uuid;

use crate::campaigns::{Campaign, CampaignEvent};
use crate::db::PgPool;
use crate::error::{CoreError, CoreResult};
use crate::models::{
    CampaignEventRow, CampaignRow, ChannelRow, FlowRow, GlobalRow, GroupRow, OrgRow, TemplateRow,
    TriggerRow,
};
use crate::schema::{
    campaign_events, campaigns, channels, contact_groups, flows, globals, orgs, templates,
    triggers,
};
use crate::triggers::Trigger;

use super::{AssetLoader, Channel, Flow, Group, Org, OrgAssets, Template};

/// Loads org assets straight from Postgres. Only active, unarchived rows are loaded;
/// rows that fail to convert are logged and left out of the snapshot.
#[derive(Clone)]
pub struct PgAssetLoader {
    pool: PgPool,
}

impl PgAssetLoader {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl AssetLoader for PgAssetLoader {
    fn load_org(&self, org_id: Uuid) -> CoreResult<Org> {
        select_org(&mut *self.pool.get()?, org_id)
    }

    fn load_channels(&self, org_id: Uuid) -> CoreResult<Vec<Channel>> {
        select_channels(&mut *self.pool.get()?, org_id)
    }

    fn load_groups(&self, org_id: Uuid) -> CoreResult<Vec<Group>> {
        select_groups(&mut *self.pool.get()?, org_id)
    }

    fn load_flows(&self, org_id: Uuid) -> CoreResult<Vec<Flow>> {
        select_flows(&mut *self.pool.get()?, org_id)
    }

    fn load_triggers(&self, org_id: Uuid) -> CoreResult<Vec<Trigger>> {
        select_triggers(&mut *self.pool.get()?, org_id)
    }

    fn load_campaigns(&self, org_id: Uuid) -> CoreResult<Vec<Campaign>> {
        select_campaigns(&mut *self.pool.get()?, org_id)
    }

    fn load_templates(&self, org_id: Uuid) -> CoreResult<Vec<Template>> {
        select_templates(&mut *self.pool.get()?, org_id)
    }

    fn load_globals(&self, org_id: Uuid) -> CoreResult<HashMap<String, String>> {
        select_globals(&mut *self.pool.get()?, org_id)
    }

    /// Runs `load` inside one read-only `REPEATABLE READ` transaction, so every query
    /// it makes sees the same committed state.
    fn consistent(
        &self,
        load: &mut dyn FnMut(&dyn AssetLoader) -> CoreResult<OrgAssets>,
    ) -> CoreResult<OrgAssets> {
        let mut conn = self.pool.get()?;
        conn.build_transaction()
            .repeatable_read()
            .read_only()
            .run(|conn| load(&SnapshotLoader { conn: Mutex::new(conn) }))
    }
}

/// Loads over a single connection that already has a transaction open.
struct SnapshotLoader<'c> {
    conn: Mutex<&'c mut PgConnection>,
}

impl SnapshotLoader<'_> {
    fn with_conn<T>(&self, query: impl FnOnce(&mut PgConnection) -> CoreResult<T>) -> CoreResult<T> {
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        query(&mut **conn)
    }
}

impl AssetLoader for SnapshotLoader<'_> {
    fn load_org(&self, org_id: Uuid) -> CoreResult<Org> {
        self.with_conn(|conn| select_org(conn, org_id))
    }

    fn load_channels(&self, org_id: Uuid) -> CoreResult<Vec<Channel>> {
        self.with_conn(|conn| select_channels(conn, org_id))
    }

    fn load_groups(&self, org_id: Uuid) -> CoreResult<Vec<Group>> {
        self.with_conn(|conn| select_groups(conn, org_id))
    }

    fn load_flows(&self, org_id: Uuid) -> CoreResult<Vec<Flow>> {
        self.with_conn(|conn| select_flows(conn, org_id))
    }

    fn load_triggers(&self, org_id: Uuid) -> CoreResult<Vec<Trigger>> {
        self.with_conn(|conn| select_triggers(conn, org_id))
    }

    fn load_campaigns(&self, org_id: Uuid) -> CoreResult<Vec<Campaign>> {
        self.with_conn(|conn| select_campaigns(conn, org_id))
    }

    fn load_templates(&self, org_id: Uuid) -> CoreResult<Vec<Template>> {
        self.with_conn(|conn| select_templates(conn, org_id))
    }

    fn load_globals(&self, org_id: Uuid) -> CoreResult<HashMap<String, String>> {
        self.with_conn(|conn| select_globals(conn, org_id))
    }

    fn consistent(
        &self,
        load: &mut dyn FnMut(&dyn AssetLoader) -> CoreResult<OrgAssets>,
    ) -> CoreResult<OrgAssets> {
        load(self)
    }
}

fn select_org(conn: &mut PgConnection, org_id: Uuid) -> CoreResult<Org> {
    let row: Option<OrgRow> = orgs::table.find(org_id).first(conn).optional()?;
    row.map(Org::from)
        .ok_or_else(|| CoreError::not_found(format!("org {org_id}")))
}

fn select_channels(conn: &mut PgConnection, org_id: Uuid) -> CoreResult<Vec<Channel>> {
    let rows: Vec<ChannelRow> = channels::table
        .filter(channels::org_id.eq(org_id))
        .filter(channels::is_active.eq(true))
        .order(channels::created_on.asc())
        .load(conn)?;
    Ok(rows.into_iter().map(Channel::from).collect())
}

fn select_groups(conn: &mut PgConnection, org_id: Uuid) -> CoreResult<Vec<Group>> {
    let rows: Vec<GroupRow> = contact_groups::table
        .filter(contact_groups::org_id.eq(org_id))
        .filter(contact_groups::is_active.eq(true))
        .load(conn)?;
    Ok(rows.into_iter().map(Group::from).collect())
}

fn select_flows(conn: &mut PgConnection, org_id: Uuid) -> CoreResult<Vec<Flow>> {
    let rows: Vec<FlowRow> = flows::table
        .filter(flows::org_id.eq(org_id))
        .load(conn)?;
    Ok(rows.into_iter().map(Flow::from).collect())
}

fn select_triggers(conn: &mut PgConnection, org_id: Uuid) -> CoreResult<Vec<Trigger>> {
    let rows: Vec<TriggerRow> = triggers::table
        .filter(triggers::org_id.eq(org_id))
        .filter(triggers::is_archived.eq(false))
        .load(conn)?;

    let loaded = rows
        .into_iter()
        .filter_map(|row| {
            let trigger_id = row.id;
            match Trigger::try_from(row) {
                Ok(trigger) => Some(trigger),
                Err(err) => {
                    warn!(%org_id, %trigger_id, error = %err, "skipping malformed trigger");
                    None
                }
            }
        })
        .collect();
    Ok(loaded)
}

fn select_campaigns(conn: &mut PgConnection, org_id: Uuid) -> CoreResult<Vec<Campaign>> {
    let campaign_rows: Vec<CampaignRow> = campaigns::table
        .filter(campaigns::org_id.eq(org_id))
        .filter(campaigns::is_active.eq(true))
        .load(conn)?;
    let campaign_ids: Vec<Uuid> = campaign_rows.iter().map(|row| row.id).collect();

    let event_rows: Vec<CampaignEventRow> = campaign_events::table
        .filter(campaign_events::campaign_id.eq_any(&campaign_ids))
        .filter(campaign_events::is_active.eq(true))
        .order(campaign_events::created_on.asc())
        .load(conn)?;

    let mut events_by_campaign: HashMap<Uuid, Vec<CampaignEvent>> = HashMap::new();
    for row in event_rows {
        events_by_campaign
            .entry(row.campaign_id)
            .or_default()
            .push(CampaignEvent::from(row));
    }

    Ok(campaign_rows
        .into_iter()
        .map(|row| Campaign {
            id: row.id,
            name: row.name,
            group_id: row.group_id,
            events: events_by_campaign.remove(&row.id).unwrap_or_default(),
        })
        .collect())
}

fn select_templates(conn: &mut PgConnection, org_id: Uuid) -> CoreResult<Vec<Template>> {
    let rows: Vec<TemplateRow> = templates::table
        .filter(templates::org_id.eq(org_id))
        .load(conn)?;

    Ok(rows
        .into_iter()
        .filter_map(|row| {
            let template_id = row.id;
            Template::try_from(row)
                .map_err(|err| warn!(%org_id, %template_id, error = %err, "skipping template"))
                .ok()
        })
        .collect())
}

fn select_globals(conn: &mut PgConnection, org_id: Uuid) -> CoreResult<HashMap<String, String>> {
    let rows: Vec<GlobalRow> = globals::table
        .filter(globals::org_id.eq(org_id))
        .load(conn)?;
    Ok(rows
        .into_iter()
        .map(|row| (row.key.to_lowercase(), row.value))
        .collect())
}
