use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use tokio::task;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::assets::OrgAssets;
use crate::contacts::{group_member_ids, load_contacts, Contact};
use crate::error::{CoreError, CoreResult};
use crate::jobs::{enqueue_job, JOB_FIRE_CAMPAIGN_EVENT};
use crate::models::{EventFire, NewEventFire};
use crate::schema::{campaign_events, campaigns, event_fires};
use crate::state::AppState;

use super::{CampaignEvent, ScheduleError};

pub const FIRED_RESULT_FIRED: &str = "F";
pub const FIRED_RESULT_SKIPPED: &str = "S";

const QUEUED_FIRES_KEY: &str = "campaign_fires:queued";
const QUEUED_FIRES_TTL: Duration = Duration::from_secs(60 * 60);
const DUE_FIRES_LIMIT: i64 = 25_000;
const SCHEDULE_CHUNK: usize = 500;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FireCampaignEventPayload {
    pub org_id: Uuid,
    pub event_id: Uuid,
    pub fire_ids: Vec<Uuid>,
}

/// Inserts pending fires. A pair that already has an unfired row is left as it is;
/// pairs whose earlier fire already ran get a new pending row.
pub fn add_event_fires(conn: &mut PgConnection, fires: &[NewEventFire]) -> QueryResult<usize> {
    if fires.is_empty() {
        return Ok(0);
    }
    diesel::insert_into(event_fires::table)
        .values(fires)
        .on_conflict_do_nothing()
        .execute(conn)
}

/// Deletes the unfired fires of `contact_ids` for every event whose campaign targets
/// one of `group_ids`.
pub fn delete_unfired_fires_for_groups(
    conn: &mut PgConnection,
    contact_ids: &[Uuid],
    group_ids: &[Uuid],
) -> QueryResult<usize> {
    if contact_ids.is_empty() || group_ids.is_empty() {
        return Ok(0);
    }

    let group_events = campaign_events::table
        .inner_join(campaigns::table)
        .filter(campaigns::group_id.eq_any(group_ids))
        .select(campaign_events::id);

    diesel::delete(
        event_fires::table
            .filter(event_fires::contact_id.eq_any(contact_ids))
            .filter(event_fires::fired.is_null())
            .filter(event_fires::event_id.eq_any(group_events)),
    )
    .execute(conn)
}

pub fn fires_for_contacts(
    tz: Tz,
    event: &CampaignEvent,
    contacts: &[Contact],
    now: DateTime<Utc>,
) -> Result<Vec<NewEventFire>, ScheduleError> {
    let mut fires = Vec::new();
    for contact in contacts.iter().filter(|contact| contact.is_active()) {
        if let Some(scheduled) = event.schedule_for_contact(tz, now, contact)? {
            fires.push(NewEventFire {
                id: Uuid::new_v4(),
                contact_id: contact.id,
                event_id: event.id,
                scheduled,
            });
        }
    }
    Ok(fires)
}

/// Schedules fires for contacts that just joined `joined_groups`. Events whose
/// settings cannot be scheduled are logged and left out.
pub fn schedule_fires_for_contacts(
    conn: &mut PgConnection,
    assets: &OrgAssets,
    contacts: &[Contact],
    joined_groups: &[Uuid],
    now: DateTime<Utc>,
) -> CoreResult<usize> {
    let tz = assets.org().timezone;
    let mut fires = Vec::new();

    for campaign in assets
        .campaigns()
        .iter()
        .filter(|campaign| joined_groups.contains(&campaign.group_id))
    {
        let members: Vec<Contact> = contacts
            .iter()
            .filter(|contact| contact.in_group(campaign.group_id))
            .cloned()
            .collect();
        if members.is_empty() {
            continue;
        }

        for event in &campaign.events {
            match fires_for_contacts(tz, event, &members, now) {
                Ok(mut scheduled) => fires.append(&mut scheduled),
                Err(err) => {
                    warn!(campaign_id = %campaign.id, event_id = %event.id, error = %err, "cannot schedule campaign event");
                }
            }
        }
    }

    Ok(add_event_fires(conn, &fires)?)
}

/// Schedules a newly created event for every current member of its campaign group.
pub fn schedule_campaign_event(
    conn: &mut PgConnection,
    assets: &OrgAssets,
    event_id: Uuid,
    now: DateTime<Utc>,
) -> CoreResult<usize> {
    let (campaign, event) = assets
        .campaign_event(event_id)
        .ok_or_else(|| CoreError::not_found(format!("campaign event {event_id}")))?;
    let org = assets.org();

    let member_ids = group_member_ids(conn, &[campaign.group_id])?;
    let mut inserted = 0;
    for chunk in member_ids.chunks(SCHEDULE_CHUNK) {
        let contacts = load_contacts(conn, org.id, chunk)?;
        let fires = fires_for_contacts(org.timezone, event, &contacts, now)?;
        inserted += add_event_fires(conn, &fires)?;
    }

    info!(org_id = %org.id, %event_id, members = member_ids.len(), inserted, "scheduled campaign event");
    Ok(inserted)
}

/// Marks unfired fires as fired with `result`, returning the ones this call claimed.
/// Fires already claimed elsewhere are not returned.
pub fn claim_fires(
    conn: &mut PgConnection,
    fire_ids: &[Uuid],
    result: &str,
    now: DateTime<Utc>,
) -> QueryResult<Vec<EventFire>> {
    diesel::update(
        event_fires::table
            .filter(event_fires::id.eq_any(fire_ids))
            .filter(event_fires::fired.is_null()),
    )
    .set((
        event_fires::fired.eq(Some(now)),
        event_fires::fired_result.eq(Some(result)),
    ))
    .get_results(conn)
}

/// Returns claimed fires to pending so the next campaign tick picks them up again.
pub fn unclaim_fires(conn: &mut PgConnection, fire_ids: &[Uuid]) -> QueryResult<usize> {
    diesel::update(event_fires::table.filter(event_fires::id.eq_any(fire_ids)))
        .set((
            event_fires::fired.eq(None::<DateTime<Utc>>),
            event_fires::fired_result.eq(None::<String>),
        ))
        .execute(conn)
}

#[derive(Debug, Clone, Queryable)]
struct DueFire {
    fire_id: Uuid,
    event_id: Uuid,
    org_id: Uuid,
}

fn load_due_fires(conn: &mut PgConnection, now: DateTime<Utc>) -> QueryResult<Vec<DueFire>> {
    event_fires::table
        .inner_join(campaign_events::table.inner_join(campaigns::table))
        .filter(event_fires::fired.is_null())
        .filter(event_fires::scheduled.le(now))
        .order(event_fires::scheduled.asc())
        .limit(DUE_FIRES_LIMIT)
        .select((event_fires::id, event_fires::event_id, campaigns::org_id))
        .load(conn)
}

/// The campaign tick: queues one `fire-campaign-event` job per event with due fires.
/// Fires already queued by an earlier tick are skipped until their job finishes with
/// them or their marker runs out.
pub async fn queue_due_fires(state: &AppState, now: DateTime<Utc>) -> CoreResult<usize> {
    let pool = state.pool.clone();
    let due = task::spawn_blocking(move || -> CoreResult<Vec<DueFire>> {
        let mut conn = pool.get()?;
        Ok(load_due_fires(&mut conn, now)?)
    })
    .await??;

    if due.is_empty() {
        return Ok(0);
    }

    let mut by_event: BTreeMap<(Uuid, Uuid), Vec<String>> = BTreeMap::new();
    for fire in due {
        by_event
            .entry((fire.org_id, fire.event_id))
            .or_default()
            .push(fire.fire_id.to_string());
    }

    let mut payloads: Vec<FireCampaignEventPayload> = Vec::with_capacity(by_event.len());
    for ((org_id, event_id), members) in by_event {
        let marked = match state
            .store
            .mark_all(QUEUED_FIRES_KEY, &members, QUEUED_FIRES_TTL)
            .await
        {
            Ok(marked) => marked,
            Err(err) => {
                let earlier: Vec<Uuid> = payloads
                    .iter()
                    .flat_map(|payload| payload.fire_ids.iter().copied())
                    .collect();
                clear_queued_markers(state, &earlier).await;
                return Err(err.into());
            }
        };
        let fire_ids: Vec<Uuid> = marked
            .iter()
            .filter_map(|member| member.parse().ok())
            .collect();
        if !fire_ids.is_empty() {
            payloads.push(FireCampaignEventPayload {
                org_id,
                event_id,
                fire_ids,
            });
        }
    }
    let queued = payloads.len();
    if queued == 0 {
        return Ok(0);
    }

    let marked: Vec<Uuid> = payloads
        .iter()
        .flat_map(|payload| payload.fire_ids.iter().copied())
        .collect();
    let pool = state.pool.clone();
    let enqueued = task::spawn_blocking(move || -> CoreResult<()> {
        let mut conn = pool.get()?;
        conn.transaction(|conn| -> CoreResult<()> {
            for payload in &payloads {
                enqueue_job(conn, JOB_FIRE_CAMPAIGN_EVENT, payload, None)?;
            }
            Ok(())
        })
    })
    .await;

    match enqueued {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            clear_queued_markers(state, &marked).await;
            return Err(err);
        }
        Err(err) => {
            clear_queued_markers(state, &marked).await;
            return Err(err.into());
        }
    }

    debug!(events = queued, "queued due campaign fires");
    Ok(queued)
}

/// Clears the queued markers for fires a job has finished with.
pub(crate) async fn clear_queued_markers(state: &AppState, fire_ids: &[Uuid]) {
    let members: Vec<String> = fire_ids.iter().map(Uuid::to_string).collect();
    if let Err(err) = state.store.unmark(QUEUED_FIRES_KEY, &members).await {
        warn!(error = %err, "failed to clear queued fire markers");
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::contacts::ContactStatus;

    fn contact(status: ContactStatus, joined: &str) -> Contact {
        Contact {
            id: Uuid::new_v4(),
            org_id: Uuid::new_v4(),
            name: None,
            language: None,
            status,
            fields: [("joined".to_string(), joined.to_string())].into_iter().collect(),
            urns: vec![],
            groups: vec![],
            created_on: Utc::now(),
        }
    }

    #[test]
    fn builds_fires_for_active_contacts_with_future_anchors() {
        let event = CampaignEvent {
            id: Uuid::new_v4(),
            campaign_id: Uuid::new_v4(),
            offset: 1,
            unit: "D".to_string(),
            delivery_hour: -1,
            relative_to: "joined".to_string(),
            flow_id: Uuid::new_v4(),
        };
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let contacts = vec![
            contact(ContactStatus::Active, "2024-06-10T10:00:00Z"),
            contact(ContactStatus::Active, "2024-05-01T10:00:00Z"),
            contact(ContactStatus::Stopped, "2024-06-10T10:00:00Z"),
            contact(ContactStatus::Active, "soon"),
        ];

        let fires = fires_for_contacts(chrono_tz::UTC, &event, &contacts, now).unwrap();
        assert_eq!(fires.len(), 1);
        assert_eq!(fires[0].contact_id, contacts[0].id);
        assert_eq!(
            fires[0].scheduled,
            Utc.with_ymd_and_hms(2024, 6, 11, 10, 0, 0).unwrap()
        );
    }
}
