use chrono::{DateTime, Utc};
use diesel::prelude::*;
use uuid::Uuid;

use crate::schema::*;

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = orgs)]
pub struct OrgRow {
    pub id: Uuid,
    pub name: String,
    pub is_suspended: bool,
    pub uses_topups: bool,
    pub default_language: Option<String>,
    pub allowed_languages: Vec<String>,
    pub timezone: String,
    pub created_on: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = channels)]
pub struct ChannelRow {
    pub id: Uuid,
    pub org_id: Uuid,
    pub name: String,
    pub channel_type: String,
    pub address: Option<String>,
    pub schemes: Vec<String>,
    pub roles: String,
    pub is_active: bool,
    pub config: serde_json::Value,
    pub created_on: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = contact_groups)]
pub struct GroupRow {
    pub id: Uuid,
    pub org_id: Uuid,
    pub name: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = contacts)]
pub struct ContactRow {
    pub id: Uuid,
    pub org_id: Uuid,
    pub name: Option<String>,
    pub language: Option<String>,
    pub status: String,
    pub fields: serde_json::Value,
    pub created_on: DateTime<Utc>,
    pub modified_on: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = contacts)]
pub struct NewContact {
    pub id: Uuid,
    pub org_id: Uuid,
    pub name: Option<String>,
    pub language: Option<String>,
    pub status: String,
    pub fields: serde_json::Value,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = contact_urns)]
pub struct ContactUrnRow {
    pub id: Uuid,
    pub org_id: Uuid,
    pub contact_id: Option<Uuid>,
    pub scheme: String,
    pub path: String,
    pub identity: String,
    pub priority: i32,
    pub channel_id: Option<Uuid>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = contact_urns)]
pub struct NewContactUrn {
    pub id: Uuid,
    pub org_id: Uuid,
    pub contact_id: Option<Uuid>,
    pub scheme: String,
    pub path: String,
    pub identity: String,
    pub priority: i32,
    pub channel_id: Option<Uuid>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = contact_group_members)]
pub struct GroupMembership {
    pub contact_id: Uuid,
    pub group_id: Uuid,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = flows)]
pub struct FlowRow {
    pub id: Uuid,
    pub org_id: Uuid,
    pub name: String,
    pub flow_type: String,
    pub is_active: bool,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = triggers)]
pub struct TriggerRow {
    pub id: Uuid,
    pub org_id: Uuid,
    pub trigger_type: String,
    pub flow_id: Uuid,
    pub keyword: Option<String>,
    pub match_type: Option<String>,
    pub referrer_id: Option<String>,
    pub channel_id: Option<Uuid>,
    pub include_groups: Vec<Uuid>,
    pub exclude_groups: Vec<Uuid>,
    pub contacts: Vec<Uuid>,
    pub is_archived: bool,
    pub created_on: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = campaigns)]
pub struct CampaignRow {
    pub id: Uuid,
    pub org_id: Uuid,
    pub name: String,
    pub group_id: Uuid,
    pub is_active: bool,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = campaign_events)]
pub struct CampaignEventRow {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub event_offset: i32,
    pub unit: String,
    pub delivery_hour: i32,
    pub relative_to: String,
    pub flow_id: Uuid,
    pub is_active: bool,
    pub created_on: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = event_fires)]
pub struct EventFire {
    pub id: Uuid,
    pub contact_id: Uuid,
    pub event_id: Uuid,
    pub scheduled: DateTime<Utc>,
    pub fired: Option<DateTime<Utc>>,
    pub fired_result: Option<String>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = event_fires)]
pub struct NewEventFire {
    pub id: Uuid,
    pub contact_id: Uuid,
    pub event_id: Uuid,
    pub scheduled: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = templates)]
pub struct TemplateRow {
    pub id: Uuid,
    pub org_id: Uuid,
    pub name: String,
    pub channel_id: Uuid,
    pub language: String,
    pub status: String,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = globals)]
pub struct GlobalRow {
    pub id: Uuid,
    pub org_id: Uuid,
    pub key: String,
    pub value: String,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = topups)]
pub struct Topup {
    pub id: Uuid,
    pub org_id: Uuid,
    pub credits: i32,
    pub used: i32,
    pub expires_on: DateTime<Utc>,
    pub is_active: bool,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = broadcasts)]
pub struct BroadcastRow {
    pub id: Uuid,
    pub org_id: Uuid,
    pub translations: serde_json::Value,
    pub base_language: String,
    pub template_state: String,
    pub template_name: Option<String>,
    pub contact_ids: Vec<Uuid>,
    pub group_ids: Vec<Uuid>,
    pub urns: Vec<String>,
    pub parent_id: Option<Uuid>,
    pub status: String,
    pub created_on: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = broadcasts)]
pub struct NewBroadcast {
    pub id: Uuid,
    pub org_id: Uuid,
    pub translations: serde_json::Value,
    pub base_language: String,
    pub template_state: String,
    pub template_name: Option<String>,
    pub contact_ids: Vec<Uuid>,
    pub group_ids: Vec<Uuid>,
    pub urns: Vec<String>,
    pub parent_id: Option<Uuid>,
    pub status: String,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = msgs)]
pub struct Msg {
    pub id: Uuid,
    pub org_id: Uuid,
    pub broadcast_id: Option<Uuid>,
    pub channel_id: Option<Uuid>,
    pub contact_id: Uuid,
    pub contact_urn_id: Option<Uuid>,
    pub urn: Option<String>,
    pub text: String,
    pub attachments: Vec<String>,
    pub quick_replies: Vec<String>,
    pub status: String,
    pub failed_reason: Option<String>,
    pub error_count: i32,
    pub next_attempt: Option<DateTime<Utc>>,
    pub external_id: Option<String>,
    pub topup_id: Option<Uuid>,
    pub created_on: DateTime<Utc>,
    pub modified_on: DateTime<Utc>,
    pub sent_on: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Insertable)]
#[diesel(table_name = msgs)]
pub struct NewMsg {
    pub id: Uuid,
    pub org_id: Uuid,
    pub broadcast_id: Option<Uuid>,
    pub channel_id: Option<Uuid>,
    pub contact_id: Uuid,
    pub contact_urn_id: Option<Uuid>,
    pub urn: Option<String>,
    pub text: String,
    pub attachments: Vec<String>,
    pub quick_replies: Vec<String>,
    pub status: String,
    pub failed_reason: Option<String>,
    pub topup_id: Option<Uuid>,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = channel_connections)]
pub struct ChannelConnection {
    pub id: Uuid,
    pub org_id: Uuid,
    pub channel_id: Uuid,
    pub contact_id: Uuid,
    pub contact_urn_id: Uuid,
    pub direction: String,
    pub status: String,
    pub external_id: Option<String>,
    pub error_count: i32,
    pub retry_count: i32,
    pub next_attempt: Option<DateTime<Utc>>,
    pub started_on: Option<DateTime<Utc>>,
    pub ended_on: Option<DateTime<Utc>>,
    pub created_on: DateTime<Utc>,
    pub modified_on: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = flow_sessions)]
pub struct FlowSession {
    pub id: Uuid,
    pub org_id: Uuid,
    pub contact_id: Uuid,
    pub status: String,
    pub connection_id: Option<Uuid>,
    pub wait_expires_on: Option<DateTime<Utc>>,
    pub ended_on: Option<DateTime<Utc>>,
    pub created_on: DateTime<Utc>,
}

#[derive(Debug, Clone, Queryable, Identifiable)]
#[diesel(table_name = jobs)]
pub struct Job {
    pub id: Uuid,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub attempts: i32,
    pub run_after: DateTime<Utc>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Insertable)]
#[diesel(table_name = jobs)]
pub struct NewJob {
    pub id: Uuid,
    pub job_type: String,
    pub payload: serde_json::Value,
    pub status: String,
    pub run_after: DateTime<Utc>,
}
