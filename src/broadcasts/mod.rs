//! Broadcasts: logical sends to contacts, groups and URNs, split into fixed-size
//! batches that are turned into messages by [`dispatch`].

use std::collections::{BTreeMap, BTreeSet};

use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::contacts::{get_or_create_contacts_by_urns, group_member_ids};
use crate::error::{CoreError, CoreResult};
use crate::jobs::{enqueue_job, JOB_SEND_BROADCAST, JOB_SEND_BROADCAST_BATCH};
use crate::models::NewBroadcast;
use crate::schema::broadcasts;

pub mod dispatch;
pub mod repetitions;
pub mod templates;

pub use dispatch::{create_messages, draft_messages, MessageDraft};

/// Contacts per batch.
pub const BATCH_SIZE: usize = 100;

pub const BROADCAST_QUEUED: &str = "Q";
pub const BROADCAST_SENT: &str = "S";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Translation {
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<String>,
    #[serde(default)]
    pub quick_replies: Vec<String>,
}

impl Translation {
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.attachments.is_empty() && self.quick_replies.is_empty()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateState {
    Legacy,
    Unevaluated,
    #[default]
    Evaluated,
}

impl TemplateState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::Unevaluated => "unevaluated",
            Self::Evaluated => "evaluated",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Broadcast {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub org_id: Uuid,
    /// Keyed by ISO 639-3 language code.
    pub translations: BTreeMap<String, Translation>,
    pub base_language: String,
    #[serde(default)]
    pub template_state: TemplateState,
    #[serde(default)]
    pub template_name: Option<String>,
    #[serde(default)]
    pub contact_ids: Vec<Uuid>,
    #[serde(default)]
    pub group_ids: Vec<Uuid>,
    #[serde(default)]
    pub urns: Vec<String>,
    #[serde(default)]
    pub parent_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BroadcastBatch {
    pub broadcast_id: Option<Uuid>,
    pub org_id: Uuid,
    pub translations: BTreeMap<String, Translation>,
    pub base_language: String,
    pub template_state: TemplateState,
    pub template_name: Option<String>,
    /// Contacts sent to on their preferred URN.
    pub contact_ids: Vec<Uuid>,
    /// Contacts sent to on a specific URN identity.
    pub urns: BTreeMap<Uuid, String>,
    pub is_last: bool,
}

impl BroadcastBatch {
    /// Every contact this batch may produce a message for.
    pub fn all_contact_ids(&self) -> Vec<Uuid> {
        let mut ids: BTreeSet<Uuid> = self.contact_ids.iter().copied().collect();
        ids.extend(self.urns.keys().copied());
        ids.into_iter().collect()
    }
}

impl Broadcast {
    pub fn validate(&self) -> CoreResult<()> {
        if self.translations.is_empty() {
            return Err(CoreError::validation("broadcast has no translations"));
        }
        if !self.translations.contains_key(&self.base_language) {
            return Err(CoreError::validation(format!(
                "broadcast has no translation for base language {}",
                self.base_language
            )));
        }
        Ok(())
    }

    /// Persists the broadcast as queued and assigns its id.
    pub fn save(&mut self, conn: &mut PgConnection) -> CoreResult<Uuid> {
        self.validate()?;
        let id = *self.id.get_or_insert_with(Uuid::new_v4);
        let row = NewBroadcast {
            id,
            org_id: self.org_id,
            translations: serde_json::to_value(&self.translations)?,
            base_language: self.base_language.clone(),
            template_state: self.template_state.as_str().to_string(),
            template_name: self.template_name.clone(),
            contact_ids: self.contact_ids.clone(),
            group_ids: self.group_ids.clone(),
            urns: self.urns.clone(),
            parent_id: self.parent_id,
            status: BROADCAST_QUEUED.to_string(),
        };
        diesel::insert_into(broadcasts::table)
            .values(&row)
            .on_conflict_do_nothing()
            .execute(conn)?;
        Ok(id)
    }

    /// Resolves groups and URNs to contacts and splits the result into batches.
    pub fn into_batches(self, conn: &mut PgConnection) -> CoreResult<Vec<BroadcastBatch>> {
        self.validate()?;

        let mut preferred: BTreeSet<Uuid> = self.contact_ids.iter().copied().collect();
        if !self.group_ids.is_empty() {
            preferred.extend(group_member_ids(conn, &self.group_ids)?);
        }

        let mut forced: BTreeMap<Uuid, String> = BTreeMap::new();
        if !self.urns.is_empty() {
            for (identity, contact_id) in get_or_create_contacts_by_urns(conn, self.org_id, &self.urns)? {
                forced.entry(contact_id).or_insert(identity);
            }
        }

        Ok(self.split(preferred, forced))
    }

    fn split(self, preferred: BTreeSet<Uuid>, forced: BTreeMap<Uuid, String>) -> Vec<BroadcastBatch> {
        let everyone: Vec<Uuid> = preferred
            .iter()
            .chain(forced.keys())
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let chunks: Vec<&[Uuid]> = everyone.chunks(BATCH_SIZE).collect();
        let total = chunks.len();
        chunks
            .into_iter()
            .enumerate()
            .map(|(index, chunk)| BroadcastBatch {
                broadcast_id: self.id,
                org_id: self.org_id,
                translations: self.translations.clone(),
                base_language: self.base_language.clone(),
                template_state: self.template_state,
                template_name: self.template_name.clone(),
                contact_ids: chunk
                    .iter()
                    .copied()
                    .filter(|id| preferred.contains(id))
                    .collect(),
                urns: chunk
                    .iter()
                    .filter_map(|id| forced.get(id).map(|urn| (*id, urn.clone())))
                    .collect(),
                is_last: index + 1 == total,
            })
            .collect()
    }
}

/// Saves the broadcast and queues the job that splits it into batches, atomically.
pub fn queue_broadcast(conn: &mut PgConnection, mut broadcast: Broadcast) -> CoreResult<Uuid> {
    conn.transaction(|conn| {
        let id = broadcast.save(conn)?;
        enqueue_job(conn, JOB_SEND_BROADCAST, &broadcast, None)?;
        Ok(id)
    })
}

/// Splits a broadcast and queues one job per batch, all or nothing. A broadcast with
/// nobody to send to is marked sent instead.
pub fn queue_batches(conn: &mut PgConnection, broadcast: Broadcast) -> CoreResult<usize> {
    conn.transaction(|conn| {
        let broadcast_id = broadcast.id;
        let batches = broadcast.into_batches(conn)?;
        if batches.is_empty() {
            if let Some(id) = broadcast_id {
                mark_broadcast_sent(conn, id)?;
            }
            return Ok(0);
        }
        for batch in &batches {
            enqueue_job(conn, JOB_SEND_BROADCAST_BATCH, batch, None)?;
        }
        Ok(batches.len())
    })
}

pub fn mark_broadcast_sent(conn: &mut PgConnection, broadcast_id: Uuid) -> QueryResult<usize> {
    diesel::update(broadcasts::table.find(broadcast_id))
        .set(broadcasts::status.eq(BROADCAST_SENT))
        .execute(conn)
}
