use chrono::Utc;
use diesel::Connection;
use tokio::task;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::assets::{Channel, Org, OrgAssets, TemplateStatus};
use crate::contacts::{load_contacts, Contact, ContactUrn};
use crate::error::{CoreError, CoreResult};
use crate::models::{Msg, NewMsg};
use crate::msgs::{allocate_topup, insert_msgs, MsgFailedReason, MsgStatus};
use crate::state::AppState;

use super::repetitions::{is_looping, record_repetition};
use super::templates::{evaluate, migrate_legacy, TemplateContext};
use super::{BroadcastBatch, TemplateState, Translation};

/// A message that will be created for a contact, before its final status is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDraft {
    pub contact_id: Uuid,
    pub contact_urn_id: Uuid,
    pub urn: String,
    pub channel_id: Uuid,
    pub language: String,
    pub content: Translation,
}

fn resolve_destination<'a>(
    assets: &'a OrgAssets,
    contact: &'a Contact,
    forced_urn: Option<&str>,
) -> Option<(&'a ContactUrn, &'a Channel)> {
    match forced_urn {
        Some(identity) => contact.urn_by_identity(identity).and_then(|urn| {
            assets
                .sendable_channel(&urn.scheme, urn.channel_id)
                .map(|channel| (urn, channel))
        }),
        None => contact.urns.iter().find_map(|urn| {
            assets
                .sendable_channel(&urn.scheme, urn.channel_id)
                .map(|channel| (urn, channel))
        }),
    }
}

/// Contact language if the org allows it, then the org default, then the base language.
fn resolve_translation<'b>(
    org: &Org,
    batch: &'b BroadcastBatch,
    contact: &Contact,
) -> Option<(&'b str, &'b Translation)> {
    let contact_language = contact
        .language
        .as_deref()
        .filter(|language| org.allows_language(language));

    [
        contact_language,
        org.default_language.as_deref(),
        Some(batch.base_language.as_str()),
    ]
    .into_iter()
    .flatten()
    .find_map(|language| batch.translations.get_key_value(language))
    .map(|(language, translation)| (language.as_str(), translation))
}

fn render(state: TemplateState, translation: &Translation, context: &TemplateContext<'_>) -> Translation {
    let apply = |text: &str| match state {
        TemplateState::Evaluated => text.to_string(),
        TemplateState::Unevaluated => evaluate(text, context),
        TemplateState::Legacy => evaluate(&migrate_legacy(text), context),
    };
    Translation {
        text: apply(&translation.text),
        attachments: translation.attachments.iter().map(|a| apply(a)).collect(),
        quick_replies: translation.quick_replies.iter().map(|q| apply(q)).collect(),
    }
}

fn draft_for(
    assets: &OrgAssets,
    batch: &BroadcastBatch,
    contact: &Contact,
    forced_urn: Option<&str>,
) -> Option<MessageDraft> {
    let Some((urn, channel)) = resolve_destination(assets, contact, forced_urn) else {
        debug!(contact_id = %contact.id, forced_urn, "no sendable destination, skipping contact");
        return None;
    };

    let Some((language, translation)) = resolve_translation(assets.org(), batch, contact) else {
        warn!(
            contact_id = %contact.id,
            base_language = %batch.base_language,
            "broadcast has no usable translation, skipping contact"
        );
        return None;
    };

    let context = TemplateContext {
        contact,
        globals: assets.globals(),
    };
    let content = render(batch.template_state, translation, &context);
    if content.is_empty() {
        debug!(contact_id = %contact.id, "rendered message is empty, skipping contact");
        return None;
    }

    Some(MessageDraft {
        contact_id: contact.id,
        contact_urn_id: urn.id,
        urn: urn.identity.clone(),
        channel_id: channel.id,
        language: language.to_string(),
        content,
    })
}

/// Everything about a batch's messages that can be decided without I/O. A contact
/// both listed and forced to a URN gets one message per distinct URN.
pub fn draft_messages(
    assets: &OrgAssets,
    batch: &BroadcastBatch,
    contacts: &[Contact],
) -> Vec<MessageDraft> {
    let mut drafts = Vec::new();
    for contact in contacts {
        if !contact.is_active() {
            debug!(contact_id = %contact.id, "contact is not active, skipping");
            continue;
        }

        let forced = batch
            .urns
            .get(&contact.id)
            .and_then(|urn| draft_for(assets, batch, contact, Some(urn)));
        let preferred = batch
            .contact_ids
            .contains(&contact.id)
            .then(|| draft_for(assets, batch, contact, None))
            .flatten();

        match (forced, preferred) {
            (Some(forced), Some(preferred)) if forced.urn == preferred.urn => drafts.push(forced),
            (forced, preferred) => drafts.extend(forced.into_iter().chain(preferred)),
        }
    }
    drafts
}

/// Final status for a draft: failed with a reason, or queued.
fn classify(
    org: &Org,
    looping: bool,
    template_status: Option<TemplateStatus>,
) -> (MsgStatus, Option<MsgFailedReason>) {
    if org.is_suspended {
        (MsgStatus::Failed, Some(MsgFailedReason::Suspended))
    } else if looping {
        (MsgStatus::Failed, Some(MsgFailedReason::Looping))
    } else if template_status == Some(TemplateStatus::Suspended) {
        (MsgStatus::Failed, Some(MsgFailedReason::SuspendedTemplate))
    } else {
        (MsgStatus::Queued, None)
    }
}

/// Turns a batch into persisted messages. Messages that are bound to fail are still
/// written, as failed with a reason. Topup billing and the insert happen in one
/// transaction; a billing error aborts the whole batch.
pub async fn create_messages(
    state: &AppState,
    assets: &OrgAssets,
    batch: &BroadcastBatch,
) -> CoreResult<Vec<Msg>> {
    let org = assets.org().clone();
    if batch.org_id != org.id {
        return Err(CoreError::validation("batch belongs to a different org"));
    }

    let pool = state.pool.clone();
    let contact_ids = batch.all_contact_ids();
    let org_id = org.id;
    let contacts = task::spawn_blocking(move || -> CoreResult<Vec<Contact>> {
        let mut conn = pool.get()?;
        load_contacts(&mut conn, org_id, &contact_ids)
    })
    .await??;

    let drafts = draft_messages(assets, batch, &contacts);
    let now = Utc::now();

    let mut new_msgs = Vec::with_capacity(drafts.len());
    for draft in drafts {
        let looping = !org.is_suspended
            && is_looping(record_repetition(state.store.as_ref(), draft.contact_id, &draft.content.text, now).await);
        let template_status = batch
            .template_name
            .as_deref()
            .and_then(|name| assets.template(name, draft.channel_id, &draft.language))
            .map(|template| template.status);
        let (status, reason) = classify(&org, looping, template_status);

        new_msgs.push(NewMsg {
            id: Uuid::new_v4(),
            org_id: org.id,
            broadcast_id: batch.broadcast_id,
            channel_id: Some(draft.channel_id),
            contact_id: draft.contact_id,
            contact_urn_id: Some(draft.contact_urn_id),
            urn: Some(draft.urn),
            text: draft.content.text,
            attachments: draft.content.attachments,
            quick_replies: draft.content.quick_replies,
            status: status.as_code().to_string(),
            failed_reason: reason.map(|reason| reason.as_code().to_string()),
            topup_id: None,
        });
    }

    if new_msgs.is_empty() {
        debug!(org_id = %org.id, broadcast_id = ?batch.broadcast_id, "batch produced no messages");
        return Ok(Vec::new());
    }

    let pool = state.pool.clone();
    let uses_topups = org.uses_topups;
    let msgs = task::spawn_blocking(move || -> CoreResult<Vec<Msg>> {
        let mut conn = pool.get()?;
        let inserted = conn.transaction(|conn| {
            if uses_topups {
                let amount = i32::try_from(new_msgs.len()).unwrap_or(i32::MAX);
                let topup_id = allocate_topup(conn, org_id, amount, now)?;
                if topup_id.is_none() {
                    warn!(%org_id, amount, "no topup with enough credit for batch");
                }
                for msg in &mut new_msgs {
                    msg.topup_id = topup_id;
                }
            }
            insert_msgs(conn, &new_msgs)
        })?;
        Ok(inserted)
    })
    .await??;

    info!(
        org_id = %org.id,
        broadcast_id = ?batch.broadcast_id,
        contacts = contacts.len(),
        msgs = msgs.len(),
        "created broadcast messages"
    );
    Ok(msgs)
}
