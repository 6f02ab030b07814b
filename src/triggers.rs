//! Picks the single trigger that should start a flow for an inbound event.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use unicode_segmentation::UnicodeSegmentation;
use uuid::Uuid;

use crate::assets::OrgAssets;
use crate::contacts::Contact;
use crate::models::TriggerRow;
use crate::schema::triggers;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TriggerError {
    #[error("unknown trigger type: {0}")]
    UnknownType(String),
    #[error("unknown match type: {0}")]
    UnknownMatchType(String),
    #[error("keyword trigger has no keyword")]
    MissingKeyword,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    Keyword,
    IncomingCall,
    MissedCall,
    NewConversation,
    Referral,
    CatchAll,
    Schedule,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Keyword => "keyword",
            Self::IncomingCall => "incoming_call",
            Self::MissedCall => "missed_call",
            Self::NewConversation => "new_conversation",
            Self::Referral => "referral",
            Self::CatchAll => "catch_all",
            Self::Schedule => "schedule",
        }
    }
}

impl FromStr for TriggerType {
    type Err = TriggerError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "keyword" | "K" => Ok(Self::Keyword),
            "incoming_call" | "V" => Ok(Self::IncomingCall),
            "missed_call" | "M" => Ok(Self::MissedCall),
            "new_conversation" | "N" => Ok(Self::NewConversation),
            "referral" | "R" => Ok(Self::Referral),
            "catch_all" | "C" => Ok(Self::CatchAll),
            "schedule" | "S" => Ok(Self::Schedule),
            other => Err(TriggerError::UnknownType(other.to_string())),
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    FirstWord,
    OnlyWord,
}

impl FromStr for MatchType {
    type Err = TriggerError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "first_word" | "F" => Ok(Self::FirstWord),
            "only_word" | "O" => Ok(Self::OnlyWord),
            other => Err(TriggerError::UnknownMatchType(other.to_string())),
        }
    }
}

/// A standing rule that starts `flow_id` for matching inbound events.
///
/// `match_type` is kept as stored and only parsed while matching, so a trigger with a
/// bad value is skipped for that pass rather than poisoning the whole snapshot.
#[derive(Debug, Clone)]
pub struct Trigger {
    pub id: Uuid,
    pub trigger_type: TriggerType,
    pub flow_id: Uuid,
    pub keyword: Option<String>,
    pub match_type: Option<String>,
    pub referrer_id: Option<String>,
    pub channel_id: Option<Uuid>,
    pub include_groups: Vec<Uuid>,
    pub exclude_groups: Vec<Uuid>,
    pub contacts: Vec<Uuid>,
    pub created_on: DateTime<Utc>,
}

impl TryFrom<TriggerRow> for Trigger {
    type Error = TriggerError;

    fn try_from(row: TriggerRow) -> Result<Self, Self::Error> {
        let trigger_type = row.trigger_type.parse()?;
        if trigger_type == TriggerType::Keyword
            && row.keyword.as_deref().map_or(true, |keyword| keyword.trim().is_empty())
        {
            return Err(TriggerError::MissingKeyword);
        }
        Ok(Self {
            id: row.id,
            trigger_type,
            flow_id: row.flow_id,
            keyword: row.keyword,
            match_type: row.match_type,
            referrer_id: row.referrer_id,
            channel_id: row.channel_id,
            include_groups: row.include_groups,
            exclude_groups: row.exclude_groups,
            contacts: row.contacts,
            created_on: row.created_on,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Text,
    IncomingCall,
    MissedCall,
    NewConversation,
    Referral,
}

impl EventKind {
    fn trigger_type(&self) -> TriggerType {
        match self {
            Self::Text => TriggerType::Keyword,
            Self::IncomingCall => TriggerType::IncomingCall,
            Self::MissedCall => TriggerType::MissedCall,
            Self::NewConversation => TriggerType::NewConversation,
            Self::Referral => TriggerType::Referral,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub kind: EventKind,
    pub channel_id: Option<Uuid>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub referrer_id: Option<String>,
}

const TIER_WEIGHT: u32 = 16;
const CHANNEL_BONUS: u32 = 8;
const REFERRER_BONUS: u32 = 4;
const INCLUDE_BONUS: u32 = 2;
const EXCLUDE_BONUS: u32 = 1;

/// Finds the best trigger in the snapshot for `event` from `contact`.
///
/// Text that matches no keyword falls back to catch-all triggers. Among candidates the
/// highest score wins; equal scores go to the most recently created trigger, then to
/// the greater id so the result never depends on load order.
pub fn find_matching_trigger<'a>(
    assets: &'a OrgAssets,
    event: &InboundEvent,
    contact: &Contact,
) -> Option<&'a Trigger> {
    let wanted = event.kind.trigger_type();
    let tokens = event.text.as_deref().map(tokenize).unwrap_or_default();

    let best = best_candidate(assets.triggers(), wanted, event, contact, &tokens);
    if best.is_some() || event.kind != EventKind::Text {
        return best;
    }

    debug!(contact_id = %contact.id, "no keyword trigger matched, trying catch-all");
    best_candidate(assets.triggers(), TriggerType::CatchAll, event, contact, &tokens)
}

fn best_candidate<'a>(
    triggers: &'a [Trigger],
    wanted: TriggerType,
    event: &InboundEvent,
    contact: &Contact,
    tokens: &[String],
) -> Option<&'a Trigger> {
    triggers
        .iter()
        .filter(|trigger| trigger.trigger_type == wanted)
        .filter(|trigger| {
            trigger
                .channel_id
                .map_or(true, |channel_id| event.channel_id == Some(channel_id))
        })
        .filter(|trigger| wanted != TriggerType::Keyword || keyword_matches(trigger, tokens))
        .filter_map(|trigger| score(trigger, event, contact).map(|score| (score, trigger)))
        .max_by(|(a_score, a), (b_score, b)| {
            a_score
                .cmp(b_score)
                .then_with(|| a.created_on.cmp(&b.created_on))
                .then_with(|| a.id.cmp(&b.id))
        })
        .map(|(_, trigger)| trigger)
}

fn keyword_matches(trigger: &Trigger, tokens: &[String]) -> bool {
    let match_type = match trigger.match_type.as_deref() {
        None => MatchType::FirstWord,
        Some(raw) => match raw.parse::<MatchType>() {
            Ok(match_type) => match_type,
            Err(err) => {
                warn!(trigger_id = %trigger.id, error = %err, "skipping trigger with bad match type");
                return false;
            }
        },
    };

    let keyword = match trigger.keyword.as_deref().map(tokenize) {
        Some(mut keyword) if keyword.len() == 1 => keyword.remove(0),
        _ => {
            warn!(trigger_id = %trigger.id, "skipping trigger with unusable keyword");
            return false;
        }
    };

    match match_type {
        MatchType::FirstWord => tokens.first() == Some(&keyword),
        MatchType::OnlyWord => tokens.len() == 1 && tokens[0] == keyword,
    }
}

/// `None` when the contact is not in scope for the trigger at all.
fn score(trigger: &Trigger, event: &InboundEvent, contact: &Contact) -> Option<u32> {
    if trigger.exclude_groups.iter().any(|group| contact.in_group(*group)) {
        return None;
    }

    if let Some(referrer_id) = trigger.referrer_id.as_deref().filter(|id| !id.is_empty()) {
        if event.referrer_id.as_deref() != Some(referrer_id) {
            return None;
        }
    }

    let listed = trigger.contacts.contains(&contact.id);
    let included = trigger.include_groups.iter().any(|group| contact.in_group(*group));

    let tier = if listed {
        3
    } else if included {
        2
    } else if trigger.contacts.is_empty() && trigger.include_groups.is_empty() {
        1
    } else {
        return None;
    };

    let mut score = tier * TIER_WEIGHT;
    if trigger.channel_id.is_some() {
        score += CHANNEL_BONUS;
    }
    if trigger.referrer_id.as_deref().is_some_and(|id| !id.is_empty()) {
        score += REFERRER_BONUS;
    }
    if included {
        score += INCLUDE_BONUS;
    }
    if !trigger.exclude_groups.is_empty() {
        score += EXCLUDE_BONUS;
    }
    Some(score)
}

/// Lowercased word tokens of `text`, split on Unicode word boundaries. Each emoji
/// grapheme (flags, keycaps, skin tones and zero-width-joined sequences included) is
/// one token on its own.
pub fn tokenize(text: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    for segment in text.split_word_bounds() {
        if segment.chars().any(is_pictographic) {
            tokens.extend(
                segment
                    .graphemes(true)
                    .filter(|grapheme| grapheme.chars().any(is_pictographic))
                    .map(str::to_string),
            );
        } else if segment.chars().any(char::is_alphanumeric) {
            tokens.push(segment.to_lowercase());
        }
    }
    tokens
}

fn is_pictographic(ch: char) -> bool {
    matches!(
        ch as u32,
        0x00A9 | 0x00AE | 0x203C | 0x2049 | 0x20E3 | 0x2122 | 0x2139
            | 0x2190..=0x2BFF
            | 0x3030 | 0x303D | 0x3297 | 0x3299
            | 0x1F000..=0x1FAFF
    )
}

/// Drops released contacts from trigger contact lists, archiving triggers left with
/// nobody in scope. Returns the ids of the archived triggers.
pub fn archive_contact_triggers(
    conn: &mut PgConnection,
    contact_ids: &[Uuid],
) -> QueryResult<Vec<Uuid>> {
    if contact_ids.is_empty() {
        return Ok(Vec::new());
    }

    conn.transaction(|conn| {
        let affected: Vec<TriggerRow> = triggers::table
            .filter(triggers::is_archived.eq(false))
            .filter(triggers::contacts.overlaps_with(contact_ids))
            .for_update()
            .load(conn)?;

        let mut archived = Vec::new();
        for trigger in affected {
            let remaining: Vec<Uuid> = trigger
                .contacts
                .iter()
                .copied()
                .filter(|id| !contact_ids.contains(id))
                .collect();
            let archive = remaining.is_empty() && trigger.include_groups.is_empty();

            diesel::update(triggers::table.find(trigger.id))
                .set((
                    triggers::contacts.eq(&remaining),
                    triggers::is_archived.eq(archive),
                ))
                .execute(conn)?;

            if archive {
                archived.push(trigger.id);
            }
        }

        if !archived.is_empty() {
            debug!(count = archived.len(), "archived triggers left without contacts");
        }
        Ok(archived)
    })
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, TimeZone};

    use super::*;
    use crate::assets::fixtures;
    use crate::contacts::{ContactStatus, ContactUrn};

    fn trigger(trigger_type: TriggerType, created_offset_minutes: i64) -> Trigger {
        Trigger {
            id: Uuid::new_v4(),
            trigger_type,
            flow_id: Uuid::new_v4(),
            keyword: None,
            match_type: None,
            referrer_id: None,
            channel_id: None,
            include_groups: vec![],
            exclude_groups: vec![],
            contacts: vec![],
            created_on: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
                + Duration::minutes(created_offset_minutes),
        }
    }

    fn keyword(word: &str, match_type: &str, created_offset_minutes: i64) -> Trigger {
        Trigger {
            keyword: Some(word.to_string()),
            match_type: Some(match_type.to_string()),
            ..trigger(TriggerType::Keyword, created_offset_minutes)
        }
    }

    fn contact(groups: Vec<Uuid>) -> Contact {
        Contact {
            id: Uuid::new_v4(),
            org_id: Uuid::new_v4(),
            name: Some("Ann".to_string()),
            language: None,
            status: ContactStatus::Active,
            fields: Default::default(),
            urns: Vec::<ContactUrn>::new(),
            groups,
            created_on: Utc::now(),
        }
    }

    fn text(body: &str) -> InboundEvent {
        InboundEvent {
            kind: EventKind::Text,
            channel_id: None,
            text: Some(body.to_string()),
            referrer_id: None,
        }
    }

    fn assets(triggers: Vec<Trigger>) -> OrgAssets {
        OrgAssets::new(fixtures::org(chrono_tz::UTC)).with_triggers(triggers)
    }

    #[test]
    fn tokenizes_words_and_emoji() {
        assert_eq!(tokenize("  JOIN now!"), vec!["join", "now"]);
        assert_eq!(tokenize("👍🏽yes"), vec!["👍🏽", "yes"]);
        assert_eq!(tokenize("🎉🎉"), vec!["🎉", "🎉"]);
        assert_eq!(tokenize("👨\u{200D}👩 hi"), vec!["👨\u{200D}👩", "hi"]);
        assert!(tokenize("?!").is_empty());
    }

    #[test]
    fn flags_keycaps_and_joined_emoji_are_single_tokens() {
        assert_eq!(tokenize("🇷🇼 hello"), vec!["🇷🇼", "hello"]);
        assert_eq!(tokenize("🇷🇼🇺🇸"), vec!["🇷🇼", "🇺🇸"]);
        assert_eq!(tokenize("hi #️⃣"), vec!["hi", "#\u{FE0F}\u{20E3}"]);
        assert_eq!(tokenize("1️⃣ more"), vec!["1\u{FE0F}\u{20E3}", "more"]);
        assert_eq!(
            tokenize("👩\u{200D}👩\u{200D}👧 family"),
            vec!["👩\u{200D}👩\u{200D}👧", "family"]
        );
        assert_eq!(tokenize("❤\u{FE0F} you"), vec!["❤\u{FE0F}", "you"]);
    }

    #[test]
    fn first_word_and_only_word_matching() {
        let first = keyword("join", "first_word", 0);
        let only = keyword("stop", "only_word", 0);
        let snapshot = assets(vec![first.clone(), only.clone()]);
        let ann = contact(vec![]);

        let found = find_matching_trigger(&snapshot, &text("Join the club"), &ann);
        assert_eq!(found.map(|t| t.id), Some(first.id));

        let found = find_matching_trigger(&snapshot, &text("STOP."), &ann);
        assert_eq!(found.map(|t| t.id), Some(only.id));

        assert!(find_matching_trigger(&snapshot, &text("stop it"), &ann).is_none());
        assert!(find_matching_trigger(&snapshot, &text("please join"), &ann).is_none());
    }

    #[test]
    fn emoji_keywords_match_as_single_tokens() {
        let party = keyword("🎉", "first_word", 0);
        let snapshot = assets(vec![party.clone()]);
        let found = find_matching_trigger(&snapshot, &text("🎉🎉 woo"), &contact(vec![]));
        assert_eq!(found.map(|t| t.id), Some(party.id));
    }

    #[test]
    fn flag_keywords_match_the_whole_flag() {
        let rwanda = keyword("🇷🇼", "first_word", 0);
        let snapshot = assets(vec![rwanda.clone()]);
        let ann = contact(vec![]);

        let found = find_matching_trigger(&snapshot, &text("🇷🇼 hello"), &ann);
        assert_eq!(found.map(|t| t.id), Some(rwanda.id));
        assert!(find_matching_trigger(&snapshot, &text("🇺🇸 hello"), &ann).is_none());
    }

    #[test]
    fn recency_breaks_ties_regardless_of_order() {
        let group = Uuid::new_v4();
        let mut older = keyword("join", "first_word", 0);
        older.include_groups = vec![group];
        let mut newer = keyword("join", "first_word", 30);
        newer.include_groups = vec![group];
        let ann = contact(vec![group]);

        for order in [vec![older.clone(), newer.clone()], vec![newer.clone(), older.clone()]] {
            let snapshot = assets(order);
            let found = find_matching_trigger(&snapshot, &text("join"), &ann);
            assert_eq!(found.map(|t| t.id), Some(newer.id));
        }
    }

    #[test]
    fn more_specific_tiers_beat_recency() {
        let group = Uuid::new_v4();
        let ann = contact(vec![group]);

        let mut listed = keyword("join", "first_word", 0);
        listed.contacts = vec![ann.id];
        let mut grouped = keyword("join", "first_word", 10);
        grouped.include_groups = vec![group];
        let open = keyword("join", "first_word", 20);

        let snapshot = assets(vec![open.clone(), grouped.clone(), listed.clone()]);
        let found = find_matching_trigger(&snapshot, &text("join"), &ann);
        assert_eq!(found.map(|t| t.id), Some(listed.id));

        let other = contact(vec![group]);
        let found = find_matching_trigger(&snapshot, &text("join"), &other);
        assert_eq!(found.map(|t| t.id), Some(grouped.id));

        let stranger = contact(vec![]);
        let found = find_matching_trigger(&snapshot, &text("join"), &stranger);
        assert_eq!(found.map(|t| t.id), Some(open.id));
    }

    #[test]
    fn exclusions_remove_contacts_and_passed_exclusions_score_higher() {
        let vips = Uuid::new_v4();
        let blocked = Uuid::new_v4();
        let mut excluding = keyword("join", "first_word", 0);
        excluding.exclude_groups = vec![blocked];
        let plain = keyword("join", "first_word", 10);
        let snapshot = assets(vec![excluding.clone(), plain.clone()]);

        let found = find_matching_trigger(&snapshot, &text("join"), &contact(vec![vips]));
        assert_eq!(found.map(|t| t.id), Some(excluding.id));

        let found = find_matching_trigger(&snapshot, &text("join"), &contact(vec![blocked]));
        assert_eq!(found.map(|t| t.id), Some(plain.id));
    }

    #[test]
    fn channel_filters_apply_and_outrank_unfiltered() {
        let channel_id = Uuid::new_v4();
        let mut on_channel = trigger(TriggerType::NewConversation, 0);
        on_channel.channel_id = Some(channel_id);
        let anywhere = trigger(TriggerType::NewConversation, 10);
        let snapshot = assets(vec![on_channel.clone(), anywhere.clone()]);
        let ann = contact(vec![]);

        let mut event = InboundEvent {
            kind: EventKind::NewConversation,
            channel_id: Some(channel_id),
            text: None,
            referrer_id: None,
        };
        let found = find_matching_trigger(&snapshot, &event, &ann);
        assert_eq!(found.map(|t| t.id), Some(on_channel.id));

        event.channel_id = Some(Uuid::new_v4());
        let found = find_matching_trigger(&snapshot, &event, &ann);
        assert_eq!(found.map(|t| t.id), Some(anywhere.id));
    }

    #[test]
    fn referral_triggers_filter_on_referrer() {
        let mut specific = trigger(TriggerType::Referral, 0);
        specific.referrer_id = Some("promo".to_string());
        let generic = trigger(TriggerType::Referral, 10);
        let snapshot = assets(vec![specific.clone(), generic.clone()]);
        let ann = contact(vec![]);

        let mut event = InboundEvent {
            kind: EventKind::Referral,
            channel_id: None,
            text: None,
            referrer_id: Some("promo".to_string()),
        };
        assert_eq!(
            find_matching_trigger(&snapshot, &event, &ann).map(|t| t.id),
            Some(specific.id)
        );

        event.referrer_id = Some("other".to_string());
        assert_eq!(
            find_matching_trigger(&snapshot, &event, &ann).map(|t| t.id),
            Some(generic.id)
        );
    }

    #[test]
    fn text_without_keyword_falls_back_to_catch_all() {
        let catch_all = trigger(TriggerType::CatchAll, 0);
        let join = keyword("join", "first_word", 0);
        let snapshot = assets(vec![catch_all.clone(), join.clone()]);
        let ann = contact(vec![]);

        let found = find_matching_trigger(&snapshot, &text("hello"), &ann);
        assert_eq!(found.map(|t| t.id), Some(catch_all.id));

        let missed = InboundEvent {
            kind: EventKind::MissedCall,
            channel_id: None,
            text: None,
            referrer_id: None,
        };
        assert!(find_matching_trigger(&snapshot, &missed, &ann).is_none());
    }

    #[test]
    fn unknown_match_types_are_skipped() {
        let broken = keyword("join", "sounds_like", 50);
        let good = keyword("join", "first_word", 0);
        let snapshot = assets(vec![broken, good.clone()]);
        let found = find_matching_trigger(&snapshot, &text("join"), &contact(vec![]));
        assert_eq!(found.map(|t| t.id), Some(good.id));
    }

    #[test]
    fn parses_trigger_codes() {
        assert_eq!("K".parse::<TriggerType>(), Ok(TriggerType::Keyword));
        assert_eq!("catch_all".parse::<TriggerType>(), Ok(TriggerType::CatchAll));
        assert!(matches!(
            "webhook".parse::<TriggerType>(),
            Err(TriggerError::UnknownType(_))
        ));
    }
}
