//! Campaign events and the fire-time arithmetic behind them.

use chrono::{DateTime, Days, LocalResult, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use thiserror::Error;
use uuid::Uuid;

use crate::contacts::Contact;
use crate::models::CampaignEventRow;

mod fires;

pub use fires::{
    add_event_fires, claim_fires, delete_unfired_fires_for_groups, fires_for_contacts,
    queue_due_fires, schedule_campaign_event, schedule_fires_for_contacts, unclaim_fires,
    FireCampaignEventPayload, FIRED_RESULT_FIRED, FIRED_RESULT_SKIPPED,
};
pub(crate) use fires::clear_queued_markers;

/// Sentinel stored in `delivery_hour` when the computed time of day is kept.
pub const NO_DELIVERY_HOUR: i32 = -1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("unknown offset unit: {0}")]
    UnknownUnit(String),
    #[error("invalid delivery hour: {0}")]
    InvalidDeliveryHour(i32),
    #[error("offset of {offset} {unit} is out of range")]
    OutOfRange { offset: i32, unit: &'static str },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetUnit {
    Minutes,
    Hours,
    Days,
    Weeks,
}

impl OffsetUnit {
    pub fn from_code(code: &str) -> Result<Self, ScheduleError> {
        match code {
            "M" => Ok(Self::Minutes),
            "H" => Ok(Self::Hours),
            "D" => Ok(Self::Days),
            "W" => Ok(Self::Weeks),
            other => Err(ScheduleError::UnknownUnit(other.to_string())),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Minutes => "minutes",
            Self::Hours => "hours",
            Self::Days => "days",
            Self::Weeks => "weeks",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Campaign {
    pub id: Uuid,
    pub name: String,
    pub group_id: Uuid,
    pub events: Vec<CampaignEvent>,
}

#[derive(Debug, Clone)]
pub struct CampaignEvent {
    pub id: Uuid,
    pub campaign_id: Uuid,
    pub offset: i32,
    /// Raw unit code; validated when a fire time is computed.
    pub unit: String,
    pub delivery_hour: i32,
    pub relative_to: String,
    pub flow_id: Uuid,
}

impl From<CampaignEventRow> for CampaignEvent {
    fn from(row: CampaignEventRow) -> Self {
        Self {
            id: row.id,
            campaign_id: row.campaign_id,
            offset: row.event_offset,
            unit: row.unit,
            delivery_hour: row.delivery_hour,
            relative_to: row.relative_to,
            flow_id: row.flow_id,
        }
    }
}

impl CampaignEvent {
    fn delivery_hour(&self) -> Result<Option<u32>, ScheduleError> {
        match self.delivery_hour {
            NO_DELIVERY_HOUR => Ok(None),
            hour @ 0..=23 => Ok(Some(hour as u32)),
            other => Err(ScheduleError::InvalidDeliveryHour(other)),
        }
    }

    /// When this event should fire for an anchor of `anchor`, evaluated in `tz`.
    ///
    /// Minute and hour offsets are exact durations. Day and week offsets move the
    /// civil date, so the elapsed time across a DST change is 23 or 25 hours per day.
    /// `Ok(None)` means the moment is not after `now`.
    pub fn schedule_for_time(
        &self,
        tz: Tz,
        now: DateTime<Utc>,
        anchor: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        let unit = OffsetUnit::from_code(&self.unit)?;
        let delivery_hour = self.delivery_hour()?;
        let out_of_range = || ScheduleError::OutOfRange {
            offset: self.offset,
            unit: unit.name(),
        };

        let mut start = anchor.with_timezone(&tz).naive_local();
        if let Some(hour) = delivery_hour {
            start = snap_to_hour(start, hour);
        }
        let start = resolve_local(tz, start).ok_or_else(out_of_range)?;

        let offset = i64::from(self.offset);
        let shifted = match unit {
            OffsetUnit::Minutes => start.checked_add_signed(chrono::Duration::minutes(offset)),
            OffsetUnit::Hours => start.checked_add_signed(chrono::Duration::hours(offset)),
            OffsetUnit::Days => add_civil_days(tz, start, offset),
            OffsetUnit::Weeks => add_civil_days(tz, start, offset * 7),
        }
        .ok_or_else(out_of_range)?;

        let scheduled = match delivery_hour {
            Some(hour) => {
                let local = snap_to_hour(shifted.with_timezone(&tz).naive_local(), hour);
                resolve_local(tz, local).ok_or_else(out_of_range)?
            }
            None => shifted,
        };

        Ok((scheduled > now).then_some(scheduled))
    }

    /// Same as [`schedule_for_time`](Self::schedule_for_time) with the anchor read from
    /// the contact. Contacts with no usable anchor value get no fire.
    pub fn schedule_for_contact(
        &self,
        tz: Tz,
        now: DateTime<Utc>,
        contact: &Contact,
    ) -> Result<Option<DateTime<Utc>>, ScheduleError> {
        match contact
            .field(&self.relative_to)
            .and_then(|value| parse_anchor(tz, &value))
        {
            Some(anchor) => self.schedule_for_time(tz, now, anchor),
            None => {
                OffsetUnit::from_code(&self.unit)?;
                Ok(None)
            }
        }
    }
}

fn snap_to_hour(local: NaiveDateTime, hour: u32) -> NaiveDateTime {
    local
        .date()
        .and_time(NaiveTime::from_hms_opt(hour, 0, 0).unwrap_or(NaiveTime::MIN))
}

fn add_civil_days(tz: Tz, start: DateTime<Utc>, days: i64) -> Option<DateTime<Utc>> {
    let local = start.with_timezone(&tz).naive_local();
    let moved = if days >= 0 {
        local.checked_add_days(Days::new(days.unsigned_abs()))
    } else {
        local.checked_sub_days(Days::new(days.unsigned_abs()))
    }?;
    resolve_local(tz, moved)
}

/// Pins a wall-clock time in `tz` to an instant. Ambiguous times take the earlier
/// instant; times inside a spring-forward gap move forward an hour at a time.
fn resolve_local(tz: Tz, local: NaiveDateTime) -> Option<DateTime<Utc>> {
    let mut candidate = local;
    for _ in 0..3 {
        match tz.from_local_datetime(&candidate) {
            LocalResult::Single(resolved) => return Some(resolved.with_timezone(&Utc)),
            LocalResult::Ambiguous(earliest, _) => return Some(earliest.with_timezone(&Utc)),
            LocalResult::None => {
                candidate = candidate.checked_add_signed(chrono::Duration::hours(1))?;
            }
        }
    }
    None
}

fn parse_anchor(tz: Tz, value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| resolve_local(tz, date.and_time(NaiveTime::MIN)))
}
