use chrono_tz::Tz;
use uuid::Uuid;

use crate::models::{ChannelRow, FlowRow, GroupRow, OrgRow, TemplateRow};

#[derive(Debug, Clone)]
pub struct Org {
    pub id: Uuid,
    pub name: String,
    pub is_suspended: bool,
    pub uses_topups: bool,
    pub default_language: Option<String>,
    pub allowed_languages: Vec<String>,
    pub timezone: Tz,
}

impl Org {
    pub fn allows_language(&self, language: &str) -> bool {
        self.allowed_languages.iter().any(|allowed| allowed == language)
    }
}

impl From<OrgRow> for Org {
    fn from(row: OrgRow) -> Self {
        let timezone = row.timezone.parse::<Tz>().unwrap_or_else(|_| {
            tracing::warn!(org_id = %row.id, timezone = %row.timezone, "unknown org timezone, using UTC");
            chrono_tz::UTC
        });
        Self {
            id: row.id,
            name: row.name,
            is_suspended: row.is_suspended,
            uses_topups: row.uses_topups,
            default_language: row.default_language,
            allowed_languages: row.allowed_languages,
            timezone,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    Send,
    Receive,
    Call,
    Answer,
}

impl ChannelRole {
    pub fn from_code(code: char) -> Option<Self> {
        match code {
            'S' => Some(Self::Send),
            'R' => Some(Self::Receive),
            'C' => Some(Self::Call),
            'A' => Some(Self::Answer),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Channel {
    pub id: Uuid,
    pub org_id: Uuid,
    pub name: String,
    pub channel_type: String,
    pub address: Option<String>,
    pub schemes: Vec<String>,
    pub roles: Vec<ChannelRole>,
    pub config: serde_json::Value,
}

impl Channel {
    pub fn has_role(&self, role: ChannelRole) -> bool {
        self.roles.contains(&role)
    }

    pub fn supports_scheme(&self, scheme: &str) -> bool {
        self.schemes.iter().any(|supported| supported == scheme)
    }

    /// Whether a message addressed to a URN of `scheme` can go out over this channel.
    pub fn can_send_to(&self, scheme: &str) -> bool {
        self.has_role(ChannelRole::Send) && self.supports_scheme(scheme)
    }
}

impl From<ChannelRow> for Channel {
    fn from(row: ChannelRow) -> Self {
        Self {
            id: row.id,
            org_id: row.org_id,
            name: row.name,
            channel_type: row.channel_type,
            address: row.address,
            schemes: row.schemes,
            roles: row.roles.chars().filter_map(ChannelRole::from_code).collect(),
            config: row.config,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Group {
    pub id: Uuid,
    pub name: String,
}

impl From<GroupRow> for Group {
    fn from(row: GroupRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Flow {
    pub id: Uuid,
    pub name: String,
    pub is_active: bool,
}

impl From<FlowRow> for Flow {
    fn from(row: FlowRow) -> Self {
        Self {
            id: row.id,
            name: row.name,
            is_active: row.is_active,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateStatus {
    Approved,
    Pending,
    Rejected,
    Suspended,
}

impl TemplateStatus {
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "A" => Some(Self::Approved),
            "P" => Some(Self::Pending),
            "R" => Some(Self::Rejected),
            "S" => Some(Self::Suspended),
            _ => None,
        }
    }
}

/// One channel+language translation of a messaging template.
#[derive(Debug, Clone)]
pub struct Template {
    pub name: String,
    pub channel_id: Uuid,
    pub language: String,
    pub status: TemplateStatus,
}

impl TryFrom<TemplateRow> for Template {
    type Error = String;

    fn try_from(row: TemplateRow) -> Result<Self, Self::Error> {
        let status = TemplateStatus::from_code(&row.status)
            .ok_or_else(|| format!("unknown template status {}", row.status))?;
        Ok(Self {
            name: row.name,
            channel_id: row.channel_id,
            language: row.language,
            status,
        })
    }
}
