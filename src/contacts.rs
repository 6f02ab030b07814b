use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use diesel::pg::PgConnection;
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::error::{CoreError, CoreResult};
use crate::models::{ContactRow, ContactUrnRow, GroupMembership, NewContact, NewContactUrn};
use crate::schema::{contact_group_members, contact_urns, contacts, event_fires};
use crate::triggers::archive_contact_triggers;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactStatus {
    Active,
    Blocked,
    Stopped,
    Archived,
}

impl ContactStatus {
    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "A" => Some(Self::Active),
            "B" => Some(Self::Blocked),
            "S" => Some(Self::Stopped),
            "V" => Some(Self::Archived),
            _ => None,
        }
    }

    pub fn as_code(&self) -> &'static str {
        match self {
            Self::Active => "A",
            Self::Blocked => "B",
            Self::Stopped => "S",
            Self::Archived => "V",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContactUrn {
    pub id: Uuid,
    pub scheme: String,
    pub path: String,
    pub identity: String,
    pub priority: i32,
    pub channel_id: Option<Uuid>,
}

impl From<ContactUrnRow> for ContactUrn {
    fn from(row: ContactUrnRow) -> Self {
        Self {
            id: row.id,
            scheme: row.scheme,
            path: row.path,
            identity: row.identity,
            priority: row.priority,
            channel_id: row.channel_id,
        }
    }
}

/// A parsed `scheme:path` address in its normalized form.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Urn {
    pub scheme: String,
    pub path: String,
}

impl Urn {
    pub fn parse(raw: &str) -> CoreResult<Self> {
        let (scheme, path) = raw
            .split_once(':')
            .ok_or_else(|| CoreError::validation(format!("invalid URN: {raw}")))?;
        let scheme = scheme.trim().to_ascii_lowercase();
        let path = path.trim();
        if scheme.is_empty() || path.is_empty() {
            return Err(CoreError::validation(format!("invalid URN: {raw}")));
        }

        let path = match scheme.as_str() {
            "tel" => path
                .chars()
                .filter(|ch| ch.is_ascii_digit() || *ch == '+')
                .collect(),
            "mailto" => path.to_lowercase(),
            _ => path.to_string(),
        };
        if path.is_empty() {
            return Err(CoreError::validation(format!("invalid URN: {raw}")));
        }
        Ok(Self { scheme, path })
    }

    pub fn identity(&self) -> String {
        format!("{}:{}", self.scheme, self.path)
    }
}

#[derive(Debug, Clone)]
pub struct Contact {
    pub id: Uuid,
    pub org_id: Uuid,
    pub name: Option<String>,
    pub language: Option<String>,
    pub status: ContactStatus,
    /// Keyed by lowercased field key.
    pub fields: BTreeMap<String, String>,
    /// Highest priority first.
    pub urns: Vec<ContactUrn>,
    pub groups: Vec<Uuid>,
    pub created_on: DateTime<Utc>,
}

impl Contact {
    pub fn is_active(&self) -> bool {
        self.status == ContactStatus::Active
    }

    pub fn in_group(&self, group_id: Uuid) -> bool {
        self.groups.contains(&group_id)
    }

    pub fn urn_by_identity(&self, identity: &str) -> Option<&ContactUrn> {
        self.urns.iter().find(|urn| urn.identity == identity)
    }

    /// Value of a contact field or one of the built-in anchors (`created_on`).
    /// Keys are matched ignoring case.
    pub fn field(&self, key: &str) -> Option<String> {
        let key = key.to_lowercase();
        match key.as_str() {
            "created_on" => Some(self.created_on.to_rfc3339()),
            "name" => self.name.clone(),
            "language" => self.language.clone(),
            _ => self.fields.get(&key).cloned(),
        }
    }
}

pub(crate) fn field_map(value: serde_json::Value) -> BTreeMap<String, String> {
    match value {
        serde_json::Value::Object(entries) => entries
            .into_iter()
            .filter_map(|(key, value)| match value {
                serde_json::Value::String(text) => Some((key.to_lowercase(), text)),
                serde_json::Value::Null => None,
                other => Some((key.to_lowercase(), other.to_string())),
            })
            .collect(),
        _ => BTreeMap::new(),
    }
}

/// The URN still attached to `contact_id`, if it has not been removed or taken over
/// by another contact.
pub fn contact_urn(
    conn: &mut PgConnection,
    contact_id: Uuid,
    urn_id: Uuid,
) -> QueryResult<Option<ContactUrn>> {
    contact_urns::table
        .find(urn_id)
        .filter(contact_urns::contact_id.eq(contact_id))
        .first::<ContactUrnRow>(conn)
        .optional()
        .map(|row| row.map(ContactUrn::from))
}

/// Loads contacts with their URNs and group memberships. Unknown ids are left out.
pub fn load_contacts(
    conn: &mut PgConnection,
    org_id: Uuid,
    contact_ids: &[Uuid],
) -> CoreResult<Vec<Contact>> {
    if contact_ids.is_empty() {
        return Ok(Vec::new());
    }

    let rows: Vec<ContactRow> = contacts::table
        .filter(contacts::org_id.eq(org_id))
        .filter(contacts::id.eq_any(contact_ids))
        .load(conn)?;

    let urn_rows: Vec<ContactUrnRow> = contact_urns::table
        .filter(contact_urns::contact_id.eq_any(contact_ids))
        .order((contact_urns::priority.desc(), contact_urns::id.asc()))
        .load(conn)?;

    let memberships: Vec<(Uuid, Uuid)> = contact_group_members::table
        .filter(contact_group_members::contact_id.eq_any(contact_ids))
        .select((contact_group_members::contact_id, contact_group_members::group_id))
        .load(conn)?;

    let mut urns_by_contact: HashMap<Uuid, Vec<ContactUrn>> = HashMap::new();
    for row in urn_rows {
        if let Some(contact_id) = row.contact_id {
            urns_by_contact
                .entry(contact_id)
                .or_default()
                .push(ContactUrn::from(row));
        }
    }

    let mut groups_by_contact: HashMap<Uuid, Vec<Uuid>> = HashMap::new();
    for (contact_id, group_id) in memberships {
        groups_by_contact.entry(contact_id).or_default().push(group_id);
    }

    rows.into_iter()
        .map(|row| {
            let status = ContactStatus::from_code(&row.status).ok_or_else(|| {
                CoreError::validation(format!("contact {} has unknown status {}", row.id, row.status))
            })?;
            Ok(Contact {
                id: row.id,
                org_id: row.org_id,
                name: row.name,
                language: row.language,
                status,
                fields: field_map(row.fields),
                urns: urns_by_contact.remove(&row.id).unwrap_or_default(),
                groups: groups_by_contact.remove(&row.id).unwrap_or_default(),
                created_on: row.created_on,
            })
        })
        .collect()
}

/// Resolves each URN to its owning contact, creating a contact (and the URN) for any
/// URN nobody owns yet. Keys of the returned map are normalized identities.
pub fn get_or_create_contacts_by_urns(
    conn: &mut PgConnection,
    org_id: Uuid,
    urns: &[String],
) -> CoreResult<HashMap<String, Uuid>> {
    let parsed = urns
        .iter()
        .map(|raw| Urn::parse(raw))
        .collect::<CoreResult<Vec<_>>>()?;
    let identities: Vec<String> = parsed.iter().map(Urn::identity).collect();

    conn.transaction(|conn| {
        let existing: Vec<ContactUrnRow> = contact_urns::table
            .filter(contact_urns::org_id.eq(org_id))
            .filter(contact_urns::identity.eq_any(&identities))
            .for_update()
            .load(conn)?;

        let mut owners = HashMap::new();
        let mut orphaned = HashMap::new();
        for row in existing {
            match row.contact_id {
                Some(contact_id) => {
                    owners.insert(row.identity, contact_id);
                }
                None => {
                    orphaned.insert(row.identity, row.id);
                }
            }
        }

        for urn in &parsed {
            let identity = urn.identity();
            if owners.contains_key(&identity) {
                continue;
            }

            let contact = NewContact {
                id: Uuid::new_v4(),
                org_id,
                name: None,
                language: None,
                status: ContactStatus::Active.as_code().to_string(),
                fields: serde_json::json!({}),
            };
            diesel::insert_into(contacts::table)
                .values(&contact)
                .execute(conn)?;

            match orphaned.remove(&identity) {
                Some(urn_id) => {
                    diesel::update(contact_urns::table.find(urn_id))
                        .set(contact_urns::contact_id.eq(Some(contact.id)))
                        .execute(conn)?;
                }
                None => {
                    diesel::insert_into(contact_urns::table)
                        .values(&NewContactUrn {
                            id: Uuid::new_v4(),
                            org_id,
                            contact_id: Some(contact.id),
                            scheme: urn.scheme.clone(),
                            path: urn.path.clone(),
                            identity: identity.clone(),
                            priority: 1000,
                            channel_id: None,
                        })
                        .execute(conn)?;
                }
            }
            debug!(%org_id, contact_id = %contact.id, %identity, "created contact for URN");
            owners.insert(identity, contact.id);
        }

        Ok(owners)
    })
}

/// Ids of the given groups' current members.
pub fn group_member_ids(conn: &mut PgConnection, group_ids: &[Uuid]) -> QueryResult<Vec<Uuid>> {
    contact_group_members::table
        .filter(contact_group_members::group_id.eq_any(group_ids))
        .select(contact_group_members::contact_id)
        .distinct()
        .load(conn)
}

/// Adds and removes memberships. Returns the (contact, group) pairs that were actually
/// added and removed, so callers only schedule or delete fires for real changes.
pub fn change_groups(
    conn: &mut PgConnection,
    contact_ids: &[Uuid],
    add: &[Uuid],
    remove: &[Uuid],
) -> QueryResult<(Vec<GroupMembership>, Vec<GroupMembership>)> {
    conn.transaction(|conn| {
        let mut added = Vec::new();
        for group_id in add {
            let rows: Vec<GroupMembership> = contact_ids
                .iter()
                .map(|contact_id| GroupMembership {
                    contact_id: *contact_id,
                    group_id: *group_id,
                })
                .collect();
            let inserted: Vec<(Uuid, Uuid)> = diesel::insert_into(contact_group_members::table)
                .values(&rows)
                .on_conflict_do_nothing()
                .returning((contact_group_members::contact_id, contact_group_members::group_id))
                .get_results(conn)?;
            added.extend(
                inserted
                    .into_iter()
                    .map(|(contact_id, group_id)| GroupMembership { contact_id, group_id }),
            );
        }

        let removed: Vec<(Uuid, Uuid)> = if remove.is_empty() {
            Vec::new()
        } else {
            diesel::delete(
                contact_group_members::table
                    .filter(contact_group_members::contact_id.eq_any(contact_ids))
                    .filter(contact_group_members::group_id.eq_any(remove)),
            )
            .returning((contact_group_members::contact_id, contact_group_members::group_id))
            .get_results(conn)?
        };

        Ok((
            added,
            removed
                .into_iter()
                .map(|(contact_id, group_id)| GroupMembership { contact_id, group_id })
                .collect(),
        ))
    })
}

/// Archives contacts: drops them from every group, deletes their unfired campaign
/// fires, and archives triggers that only existed for them.
pub fn release_contacts(conn: &mut PgConnection, contact_ids: &[Uuid]) -> QueryResult<Vec<Uuid>> {
    conn.transaction(|conn| {
        diesel::update(contacts::table.filter(contacts::id.eq_any(contact_ids)))
            .set((
                contacts::status.eq(ContactStatus::Archived.as_code()),
                contacts::modified_on.eq(Utc::now()),
            ))
            .execute(conn)?;

        diesel::delete(
            contact_group_members::table
                .filter(contact_group_members::contact_id.eq_any(contact_ids)),
        )
        .execute(conn)?;

        diesel::delete(
            event_fires::table
                .filter(event_fires::contact_id.eq_any(contact_ids))
                .filter(event_fires::fired.is_null()),
        )
        .execute(conn)?;

        archive_contact_triggers(conn, contact_ids)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_urns() {
        let urn = Urn::parse("TEL:+1 (555) 123-4567").unwrap();
        assert_eq!(urn.identity(), "tel:+15551234567");

        let urn = Urn::parse("mailto:Ann@Example.com").unwrap();
        assert_eq!(urn.identity(), "mailto:ann@example.com");

        let urn = Urn::parse("telegram:12345").unwrap();
        assert_eq!(urn.identity(), "telegram:12345");
    }

    #[test]
    fn rejects_malformed_urns() {
        assert!(Urn::parse("nocolon").is_err());
        assert!(Urn::parse("tel:").is_err());
        assert!(Urn::parse(":12345").is_err());
        assert!(Urn::parse("tel:abc").is_err());
    }

    #[test]
    fn flattens_field_values_to_strings() {
        let fields = field_map(serde_json::json!({
            "joined": "2024-01-01T00:00:00Z",
            "age": 33,
            "gone": null
        }));
        assert_eq!(fields.get("joined").map(String::as_str), Some("2024-01-01T00:00:00Z"));
        assert_eq!(fields.get("age").map(String::as_str), Some("33"));
        assert!(!fields.contains_key("gone"));
    }

    #[test]
    fn field_keys_match_whatever_their_case() {
        let contact = Contact {
            id: Uuid::new_v4(),
            org_id: Uuid::new_v4(),
            name: Some("Ann".to_string()),
            language: None,
            status: ContactStatus::Active,
            fields: field_map(serde_json::json!({ "District": "Gasabo", "JOINED": "2024-01-01" })),
            urns: vec![],
            groups: vec![],
            created_on: Utc::now(),
        };
        assert_eq!(contact.field("district").as_deref(), Some("Gasabo"));
        assert_eq!(contact.field("DISTRICT").as_deref(), Some("Gasabo"));
        assert_eq!(contact.field("Joined").as_deref(), Some("2024-01-01"));
        assert_eq!(contact.field("Name").as_deref(), Some("Ann"));
        assert_eq!(contact.field("age"), None);
    }
}
