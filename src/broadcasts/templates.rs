//! Minimal `@root.key` substitution for broadcast text, plus the rewrite that turns
//! legacy `@contact.<field>` references into the current form.

use std::collections::HashMap;

use crate::contacts::Contact;

const ROOTS: [&str; 4] = ["contact", "fields", "globals", "urns"];
const CONTACT_ATTRIBUTES: [&str; 6] = ["name", "first_name", "language", "id", "uuid", "created_on"];
const URN_SCHEMES: [&str; 9] = [
    "tel", "mailto", "twitter", "telegram", "whatsapp", "facebook", "viber", "line", "ext",
];

pub struct TemplateContext<'a> {
    pub contact: &'a Contact,
    pub globals: &'a HashMap<String, String>,
}

impl TemplateContext<'_> {
    fn resolve(&self, root: &str, key: Option<&str>) -> String {
        let contact = self.contact;
        match (root, key) {
            ("contact", None) | ("contact", Some("name")) => contact.name.clone().unwrap_or_default(),
            ("contact", Some("first_name")) => contact
                .name
                .as_deref()
                .and_then(|name| name.split_whitespace().next())
                .unwrap_or_default()
                .to_string(),
            ("contact", Some("language")) => contact.language.clone().unwrap_or_default(),
            ("contact", Some("id")) | ("contact", Some("uuid")) => contact.id.to_string(),
            ("contact", Some("created_on")) => contact.created_on.to_rfc3339(),
            ("fields", Some(key)) => contact.fields.get(key).cloned().unwrap_or_default(),
            ("globals", Some(key)) => self.globals.get(key).cloned().unwrap_or_default(),
            ("urns", Some(scheme)) => contact
                .urns
                .iter()
                .find(|urn| urn.scheme == scheme)
                .map(|urn| urn.path.clone())
                .unwrap_or_default(),
            _ => String::new(),
        }
    }
}

/// One `@root` or `@root.key` reference found in a template.
struct Reference<'t> {
    root: &'t str,
    key: Option<&'t str>,
    len: usize,
}

fn is_ident(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_'
}

fn ident_len(text: &str) -> usize {
    text.find(|ch: char| !is_ident(ch)).unwrap_or(text.len())
}

/// Parses the reference starting right after an `@`, if it names a known root.
fn parse_reference(rest: &str) -> Option<Reference<'_>> {
    let root_len = ident_len(rest);
    let root = &rest[..root_len];
    if !ROOTS.contains(&root.to_ascii_lowercase().as_str()) {
        return None;
    }

    let after_root = &rest[root_len..];
    if let Some(tail) = after_root.strip_prefix('.') {
        let key_len = ident_len(tail);
        if key_len > 0 {
            return Some(Reference {
                root,
                key: Some(&tail[..key_len]),
                len: root_len + 1 + key_len,
            });
        }
    }
    Some(Reference {
        root,
        key: None,
        len: root_len,
    })
}

/// Walks `template`, handing each reference to `on_ref` and copying everything else.
/// `@@` is an escaped `@`.
fn substitute(template: &str, mut on_ref: impl FnMut(&Reference<'_>, &mut String), keep_escapes: bool) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(at) = rest.find('@') {
        out.push_str(&rest[..at]);
        let after = &rest[at + 1..];

        if let Some(tail) = after.strip_prefix('@') {
            out.push_str(if keep_escapes { "@@" } else { "@" });
            rest = tail;
            continue;
        }

        match parse_reference(after) {
            Some(reference) => {
                on_ref(&reference, &mut out);
                rest = &after[reference.len..];
            }
            None => {
                out.push('@');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

pub fn evaluate(template: &str, context: &TemplateContext<'_>) -> String {
    substitute(
        template,
        |reference, out| {
            let root = reference.root.to_ascii_lowercase();
            let key = reference.key.map(str::to_lowercase);
            out.push_str(&context.resolve(&root, key.as_deref()));
        },
        false,
    )
}

/// Rewrites legacy references: `@contact.<urn scheme>` becomes `@urns.<scheme>` and
/// `@contact.<anything not built in>` becomes `@fields.<key>`.
pub fn migrate_legacy(template: &str) -> String {
    substitute(
        template,
        |reference, out| {
            let root = reference.root.to_ascii_lowercase();
            match reference.key.map(str::to_ascii_lowercase) {
                Some(key) if root == "contact" && URN_SCHEMES.contains(&key.as_str()) => {
                    out.push_str(&format!("@urns.{key}"));
                }
                Some(key) if root == "contact" && !CONTACT_ATTRIBUTES.contains(&key.as_str()) => {
                    out.push_str(&format!("@fields.{key}"));
                }
                Some(key) => out.push_str(&format!("@{root}.{key}")),
                None => out.push_str(&format!("@{root}")),
            }
        },
        true,
    )
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::contacts::{ContactStatus, ContactUrn};

    fn ann() -> Contact {
        Contact {
            id: Uuid::new_v4(),
            org_id: Uuid::new_v4(),
            name: Some("Ann Smith".to_string()),
            language: Some("eng".to_string()),
            status: ContactStatus::Active,
            fields: [("district".to_string(), "Gasabo".to_string())].into_iter().collect(),
            urns: vec![ContactUrn {
                id: Uuid::new_v4(),
                scheme: "tel".to_string(),
                path: "+250788123123".to_string(),
                identity: "tel:+250788123123".to_string(),
                priority: 1000,
                channel_id: None,
            }],
            groups: vec![],
            created_on: Utc::now(),
        }
    }

    #[test]
    fn evaluates_known_roots() {
        let contact = ann();
        let globals = [("org_name".to_string(), "Nyaruka".to_string())].into_iter().collect();
        let context = TemplateContext {
            contact: &contact,
            globals: &globals,
        };

        assert_eq!(
            evaluate("Hi @contact.first_name from @fields.district!", &context),
            "Hi Ann from Gasabo!"
        );
        assert_eq!(evaluate("@globals.org_name calling @urns.tel", &context), "Nyaruka calling +250788123123");
        assert_eq!(evaluate("Missing: [@fields.age]", &context), "Missing: []");
    }

    #[test]
    fn field_references_ignore_case_on_both_sides() {
        let mut contact = ann();
        contact.fields = crate::contacts::field_map(serde_json::json!({ "District": "Gasabo" }));
        let globals = HashMap::new();
        let context = TemplateContext {
            contact: &contact,
            globals: &globals,
        };

        assert_eq!(evaluate("@fields.district", &context), "Gasabo");
        assert_eq!(evaluate("@fields.District", &context), "Gasabo");
        assert_eq!(evaluate("@FIELDS.DISTRICT", &context), "Gasabo");
    }

    #[test]
    fn leaves_unknown_roots_and_escapes() {
        let contact = ann();
        let globals = HashMap::new();
        let context = TemplateContext {
            contact: &contact,
            globals: &globals,
        };

        assert_eq!(evaluate("mail ann@example.com", &context), "mail ann@example.com");
        assert_eq!(evaluate("tweet @@contact.name", &context), "tweet @contact.name");
        assert_eq!(evaluate("Bye @contact.", &context), "Bye Ann Smith.");
    }

    #[test]
    fn migrates_legacy_contact_references() {
        assert_eq!(
            migrate_legacy("Hi @contact.name, your @contact.district number is @contact.tel"),
            "Hi @contact.name, your @fields.district number is @urns.tel"
        );
        assert_eq!(migrate_legacy("keep @@contact.age"), "keep @@contact.age");
    }
}
