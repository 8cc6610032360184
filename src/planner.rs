//! Request-side field planning.
//!
//! Remote finds only return the fields you ask for, so the session widens
//! every request with the fields it will predictably need later: identity,
//! timestamps, hierarchy links and a one-level expansion of important
//! links. Planning is deterministic; the same request always yields the
//! same sorted field list.

use std::collections::{BTreeMap, BTreeSet};

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::{Result, SessionError};

/// Declarative knowledge about the entity schema: hierarchy links, fields
/// worth always fetching, and merge/retirement knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldPolicy {
    /// Parent link per type; `None` marks the hierarchy root type.
    pub parent_fields: BTreeMap<String, Option<String>>,
    /// Fields added to every planned request regardless of type.
    pub required_fields: Vec<String>,
    /// Extra per-type fields worth always fetching.
    pub important_fields: BTreeMap<String, Vec<String>>,
    /// Link fields worth expanding one level deep, with their target types.
    pub important_links: BTreeMap<String, BTreeMap<String, Vec<String>>>,
    /// Field compared by the if-newer overwrite policy.
    pub timestamp_field: String,
    /// Link field pointing at the hierarchy root from anywhere.
    pub root_link_field: String,
    /// Types never stripped down to minimal form in outgoing payloads.
    pub opaque_types: Vec<String>,
}

lazy_static! {
    static ref DEFAULT_POLICY: FieldPolicy = {
        let mut parent_fields = BTreeMap::new();
        for (t, parent) in [
            ("Asset", Some("project")),
            ("Project", None),
            ("PublishEvent", Some("sg_link")),
            ("Sequence", Some("project")),
            ("Shot", Some("sg_sequence")),
            ("Task", Some("entity")),
            ("Version", Some("entity")),
        ] {
            parent_fields.insert(t.to_string(), parent.map(str::to_string));
        }

        let mut important_fields = BTreeMap::new();
        for (t, fields) in [
            ("Asset", &["code", "sg_asset_type"][..]),
            ("HumanUser", &["email", "firstname", "lastname", "login"]),
            ("Project", &["name"]),
            ("PublishEvent", &["code", "sg_type", "sg_version"]),
            ("Sequence", &["code"]),
            ("Shot", &["code"]),
            ("Step", &["code", "short_name", "entity_type"]),
            ("Task", &["step", "content"]),
            ("Version", &["code", "sg_task"]),
        ] {
            important_fields.insert(
                t.to_string(),
                fields.iter().map(|s| s.to_string()).collect(),
            );
        }

        let mut important_links: BTreeMap<String, BTreeMap<String, Vec<String>>> =
            BTreeMap::new();
        for (t, field, targets) in [
            ("Asset", "project", &["Project"][..]),
            ("Sequence", "project", &["Project"]),
            ("Shot", "sg_sequence", &["Sequence"]),
            ("Task", "entity", &["Asset", "Shot"]),
            ("Task", "project", &["Project"]),
            ("Task", "step", &["Step"]),
            ("PublishEvent", "sg_link", &["Task"]),
        ] {
            important_links
                .entry(t.to_string())
                .or_default()
                .insert(
                    field.to_string(),
                    targets.iter().map(|s| s.to_string()).collect(),
                );
        }

        FieldPolicy {
            parent_fields,
            required_fields: vec!["updated_at".to_string()],
            important_fields,
            important_links,
            timestamp_field: "updated_at".to_string(),
            root_link_field: "project".to_string(),
            opaque_types: vec!["Attachment".to_string()],
        }
    };
    static ref BRACES_RE: Regex = Regex::new(r"\{(.+?)\}").expect("brace pattern is valid");
}

impl Default for FieldPolicy {
    fn default() -> Self {
        DEFAULT_POLICY.clone()
    }
}

impl FieldPolicy {
    /// The declared parent link for a type; `Ok(None)` marks the hierarchy
    /// root, an undeclared type is an error.
    pub fn parent_field(&self, entity_type: &str) -> Result<Option<&str>> {
        self.parent_fields
            .get(entity_type)
            .map(|p| p.as_deref())
            .ok_or_else(|| SessionError::UnknownType(entity_type.to_string()))
    }

    pub fn is_opaque(&self, entity_type: &str) -> bool {
        self.opaque_types.iter().any(|t| t == entity_type)
    }

    /// Widen a requested field list into the full planned list.
    ///
    /// The result is the sorted union of the requested fields (`id` when
    /// none), the required fields, the type's important fields, its parent
    /// link, the implied `.id` of every deep-dotted ancestor, and a
    /// one-level expansion of the type's important links.
    pub fn default_fields(&self, entity_type: &str, requested: &[&str]) -> Vec<String> {
        let mut fields: BTreeSet<String> = if requested.is_empty() {
            std::iter::once("id".to_string()).collect()
        } else {
            requested.iter().map(|s| s.to_string()).collect()
        };
        fields.extend(self.required_fields.iter().cloned());
        if let Some(extra) = self.important_fields.get(entity_type) {
            fields.extend(extra.iter().cloned());
        }
        if let Some(Some(parent)) = self.parent_fields.get(entity_type) {
            fields.insert(parent.clone());
        }

        let implied: Vec<String> = fields
            .iter()
            .flat_map(|field| {
                let parts: Vec<&str> = field.split('.').collect();
                (2..=parts.len())
                    .step_by(2)
                    .map(|i| format!("{}.id", parts[..i].join(".")))
                    .collect::<Vec<_>>()
            })
            .collect();
        fields.extend(implied);

        if let Some(links) = self.important_links.get(entity_type) {
            for (local_field, link_types) in links {
                for link_type in link_types {
                    let link_field = format!("{}.{}", local_field, link_type);
                    fields.insert(format!("{}.id", link_field));
                    let deep_fields = self
                        .required_fields
                        .iter()
                        .chain(self.important_fields.get(link_type).into_iter().flatten());
                    for deep in deep_fields {
                        fields.insert(format!("{}.{}", link_field, deep));
                    }
                    let deep_links = self
                        .important_links
                        .get(link_type)
                        .into_iter()
                        .flatten()
                        .map(|(k, _)| k);
                    for deep_link in deep_links {
                        fields.insert(format!("{}.{}", link_field, deep_link));
                    }
                }
            }
        }

        fields.into_iter().collect()
    }

    /// The fields a core fetch pulls for a type: required fields, its
    /// important fields, and its important link fields.
    pub fn core_fields(&self, entity_type: &str) -> Vec<String> {
        let mut fields: BTreeSet<String> = self.required_fields.iter().cloned().collect();
        fields.extend(
            self.important_fields
                .get(entity_type)
                .into_iter()
                .flatten()
                .cloned(),
        );
        fields.extend(
            self.important_links
                .get(entity_type)
                .into_iter()
                .flatten()
                .map(|(k, _)| k.clone()),
        );
        fields.into_iter().collect()
    }
}

/// Expand shell-style brace groups into their cartesian product, e.g.
/// `"sg_{link,task}.Task.{id,code}"` into four concrete keys. Earlier
/// groups vary slowest; a pattern without braces returns itself.
pub fn expand_braces(pattern: &str) -> Vec<String> {
    let mut segments: Vec<Vec<&str>> = Vec::new();
    let mut last = 0;
    for caps in BRACES_RE.captures_iter(pattern) {
        let whole = caps.get(0).expect("group 0 always matches");
        segments.push(vec![&pattern[last..whole.start()]]);
        segments.push(caps.get(1).map_or("", |m| m.as_str()).split(',').collect());
        last = whole.end();
    }
    segments.push(vec![&pattern[last..]]);

    let mut out = vec![String::new()];
    for segment in segments {
        let mut next = Vec::with_capacity(out.len() * segment.len());
        for prefix in &out {
            for option in &segment {
                next.push(format!("{}{}", prefix, option));
            }
        }
        out = next;
    }
    out
}
