//! Cached entity handles.
//!
//! An [`Entity`] is the single canonical object a session holds for a given
//! `(type, id)` pair. Fields merge into it in place; holders of an
//! [`EntityRef`] always observe the freshest state the session has seen.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, RwLock, Weak};

use lazy_static::lazy_static;
use regex::Regex;
use tracing::warn;

use crate::core::{Fields, Result, SessionError, Value};
use crate::session::Session;

lazy_static! {
    static ref DEEP_FIELD_RE: Regex =
        Regex::new(r"^(\w+)\.([A-Z]\w*)\.(.+)$").expect("deep field pattern is valid");
}

/// Split a deep-dotted field key into `(field, declared type, rest)`.
pub(crate) fn split_deep_field(key: &str) -> Option<(&str, &str, &str)> {
    DEEP_FIELD_RE.captures(key).map(|caps| {
        let field = caps.get(1).map_or("", |m| m.as_str());
        let declared = caps.get(2).map_or("", |m| m.as_str());
        let rest = caps.get(3).map_or("", |m| m.as_str());
        (field, declared, rest)
    })
}

/// What the session knows about an entity's presence on the server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Existence {
    #[default]
    Unknown,
    Exists,
    Retired,
}

#[derive(Default)]
struct EntityState {
    fields: Fields,
    backrefs: BTreeMap<(String, String), Vec<Weak<Entity>>>,
    exists: Existence,
}

/// A single cached record. Identity is immutable; fields and bookkeeping
/// live behind a lock and only ever change via merging.
pub struct Entity {
    session: Weak<Session>,
    entity_type: Option<String>,
    id: Option<i64>,
    state: RwLock<EntityState>,
}

/// Shared handle to an [`Entity`]. Cloning the handle never clones the
/// record; see [`EntityRef::duplicate`].
#[derive(Clone)]
pub struct EntityRef(Arc<Entity>);

impl Entity {
    pub(crate) fn new_ref(
        session: Weak<Session>,
        entity_type: Option<String>,
        id: Option<i64>,
    ) -> EntityRef {
        EntityRef(Arc::new(Entity {
            session,
            entity_type,
            id,
            state: RwLock::new(EntityState::default()),
        }))
    }

    pub fn entity_type(&self) -> Option<String> {
        self.entity_type.clone()
    }

    pub fn id(&self) -> Option<i64> {
        self.id
    }

    /// The owning session, if it is still alive.
    pub fn session(&self) -> Result<Arc<Session>> {
        self.session
            .upgrade()
            .ok_or_else(|| SessionError::Ownership(self.to_string()))
    }

    pub(crate) fn session_weak(&self) -> &Weak<Session> {
        &self.session
    }

    pub fn exists(&self) -> Existence {
        self.state.read().map(|s| s.exists).unwrap_or_default()
    }

    pub(crate) fn set_exists(&self, exists: Existence) -> Result<()> {
        self.state.write()?.exists = exists;
        Ok(())
    }

    /// Direct (flat) field read; `type` and `id` come from the identity.
    pub(crate) fn field(&self, key: &str) -> Option<Value> {
        match key {
            "type" => self.entity_type.clone().map(Value::Text),
            "id" => self.id.map(Value::Integer),
            _ => self
                .state
                .read()
                .ok()
                .and_then(|s| s.fields.get(key).cloned()),
        }
    }

    pub(crate) fn insert_field(&self, key: String, value: Value) -> Result<()> {
        self.state.write()?.fields.insert(key, value);
        Ok(())
    }

    /// A point-in-time copy of the fields, without `type`/`id`.
    pub fn fields_snapshot(&self) -> Fields {
        self.state
            .read()
            .map(|s| s.fields.clone())
            .unwrap_or_default()
    }

    /// The fields plus the identity pair, as a plain map. This is what
    /// entity-vs-map equality compares against.
    pub fn structural_map(&self) -> Fields {
        let mut map = self.fields_snapshot();
        if let Some(t) = &self.entity_type {
            map.insert("type".into(), Value::Text(t.clone()));
        }
        if let Some(id) = self.id {
            map.insert("id".into(), Value::Integer(id));
        }
        map
    }

    /// The `{type, id}` form used on the wire. Requires a complete identity.
    pub fn minimal(&self) -> Result<Fields> {
        let (t, id) = self.hash_key()?;
        let mut map = Fields::new();
        map.insert("type".into(), Value::Text(t));
        map.insert("id".into(), Value::Integer(id));
        Ok(map)
    }

    /// The `(type, id)` pair, for use as a set or map key. Entities with an
    /// incomplete identity have no stable key and refuse to provide one.
    pub fn hash_key(&self) -> Result<(String, i64)> {
        match (&self.entity_type, self.id) {
            (Some(t), Some(id)) => Ok((t.clone(), id)),
            _ => Err(SessionError::Identity(format!(
                "{} has an incomplete identity",
                self
            ))),
        }
    }

    /// Read a field, navigating deep-dotted keys like `entity.Shot.code`.
    ///
    /// A link is only followed when the cached value's type matches the one
    /// declared in the key; a different type reads as absent. Navigating
    /// into a concrete non-record value is a type mismatch.
    pub fn get(&self, key: &str) -> Result<Option<Value>> {
        if let Some(v) = self.field(key) {
            return Ok(Some(v));
        }
        let Some((field, declared, rest)) = split_deep_field(key) else {
            return Ok(None);
        };
        let Some(value) = self.field(field) else {
            return Ok(None);
        };
        lookup_step(value, declared, rest)
    }

    pub fn get_many(&self, keys: &[&str]) -> Result<Vec<Option<Value>>> {
        keys.iter().map(|k| self.get(k)).collect()
    }

    /// Record that `source.source_field` points at this entity.
    pub(crate) fn add_backref(
        &self,
        source_type: &str,
        source_field: &str,
        source: &EntityRef,
    ) -> Result<()> {
        let mut state = self.state.write()?;
        let slot = state
            .backrefs
            .entry((source_type.to_string(), source_field.to_string()))
            .or_default();
        slot.retain(|w| w.strong_count() > 0);
        if !slot.iter().any(|w| {
            w.upgrade()
                .is_some_and(|e| Arc::ptr_eq(&e, &source.0))
        }) {
            slot.push(Arc::downgrade(&source.0));
        }
        Ok(())
    }

    /// Every live entity known to point at this one through
    /// `source_type.source_field`.
    pub fn backrefs_for(&self, source_type: &str, source_field: &str) -> Vec<EntityRef> {
        self.state
            .read()
            .map(|s| {
                s.backrefs
                    .get(&(source_type.to_string(), source_field.to_string()))
                    .map(|slot| {
                        slot.iter()
                            .filter_map(Weak::upgrade)
                            .map(EntityRef)
                            .collect()
                    })
                    .unwrap_or_default()
            })
            .unwrap_or_default()
    }

    /// Dump the entity and everything it links to as JSON. Entities seen
    /// more than once (including through cycles) collapse to their minimal
    /// form on repeat visits.
    pub fn export(&self) -> serde_json::Value {
        let mut visited = HashSet::new();
        export_entity(self, &mut visited)
    }
}

fn lookup_step(value: Value, declared: &str, rest: &str) -> Result<Option<Value>> {
    match value {
        Value::Null => Ok(None),
        Value::Entity(entity) => {
            if entity.entity_type().as_deref() == Some(declared) {
                entity.get(rest)
            } else {
                Ok(None)
            }
        }
        Value::Map(map) => {
            if map.get("type").and_then(Value::as_str) == Some(declared) {
                lookup_in_map(&map, rest)
            } else {
                Ok(None)
            }
        }
        other => Err(SessionError::TypeMismatch(format!(
            "cannot traverse {} value as a {} link",
            other.type_name(),
            declared
        ))),
    }
}

fn lookup_in_map(map: &Fields, key: &str) -> Result<Option<Value>> {
    if let Some(v) = map.get(key) {
        return Ok(Some(v.clone()));
    }
    let Some((field, declared, rest)) = split_deep_field(key) else {
        return Ok(None);
    };
    let Some(value) = map.get(field) else {
        return Ok(None);
    };
    lookup_step(value.clone(), declared, rest)
}

fn export_entity(entity: &Entity, visited: &mut HashSet<usize>) -> serde_json::Value {
    let ptr = entity as *const Entity as usize;
    if !visited.insert(ptr) {
        let mut out = serde_json::Map::new();
        if let Some(t) = entity.entity_type() {
            out.insert("type".into(), serde_json::Value::String(t));
        }
        if let Some(id) = entity.id() {
            out.insert("id".into(), serde_json::Value::from(id));
        }
        return serde_json::Value::Object(out);
    }
    let mut out = serde_json::Map::new();
    if let Some(t) = entity.entity_type() {
        out.insert("type".into(), serde_json::Value::String(t));
    }
    if let Some(id) = entity.id() {
        out.insert("id".into(), serde_json::Value::from(id));
    }
    for (key, value) in entity.fields_snapshot() {
        out.insert(key, export_value(&value, visited));
    }
    serde_json::Value::Object(out)
}

fn export_value(value: &Value, visited: &mut HashSet<usize>) -> serde_json::Value {
    match value {
        Value::Entity(entity) => export_entity(entity, visited),
        Value::List(items) => {
            serde_json::Value::Array(items.iter().map(|v| export_value(v, visited)).collect())
        }
        Value::Map(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), export_value(v, visited)))
                .collect(),
        ),
        other => other.to_json(),
    }
}

impl EntityRef {
    /// Pointer identity: do both handles name the same cached record?
    pub fn ptr_eq(&self, other: &EntityRef) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(crate) fn as_ptr(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    /// Copying a cached record would fork its identity, so this always
    /// fails. Clone the handle instead, or [`Entity::export`] the data.
    pub fn duplicate(&self) -> Result<EntityRef> {
        warn!(entity = %self.0, "refusing to duplicate a cached entity");
        Err(SessionError::Identity(format!(
            "cannot duplicate {}; entities are canonical per session",
            self.0
        )))
    }

    /// Set one field, with the same deep-key handling and backref
    /// registration as a merge.
    pub fn set(&self, key: &str, value: Value) -> Result<()> {
        self.session()?.set_field(self, key, value)
    }

    /// Set a field only if it reads as absent; returns the resulting value.
    pub fn set_default(&self, key: &str, value: Value) -> Result<Value> {
        if let Some(existing) = self.get(key)? {
            return Ok(existing);
        }
        self.set(key, value.clone())?;
        Ok(value)
    }

    /// Fetch the given fields for this entity; see [`Session::fetch`].
    pub fn fetch(&self, fields: &[&str], force: bool) -> Result<()> {
        self.session()?.fetch(std::slice::from_ref(self), fields, force)
    }

    /// Fetch the important fields and links for this entity's type.
    pub fn fetch_core(&self) -> Result<()> {
        self.session()?.fetch_core(std::slice::from_ref(self))
    }

    /// Resolve the ancestor chain up to the hierarchy root.
    pub fn fetch_hierarchy(&self) -> Result<Vec<EntityRef>> {
        self.session()?.fetch_hierarchy(std::slice::from_ref(self))
    }

    /// Whether this entity exists on the server. Unknown entities are
    /// verified with a find when `check` is set, all of them when `force`
    /// is too; see [`Session::filter_exists`].
    pub fn exists_on_server(&self, check: bool, force: bool) -> Result<bool> {
        let kept = self
            .session()?
            .filter_exists(std::slice::from_ref(self), check, force)?;
        Ok(kept.iter().any(|e| e.ptr_eq(self)))
    }

    /// Pull every `source_type` record whose `source_field` points here.
    pub fn fetch_backrefs(&self, source_type: &str, source_field: &str) -> Result<()> {
        self.session()?
            .fetch_backrefs(std::slice::from_ref(self), source_type, source_field)
    }

    /// The parent entity per the hierarchy policy, if cached (or fetched).
    pub fn parent(&self, fetch: bool) -> Result<Option<EntityRef>> {
        let session = self.session()?;
        let entity_type = self
            .entity_type()
            .ok_or_else(|| SessionError::Identity(format!("{} has no type", self.0)))?;
        let Some(field) = session.policy().parent_field(&entity_type)? else {
            return Ok(None);
        };
        let field = field.to_string();
        if let Some(Value::Entity(parent)) = self.get(&field)? {
            return Ok(Some(parent));
        }
        if fetch {
            session.fetch(std::slice::from_ref(self), &[field.as_str()], false)?;
            if let Some(Value::Entity(parent)) = self.get(&field)? {
                return Ok(Some(parent));
            }
        }
        Ok(None)
    }

    /// The hierarchy root this entity belongs to, walking cached parent
    /// links and falling back to a hierarchy fetch when allowed.
    pub fn project(&self, fetch: bool) -> Result<Option<EntityRef>> {
        let session = self.session()?;
        let root_link = session.policy().root_link_field.clone();

        let mut current = self.clone();
        let mut seen: Vec<usize> = Vec::new();
        loop {
            if let Some(t) = current.entity_type() {
                if matches!(session.policy().parent_field(&t), Ok(None)) {
                    return Ok(Some(current));
                }
            }
            if let Some(Value::Entity(root)) = current.get(&root_link)? {
                return Ok(Some(root));
            }
            seen.push(current.as_ptr());
            match current.parent(false) {
                Ok(Some(next)) if !seen.contains(&next.as_ptr()) => current = next,
                Ok(_) | Err(SessionError::UnknownType(_)) => break,
                Err(err) => return Err(err),
            }
        }

        if fetch {
            session.fetch_hierarchy(std::slice::from_ref(self))?;
            self.project(false)
        } else {
            Ok(None)
        }
    }
}

impl Deref for EntityRef {
    type Target = Entity;

    fn deref(&self) -> &Entity {
        &self.0
    }
}

impl PartialEq for EntityRef {
    fn eq(&self, other: &Self) -> bool {
        if self.ptr_eq(other) {
            return true;
        }
        self.structural_map() == other.structural_map()
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = self.entity_type.as_deref().unwrap_or("?");
        match self.id {
            Some(id) => write!(f, "{}:{}", t, id),
            None => write!(f, "{}:?", t),
        }
    }
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<Entity {}>", self)
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}
