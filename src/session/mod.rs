//! The session: an identity-preserving cache in front of a gateway.
//!
//! A session guarantees one canonical [`EntityRef`] per `(type, id)` pair.
//! Every record coming back from the gateway merges into that one object,
//! so all holders of a handle see updates immediately and links between
//! cached entities stay consistent.

pub mod hierarchy;
pub mod merge;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

use lazy_static::lazy_static;
use regex::Regex;
use tracing::{debug, info};

use crate::core::{Fields, Result, SessionError, Value};
use crate::entity::{Entity, EntityRef, Existence};
use crate::executor::{Executor, Task};
use crate::gateway::{
    BatchRequest, BatchResponse, Filter, FindOptions, PathRemap, RequestGateway, SchemaResolver,
};
use crate::planner::{expand_braces, FieldPolicy};

pub use merge::OverridePolicy;

lazy_static! {
    static ref ENTITY_SPEC_RE: Regex = Regex::new(r"^([A-Za-z]\w*)[:_-](\d+)(?:\?(.*))?$")
        .expect("entity spec pattern is valid");
}

/// The merged result of one batch operation.
#[derive(Debug, Clone)]
pub enum BatchOutcome {
    Entity(EntityRef),
    Ack(bool),
}

pub struct Session {
    pub(crate) self_ref: Weak<Session>,
    gateway: Arc<dyn RequestGateway>,
    schema: Option<Arc<dyn SchemaResolver>>,
    pub(crate) path_remap: Option<Arc<dyn PathRemap>>,
    pub(crate) policy: FieldPolicy,
    cache: Mutex<HashMap<(String, i64), EntityRef>>,
    guessed_user: Mutex<Option<Option<EntityRef>>>,
    executor: Mutex<Option<Arc<Executor>>>,
}

pub struct SessionBuilder {
    gateway: Arc<dyn RequestGateway>,
    schema: Option<Arc<dyn SchemaResolver>>,
    path_remap: Option<Arc<dyn PathRemap>>,
    policy: FieldPolicy,
}

impl SessionBuilder {
    pub fn new(gateway: Arc<dyn RequestGateway>) -> SessionBuilder {
        SessionBuilder {
            gateway,
            schema: None,
            path_remap: None,
            policy: FieldPolicy::default(),
        }
    }

    pub fn schema(mut self, schema: Arc<dyn SchemaResolver>) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn path_remap(mut self, remap: Arc<dyn PathRemap>) -> Self {
        self.path_remap = Some(remap);
        self
    }

    pub fn policy(mut self, policy: FieldPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn build(self) -> Arc<Session> {
        Arc::new_cyclic(|weak| Session {
            self_ref: weak.clone(),
            gateway: self.gateway,
            schema: self.schema,
            path_remap: self.path_remap,
            policy: self.policy,
            cache: Mutex::new(HashMap::new()),
            guessed_user: Mutex::new(None),
            executor: Mutex::new(None),
        })
    }
}

impl Session {
    pub fn new(gateway: Arc<dyn RequestGateway>) -> Arc<Session> {
        SessionBuilder::new(gateway).build()
    }

    pub fn builder(gateway: Arc<dyn RequestGateway>) -> SessionBuilder {
        SessionBuilder::new(gateway)
    }

    pub fn policy(&self) -> &FieldPolicy {
        &self.policy
    }

    // ---- identity map ----------------------------------------------------

    /// The canonical entity for `(type, id)`, created empty when unseen.
    pub fn get_or_create(&self, entity_type: &str, id: i64) -> Result<EntityRef> {
        let mut cache = self.cache.lock()?;
        let key = (entity_type.to_string(), id);
        if let Some(entity) = cache.get(&key) {
            return Ok(entity.clone());
        }
        let entity = Entity::new_ref(
            self.self_ref.clone(),
            Some(entity_type.to_string()),
            Some(id),
        );
        cache.insert(key, entity.clone());
        Ok(entity)
    }

    /// The canonical entity for `(type, id)` if the session has seen it.
    pub fn get_cached(&self, entity_type: &str, id: i64) -> Option<EntityRef> {
        self.cache
            .lock()
            .ok()
            .and_then(|c| c.get(&(entity_type.to_string(), id)).cloned())
    }

    /// An entity outside the identity map, for carrying partial records.
    pub fn detached(&self, entity_type: Option<&str>, id: Option<i64>) -> EntityRef {
        Entity::new_ref(self.self_ref.clone(), entity_type.map(str::to_string), id)
    }

    pub fn cache_size(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Whether this session created the entity.
    pub fn owns(&self, entity: &EntityRef) -> bool {
        Weak::ptr_eq(entity.session_weak(), &self.self_ref)
    }

    pub fn assert_ownership(&self, entity: &EntityRef) -> Result<()> {
        if self.owns(entity) {
            Ok(())
        } else {
            Err(SessionError::Ownership(entity.to_string()))
        }
    }

    // ---- request-side schema and payload shaping -------------------------

    fn resolve_type(&self, entity_type: &str) -> String {
        self.schema
            .as_ref()
            .map(|s| s.resolve_type(entity_type))
            .unwrap_or_else(|| entity_type.to_string())
    }

    fn resolve_field(&self, entity_type: &str, field: &str) -> String {
        self.schema
            .as_ref()
            .map(|s| s.resolve_field(entity_type, field))
            .unwrap_or_else(|| field.to_string())
    }

    /// Strip every non-opaque entity-shaped value down to `{type, id}`,
    /// recursively. Outgoing payloads never carry full records.
    pub fn minimized(&self, value: &Value) -> Result<Value> {
        match value {
            Value::Entity(entity) => {
                let opaque = entity
                    .entity_type()
                    .is_some_and(|t| self.policy.is_opaque(&t));
                if opaque {
                    Ok(Value::from(entity.structural_map()))
                } else {
                    Ok(Value::from(entity.minimal()?))
                }
            }
            Value::Map(map) => {
                let entity_type = map.get("type").and_then(Value::as_str);
                let id = map.get("id");
                if let (Some(t), Some(id)) = (entity_type, id) {
                    if !self.policy.is_opaque(t) {
                        let mut minimal = Fields::new();
                        minimal.insert("type".to_string(), Value::Text(t.to_string()));
                        minimal.insert("id".to_string(), id.clone());
                        return Ok(Value::from(minimal));
                    }
                }
                let mut out = Fields::new();
                for (k, v) in map.iter() {
                    out.insert(k.clone(), self.minimized(v)?);
                }
                Ok(Value::from(out))
            }
            Value::List(items) => {
                let minimized = items
                    .iter()
                    .map(|v| self.minimized(v))
                    .collect::<Result<Vec<Value>>>()?;
                Ok(Value::List(Arc::new(minimized)))
            }
            other => Ok(other.clone()),
        }
    }

    fn prepare_payload(&self, entity_type: &str, fields: &Fields) -> Result<Fields> {
        let mut out = Fields::new();
        for (key, value) in fields {
            out.insert(
                self.resolve_field(entity_type, key),
                self.minimized(value)?,
            );
        }
        Ok(out)
    }

    fn prepare_filters(&self, entity_type: &str, filters: &[Filter]) -> Result<Vec<Filter>> {
        filters
            .iter()
            .map(|filter| {
                Ok(match filter {
                    Filter::Is(field, value) => Filter::Is(
                        self.resolve_field(entity_type, field),
                        self.minimized(value)?,
                    ),
                    Filter::In(field, values) => Filter::In(
                        self.resolve_field(entity_type, field),
                        values
                            .iter()
                            .map(|v| self.minimized(v))
                            .collect::<Result<Vec<Value>>>()?,
                    ),
                    Filter::StartsWith(field, prefix) => Filter::StartsWith(
                        self.resolve_field(entity_type, field),
                        prefix.clone(),
                    ),
                })
            })
            .collect()
    }

    // ---- reads -----------------------------------------------------------

    pub fn find(
        &self,
        entity_type: &str,
        filters: &[Filter],
        fields: &[&str],
    ) -> Result<Vec<EntityRef>> {
        self.find_with(entity_type, filters, fields, &FindOptions::default())
    }

    pub fn find_with(
        &self,
        entity_type: &str,
        filters: &[Filter],
        fields: &[&str],
        options: &FindOptions,
    ) -> Result<Vec<EntityRef>> {
        let resolved_type = self.resolve_type(entity_type);
        let requested: Vec<String> = fields.iter().flat_map(|f| expand_braces(f)).collect();
        let planned: Vec<String> = if options.plan_fields {
            let refs: Vec<&str> = requested.iter().map(String::as_str).collect();
            self.policy.default_fields(entity_type, &refs)
        } else if requested.is_empty() {
            vec!["id".to_string()]
        } else {
            requested
        };
        let planned: Vec<String> = planned
            .iter()
            .map(|f| self.resolve_field(entity_type, f))
            .collect();
        let filters = self.prepare_filters(entity_type, filters)?;

        debug!(entity_type, fields = planned.len(), "find");
        let records = self
            .gateway
            .find(&resolved_type, &filters, &planned, options)?;
        records
            .into_iter()
            .map(|r| self.merge_record(r, OverridePolicy::Always))
            .collect()
    }

    pub fn find_one(
        &self,
        entity_type: &str,
        filters: &[Filter],
        fields: &[&str],
    ) -> Result<Option<EntityRef>> {
        let options = FindOptions {
            limit: Some(1),
            ..FindOptions::default()
        };
        Ok(self
            .find_with(entity_type, filters, fields, &options)?
            .into_iter()
            .next())
    }

    /// The cached entity for `(type, id)`, or one find when unseen.
    /// Requesting fields on a cached entity pulls any it is missing.
    pub fn get(&self, entity_type: &str, id: i64, fields: &[&str]) -> Result<Option<EntityRef>> {
        if let Some(entity) = self.get_cached(entity_type, id) {
            if !fields.is_empty() {
                self.fetch(std::slice::from_ref(&entity), fields, false)?;
            }
            return Ok(Some(entity));
        }
        self.find_one(entity_type, &[Filter::is("id", id)], fields)
    }

    // ---- writes ----------------------------------------------------------

    pub fn create(
        &self,
        entity_type: &str,
        fields: Fields,
        return_fields: &[&str],
    ) -> Result<EntityRef> {
        let payload = self.prepare_payload(entity_type, &fields)?;
        let return_fields: Vec<String> = if return_fields.is_empty() {
            vec!["id".to_string()]
        } else {
            return_fields
                .iter()
                .flat_map(|f| expand_braces(f))
                .map(|f| self.resolve_field(entity_type, &f))
                .collect()
        };
        info!(entity_type, "create");
        let record = self
            .gateway
            .create(&self.resolve_type(entity_type), &payload, &return_fields)?;
        self.merge_record(record, OverridePolicy::Always)
    }

    pub fn update(&self, entity_type: &str, id: i64, fields: Fields) -> Result<EntityRef> {
        let payload = self.prepare_payload(entity_type, &fields)?;
        info!(entity_type, id, "update");
        let record = self
            .gateway
            .update(&self.resolve_type(entity_type), id, &payload)?;
        self.merge_record(record, OverridePolicy::Always)
    }

    /// Update several entities of one type in a single batch round trip.
    pub fn update_many(&self, updates: &[(EntityRef, Fields)]) -> Result<Vec<EntityRef>> {
        let mut requests = Vec::with_capacity(updates.len());
        let mut shared_type: Option<String> = None;
        for (entity, fields) in updates {
            self.assert_ownership(entity)?;
            let (entity_type, id) = entity.hash_key()?;
            match &shared_type {
                None => shared_type = Some(entity_type.clone()),
                Some(t) if *t == entity_type => {}
                Some(t) => {
                    return Err(SessionError::TypeMismatch(format!(
                        "cannot batch-update {} together with {}",
                        t, entity_type
                    )));
                }
            }
            requests.push(BatchRequest::Update {
                entity_type: self.resolve_type(&entity_type),
                id,
                fields: self.prepare_payload(&entity_type, fields)?,
            });
        }
        if requests.is_empty() {
            return Ok(Vec::new());
        }
        let responses = self.gateway.batch(&requests)?;
        responses
            .into_iter()
            .map(|r| match r {
                BatchResponse::Record(fields) => {
                    self.merge_record(fields, OverridePolicy::Always)
                }
                BatchResponse::Ack(_) => Err(SessionError::Gateway(
                    "batch update answered with a bare ack".to_string(),
                )),
            })
            .collect()
    }

    /// Run mixed operations in one round trip; results merge like their
    /// standalone counterparts.
    pub fn batch(&self, requests: Vec<BatchRequest>) -> Result<Vec<BatchOutcome>> {
        let mut prepared = Vec::with_capacity(requests.len());
        let mut retired: Vec<(String, i64)> = Vec::new();
        for request in requests {
            prepared.push(match request {
                BatchRequest::Create {
                    entity_type,
                    fields,
                } => BatchRequest::Create {
                    entity_type: self.resolve_type(&entity_type),
                    fields: self.prepare_payload(&entity_type, &fields)?,
                },
                BatchRequest::Update {
                    entity_type,
                    id,
                    fields,
                } => BatchRequest::Update {
                    entity_type: self.resolve_type(&entity_type),
                    id,
                    fields: self.prepare_payload(&entity_type, &fields)?,
                },
                BatchRequest::Delete { entity_type, id } => {
                    retired.push((entity_type.clone(), id));
                    BatchRequest::Delete {
                        entity_type: self.resolve_type(&entity_type),
                        id,
                    }
                }
            });
        }
        let responses = self.gateway.batch(&prepared)?;
        for (entity_type, id) in retired {
            if let Some(entity) = self.get_cached(&entity_type, id) {
                entity.set_exists(Existence::Retired)?;
            }
        }
        responses
            .into_iter()
            .map(|response| {
                Ok(match response {
                    BatchResponse::Record(fields) => {
                        BatchOutcome::Entity(self.merge_record(fields, OverridePolicy::Always)?)
                    }
                    BatchResponse::Ack(ok) => BatchOutcome::Ack(ok),
                })
            })
            .collect()
    }

    /// Retire an entity on the server. The cached record is marked retired
    /// but never evicted; existing handles keep their data.
    pub fn delete(&self, entity: &EntityRef) -> Result<bool> {
        self.assert_ownership(entity)?;
        let (entity_type, id) = entity.hash_key()?;
        self.delete_by_id(&entity_type, id)
    }

    pub fn delete_by_id(&self, entity_type: &str, id: i64) -> Result<bool> {
        info!(entity_type, id, "delete");
        let ok = self.gateway.delete(&self.resolve_type(entity_type), id)?;
        if let Some(entity) = self.get_cached(entity_type, id) {
            entity.set_exists(Existence::Retired)?;
        }
        Ok(ok)
    }

    // ---- fetching into the cache ----------------------------------------

    /// Pull the given fields for entities that are missing any of them;
    /// `force` refetches regardless. Entities whose ids come back are
    /// marked existing, the rest retired, and missing ids are an error
    /// after everything returned has merged.
    pub fn fetch(&self, entities: &[EntityRef], fields: &[&str], force: bool) -> Result<()> {
        for entity in entities {
            self.assert_ownership(entity)?;
        }
        let keys: Vec<String> = fields.iter().flat_map(|f| expand_braces(f)).collect();

        for (entity_type, group) in by_type(entities)? {
            let mut ids: Vec<i64> = Vec::new();
            for entity in &group {
                let missing = force
                    || keys.iter().any(|key| {
                        !matches!(entity.get(key), Ok(Some(_)))
                    });
                if missing {
                    if let Some(id) = entity.id() {
                        if !ids.contains(&id) {
                            ids.push(id);
                        }
                    }
                }
            }
            if ids.is_empty() {
                continue;
            }

            let found = self.find(&entity_type, &[Filter::id_in(&ids)], fields)?;
            let found_ids: HashSet<i64> = found.iter().filter_map(|e| e.id()).collect();
            for id in &ids {
                if let Some(entity) = self.get_cached(&entity_type, *id) {
                    entity.set_exists(if found_ids.contains(id) {
                        Existence::Exists
                    } else {
                        Existence::Retired
                    })?;
                }
            }
            let missing: Vec<i64> = ids
                .iter()
                .copied()
                .filter(|id| !found_ids.contains(id))
                .collect();
            if !missing.is_empty() {
                return Err(SessionError::NotFound {
                    entity_type,
                    ids: missing,
                });
            }
        }
        Ok(())
    }

    /// Pull the important fields and links for each entity's type.
    pub fn fetch_core(&self, entities: &[EntityRef]) -> Result<()> {
        for (entity_type, group) in by_type(entities)? {
            let fields = self.policy.core_fields(&entity_type);
            let refs: Vec<&str> = fields.iter().map(String::as_str).collect();
            self.fetch(&group, &refs, false)?;
        }
        Ok(())
    }

    /// Pull every `source_type` record whose `source_field` links to one of
    /// the given entities; merging registers the backrefs.
    pub fn fetch_backrefs(
        &self,
        entities: &[EntityRef],
        source_type: &str,
        source_field: &str,
    ) -> Result<()> {
        for entity in entities {
            self.assert_ownership(entity)?;
        }
        let values = entities
            .iter()
            .map(|e| e.minimal().map(Value::from))
            .collect::<Result<Vec<Value>>>()?;
        if values.is_empty() {
            return Ok(());
        }
        self.find(
            source_type,
            &[Filter::In(source_field.to_string(), values)],
            &[],
        )?;
        Ok(())
    }

    /// Keep the entities that exist on the server or whose existence is
    /// still unknown; only known-retired ones drop. With `check`, unknown
    /// (or with `force`, all) entities are verified in one find per type
    /// first.
    pub fn filter_exists(
        &self,
        entities: &[EntityRef],
        check: bool,
        force: bool,
    ) -> Result<Vec<EntityRef>> {
        for entity in entities {
            self.assert_ownership(entity)?;
        }
        if check {
            for (entity_type, group) in by_type(entities)? {
                let targets: Vec<&EntityRef> = group
                    .iter()
                    .filter(|e| force || e.exists() == Existence::Unknown)
                    .collect();
                if targets.is_empty() {
                    continue;
                }
                let ids: Vec<i64> = targets.iter().filter_map(|e| e.id()).collect();
                let found = self.find(&entity_type, &[Filter::id_in(&ids)], &[])?;
                let found_ids: HashSet<i64> = found.iter().filter_map(|e| e.id()).collect();
                for entity in targets {
                    let exists = entity.id().is_some_and(|id| found_ids.contains(&id));
                    entity.set_exists(if exists {
                        Existence::Exists
                    } else {
                        Existence::Retired
                    })?;
                }
            }
        }
        Ok(entities
            .iter()
            .filter(|e| e.exists() != Existence::Retired)
            .cloned()
            .collect())
    }

    // ---- users and user input -------------------------------------------

    /// Guess the current user from the environment, at most once per
    /// session. `TRACKSESSION_USER_ID` names a record outright, otherwise
    /// `TRACKSESSION_LOGIN` or `USER` is matched as an email prefix.
    pub fn guess_user(&self) -> Result<Option<EntityRef>> {
        if let Some(result) = &*self.guessed_user.lock()? {
            return Ok(result.clone());
        }
        let result = self.guess_user_uncached()?;
        *self.guessed_user.lock()? = Some(result.clone());
        Ok(result)
    }

    fn guess_user_uncached(&self) -> Result<Option<EntityRef>> {
        if let Ok(raw) = std::env::var("TRACKSESSION_USER_ID") {
            if let Ok(id) = raw.trim().parse::<i64>() {
                return self.get("HumanUser", id, &[]);
            }
        }
        let login = std::env::var("TRACKSESSION_LOGIN")
            .or_else(|_| std::env::var("USER"))
            .ok();
        let Some(login) = login.filter(|l| !l.is_empty()) else {
            return Ok(None);
        };
        debug!(login = %login, "guessing user from login");
        self.find_one(
            "HumanUser",
            &[Filter::starts_with("email", &format!("{}@", login))],
            &[],
        )
    }

    /// Turn user-supplied text into an entity handle. Accepts a JSON
    /// record, `Type:123` (also `_` or `-` separated, lowercase type
    /// allowed, with optional `?field=value` pairs), or a bare id when
    /// exactly one candidate type is given. The entity is not fetched.
    pub fn parse_user_input(
        &self,
        spec: &str,
        entity_types: &[&str],
    ) -> Result<EntityRef> {
        let spec = spec.trim();
        if spec.starts_with('{') {
            let json: serde_json::Value = serde_json::from_str(spec)
                .map_err(|err| SessionError::ParseSpec(format!("{}: {}", spec, err)))?;
            return match self.merge(Value::from_json(json))? {
                Value::Entity(entity) => Ok(entity),
                _ => Err(SessionError::ParseSpec(format!(
                    "{}: record carries no type and id",
                    spec
                ))),
            };
        }
        if let Ok(id) = spec.parse::<i64>() {
            return match entity_types {
                [only] => self.get_or_create(only, id),
                _ => Err(SessionError::ParseSpec(format!(
                    "{}: bare id is ambiguous over {} types",
                    spec,
                    entity_types.len()
                ))),
            };
        }
        if let Some(caps) = ENTITY_SPEC_RE.captures(spec) {
            let raw_type = caps.get(1).map_or("", |m| m.as_str());
            let mut chars = raw_type.chars();
            let entity_type: String = match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => return Err(SessionError::ParseSpec(spec.to_string())),
            };
            let id: i64 = caps
                .get(2)
                .map_or("", |m| m.as_str())
                .parse()
                .map_err(|_| SessionError::ParseSpec(spec.to_string()))?;
            if !entity_types.is_empty() && !entity_types.contains(&entity_type.as_str()) {
                return Err(SessionError::ParseSpec(format!(
                    "{}: type {} not among the candidates",
                    spec, entity_type
                )));
            }
            let entity = self.get_or_create(&entity_type, id)?;
            if let Some(query) = caps.get(3) {
                for pair in query.as_str().split('&').filter(|p| !p.is_empty()) {
                    let (field, value) = pair.split_once('=').ok_or_else(|| {
                        SessionError::ParseSpec(format!("{}: field '{}' has no value", spec, pair))
                    })?;
                    entity.set(field, Value::Text(value.to_string()))?;
                }
            }
            return Ok(entity);
        }
        Err(SessionError::ParseSpec(spec.to_string()))
    }

    // ---- background tasks ------------------------------------------------

    fn executor(&self) -> Result<Arc<Executor>> {
        let mut slot = self.executor.lock()?;
        if let Some(executor) = &*slot {
            return Ok(executor.clone());
        }
        let executor = Arc::new(Executor::new()?);
        *slot = Some(executor.clone());
        Ok(executor)
    }

    /// Run a closure against this session on the worker pool.
    pub fn submit<T, F>(&self, job: F) -> Result<Task<T>>
    where
        F: FnOnce(Arc<Session>) -> T + Send + 'static,
        T: Send + 'static,
    {
        let session = self
            .self_ref
            .upgrade()
            .ok_or_else(|| SessionError::Internal("session dropped".to_string()))?;
        Ok(self.executor()?.submit(move || job(session)))
    }

    pub fn find_task(
        &self,
        entity_type: String,
        filters: Vec<Filter>,
        fields: Vec<String>,
    ) -> Result<Task<Result<Vec<EntityRef>>>> {
        self.submit(move |session| {
            let refs: Vec<&str> = fields.iter().map(String::as_str).collect();
            session.find(&entity_type, &filters, &refs)
        })
    }

    pub fn create_task(
        &self,
        entity_type: String,
        fields: Fields,
        return_fields: Vec<String>,
    ) -> Result<Task<Result<EntityRef>>> {
        self.submit(move |session| {
            let refs: Vec<&str> = return_fields.iter().map(String::as_str).collect();
            session.create(&entity_type, fields, &refs)
        })
    }

    pub fn fetch_task(
        &self,
        entities: Vec<EntityRef>,
        fields: Vec<String>,
        force: bool,
    ) -> Result<Task<Result<()>>> {
        self.submit(move |session| {
            let refs: Vec<&str> = fields.iter().map(String::as_str).collect();
            session.fetch(&entities, &refs, force)
        })
    }

    pub fn fetch_hierarchy_task(
        &self,
        entities: Vec<EntityRef>,
    ) -> Result<Task<Result<Vec<EntityRef>>>> {
        self.submit(move |session| session.fetch_hierarchy(&entities))
    }
}

/// Group entities by their type, erroring on untyped ones.
fn by_type(entities: &[EntityRef]) -> Result<Vec<(String, Vec<EntityRef>)>> {
    let mut groups: BTreeMap<String, Vec<EntityRef>> = BTreeMap::new();
    for entity in entities {
        let entity_type = entity.entity_type().ok_or_else(|| {
            SessionError::Identity(format!("{} has no type", entity))
        })?;
        groups.entry(entity_type).or_default().push(entity.clone());
    }
    Ok(groups.into_iter().collect())
}
