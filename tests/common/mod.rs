//! In-memory gateway and fixtures shared by the integration suites.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{Duration, TimeZone, Utc};

use tracksession::{
    BatchRequest, BatchResponse, Fields, Filter, FindOptions, RequestGateway, Result, Session,
    SessionError, Value,
};

type Table = BTreeMap<i64, Fields>;

/// A toy server: live and retired tables per type, auto ids, a monotonic
/// clock for `updated_at`, and a call log for round-trip assertions.
pub struct MockGateway {
    live: Mutex<BTreeMap<String, Table>>,
    retired: Mutex<BTreeMap<String, Table>>,
    next_id: AtomicI64,
    clock: AtomicI64,
    calls: Mutex<Vec<String>>,
}

/// A minimal `{type, id}` link value.
pub fn link(entity_type: &str, id: i64) -> Value {
    Value::record(entity_type, id, std::iter::empty::<(&str, Value)>())
}

fn split_deep(key: &str) -> Option<(&str, &str, &str)> {
    let mut parts = key.splitn(3, '.');
    let local = parts.next()?;
    let declared = parts.next()?;
    let rest = parts.next()?;
    declared
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_uppercase())
        .then_some((local, declared, rest))
}

impl MockGateway {
    pub fn new() -> MockGateway {
        MockGateway {
            live: Mutex::new(BTreeMap::new()),
            retired: Mutex::new(BTreeMap::new()),
            next_id: AtomicI64::new(10_000),
            clock: AtomicI64::new(0),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn tick(&self) -> Value {
        let seconds = self.clock.fetch_add(1, Ordering::SeqCst);
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        Value::Text(
            (base + Duration::seconds(seconds))
                .format("%Y-%m-%d %H:%M:%S")
                .to_string(),
        )
    }

    fn log(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    /// Insert a record directly, stamping `updated_at` from the clock.
    pub fn seed<I, K, V>(&self, entity_type: &str, id: i64, fields: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let mut record = Fields::new();
        record.insert("type".to_string(), Value::Text(entity_type.to_string()));
        record.insert("id".to_string(), Value::Integer(id));
        record.insert("updated_at".to_string(), self.tick());
        for (k, v) in fields {
            record.insert(k.into(), v.into());
        }
        self.live
            .lock()
            .unwrap()
            .entry(entity_type.to_string())
            .or_default()
            .insert(id, record);
    }

    /// Overwrite stored fields without going through the session.
    pub fn poke<I, K, V>(&self, entity_type: &str, id: i64, fields: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        let mut live = self.live.lock().unwrap();
        let record = live
            .entry(entity_type.to_string())
            .or_default()
            .entry(id)
            .or_default();
        record.insert("updated_at".to_string(), self.tick());
        for (k, v) in fields {
            record.insert(k.into(), v.into());
        }
    }

    fn project(
        &self,
        tables: &BTreeMap<String, Table>,
        record: &Fields,
        field: &str,
    ) -> Value {
        if let Some(value) = record.get(field) {
            return value.clone();
        }
        let Some((local, declared, rest)) = split_deep(field) else {
            return Value::Null;
        };
        let Some(linked) = record.get(local).and_then(Value::as_map) else {
            return Value::Null;
        };
        if linked.get("type").and_then(Value::as_str) != Some(declared) {
            return Value::Null;
        }
        let Some(id) = linked.get("id").and_then(Value::as_i64) else {
            return Value::Null;
        };
        match tables.get(declared).and_then(|t| t.get(&id)) {
            Some(target) => self.project(tables, target, rest),
            None => Value::Null,
        }
    }

    fn matches(record: &Fields, filter: &Filter) -> bool {
        match filter {
            Filter::Is(field, value) => record.get(field) == Some(value),
            Filter::In(field, values) => record
                .get(field)
                .is_some_and(|v| values.iter().any(|candidate| candidate == v)),
            Filter::StartsWith(field, prefix) => record
                .get(field)
                .and_then(Value::as_str)
                .is_some_and(|s| s.starts_with(prefix)),
        }
    }
}

impl RequestGateway for MockGateway {
    fn find(
        &self,
        entity_type: &str,
        filters: &[Filter],
        fields: &[String],
        options: &FindOptions,
    ) -> Result<Vec<Fields>> {
        self.log(format!("find:{}", entity_type));
        let tables = if options.retired_only {
            self.retired.lock().unwrap()
        } else {
            self.live.lock().unwrap()
        };
        let mut out = Vec::new();
        if let Some(table) = tables.get(entity_type) {
            for record in table.values() {
                if !filters.iter().all(|f| Self::matches(record, f)) {
                    continue;
                }
                let mut projected = Fields::new();
                projected.insert("type".to_string(), Value::Text(entity_type.to_string()));
                projected.insert("id".to_string(), record["id"].clone());
                for field in fields {
                    if field == "type" || field == "id" {
                        continue;
                    }
                    projected.insert(field.clone(), self.project(&tables, record, field));
                }
                out.push(projected);
                if options.limit.is_some_and(|limit| out.len() >= limit) {
                    break;
                }
            }
        }
        Ok(out)
    }

    fn create(
        &self,
        entity_type: &str,
        fields: &Fields,
        return_fields: &[String],
    ) -> Result<Fields> {
        self.log(format!("create:{}", entity_type));
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut record = fields.clone();
        record.insert("type".to_string(), Value::Text(entity_type.to_string()));
        record.insert("id".to_string(), Value::Integer(id));
        record.insert("updated_at".to_string(), self.tick());
        {
            let mut live = self.live.lock().unwrap();
            live.entry(entity_type.to_string())
                .or_default()
                .insert(id, record.clone());
            let mut projected = Fields::new();
            projected.insert("type".to_string(), Value::Text(entity_type.to_string()));
            projected.insert("id".to_string(), Value::Integer(id));
            for field in return_fields {
                projected.insert(field.clone(), self.project(&live, &record, field));
            }
            Ok(projected)
        }
    }

    fn update(&self, entity_type: &str, id: i64, fields: &Fields) -> Result<Fields> {
        self.log(format!("update:{}:{}", entity_type, id));
        let mut live = self.live.lock().unwrap();
        let record = live
            .get_mut(entity_type)
            .and_then(|t| t.get_mut(&id))
            .ok_or_else(|| SessionError::NotFound {
                entity_type: entity_type.to_string(),
                ids: vec![id],
            })?;
        for (k, v) in fields {
            record.insert(k.clone(), v.clone());
        }
        record.insert("updated_at".to_string(), self.tick());
        Ok(record.clone())
    }

    fn batch(&self, requests: &[BatchRequest]) -> Result<Vec<BatchResponse>> {
        self.log(format!("batch:{}", requests.len()));
        requests
            .iter()
            .map(|request| {
                Ok(match request {
                    BatchRequest::Create {
                        entity_type,
                        fields,
                    } => BatchResponse::Record(self.create(
                        entity_type,
                        fields,
                        &["id".to_string()],
                    )?),
                    BatchRequest::Update {
                        entity_type,
                        id,
                        fields,
                    } => BatchResponse::Record(self.update(entity_type, *id, fields)?),
                    BatchRequest::Delete { entity_type, id } => {
                        BatchResponse::Ack(self.delete(entity_type, *id)?)
                    }
                })
            })
            .collect()
    }

    fn delete(&self, entity_type: &str, id: i64) -> Result<bool> {
        self.log(format!("delete:{}:{}", entity_type, id));
        let removed = self
            .live
            .lock()
            .unwrap()
            .get_mut(entity_type)
            .and_then(|t| t.remove(&id));
        match removed {
            Some(record) => {
                self.retired
                    .lock()
                    .unwrap()
                    .entry(entity_type.to_string())
                    .or_default()
                    .insert(id, record);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Honor `RUST_LOG` when a test run wants the session's tracing output.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// A small show: one project, two sequences, four shots, a step and tasks.
pub fn fixture() -> (Arc<Session>, Arc<MockGateway>) {
    init_tracing();
    let gateway = Arc::new(MockGateway::new());

    gateway.seed("Project", 1, [("name", Value::Text("Juniper".into()))]);
    gateway.seed(
        "Sequence",
        10,
        [("code", Value::Text("AA".into())), ("project", link("Project", 1))],
    );
    gateway.seed(
        "Sequence",
        20,
        [("code", Value::Text("BB".into())), ("project", link("Project", 1))],
    );
    for (id, code, seq) in [
        (101, "AA_001", 10),
        (102, "AA_002", 10),
        (201, "BB_001", 20),
        (202, "BB_002", 20),
    ] {
        gateway.seed(
            "Shot",
            id,
            [
                ("code", Value::Text(code.into())),
                ("sg_sequence", link("Sequence", seq)),
                ("project", link("Project", 1)),
            ],
        );
    }
    gateway.seed(
        "Step",
        5,
        [
            ("code", Value::Text("anim".into())),
            ("short_name", Value::Text("ANM".into())),
            ("entity_type", Value::Text("Shot".into())),
        ],
    );
    for (id, content, shot) in [(1001, "Animate", 101), (1002, "Animate", 102)] {
        gateway.seed(
            "Task",
            id,
            [
                ("content", Value::Text(content.into())),
                ("entity", link("Shot", shot)),
                ("step", link("Step", 5)),
                ("project", link("Project", 1)),
            ],
        );
    }

    let session = Session::new(gateway.clone());
    (session, gateway)
}
