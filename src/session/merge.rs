//! Recursive, cycle-safe merging of raw records into the identity map.
//!
//! Merging walks a raw value tree, routes every entity-shaped map through
//! the session cache, and memoizes each input node by pointer identity so
//! shared and self-referencing structures resolve to the same output. The
//! canonical entity is memoized before its fields are applied, which is
//! what lets cycles terminate.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::trace;

use crate::core::{Fields, Result, SessionError, Value};
use crate::entity::{split_deep_field, EntityRef};
use crate::session::Session;

/// When an incoming field may replace a cached one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OverridePolicy {
    /// Incoming data always wins.
    Always,
    /// Cached data always wins; absent fields are still added.
    Never,
    /// Incoming data wins only with a strictly newer timestamp. Records
    /// without comparable timestamps on both sides always win.
    #[default]
    IfNewer,
}

enum MemoSlot {
    Pending,
    Done(Value),
}

type Memo = HashMap<usize, MemoSlot>;

impl Session {
    /// Merge a raw value with the default if-newer policy.
    pub fn merge(&self, raw: Value) -> Result<Value> {
        self.merge_with(raw, OverridePolicy::default())
    }

    /// Merge a raw value, returning its canonical form: entity-shaped maps
    /// come back as cached [`EntityRef`]s, containers are rebuilt around
    /// their merged contents, scalars pass through.
    pub fn merge_with(&self, raw: Value, policy: OverridePolicy) -> Result<Value> {
        self.merge_with_reference(raw, policy, None)
    }

    /// Merge with a fallback timestamp for records that carry none of their
    /// own, e.g. the creation time of the event that delivered them. An
    /// unparsable reference is a hard error, never a silently won
    /// comparison.
    pub fn merge_with_reference(
        &self,
        raw: Value,
        policy: OverridePolicy,
        reference: Option<&Value>,
    ) -> Result<Value> {
        let reference = reference
            .filter(|v| !v.is_null())
            .map(Value::as_timestamp)
            .transpose()?;
        let mut memo = Memo::new();
        self.merge_value(raw, policy, reference, &mut memo)
    }

    /// Merge a raw record that must carry a complete identity.
    pub(crate) fn merge_record(&self, fields: Fields, policy: OverridePolicy) -> Result<EntityRef> {
        let map = Arc::new(fields);
        let key = Arc::as_ptr(&map) as usize;
        let mut memo = Memo::new();
        match self.merge_map_contents(key, (*map).clone(), policy, None, &mut memo)? {
            Value::Entity(entity) => Ok(entity),
            _ => Err(SessionError::Gateway(
                "record came back without type and id".to_string(),
            )),
        }
    }

    /// Set one field on a cached entity, with the same deep-key handling
    /// and backref registration as a merge.
    pub(crate) fn set_field(&self, entity: &EntityRef, key: &str, value: Value) -> Result<()> {
        let mut src = Fields::new();
        src.insert(key.to_string(), value);
        let mut memo = Memo::new();
        self.apply_update(entity, &src, OverridePolicy::Always, None, &mut memo)
    }

    fn merge_value(
        &self,
        raw: Value,
        policy: OverridePolicy,
        reference: Option<DateTime<Utc>>,
        memo: &mut Memo,
    ) -> Result<Value> {
        match raw {
            Value::Entity(entity) => {
                if self.owns(&entity) {
                    return Ok(Value::Entity(entity));
                }
                // Foreign entities re-merge from their structural form so
                // this session ends up with its own canonical record.
                let key = entity.as_ptr();
                if let Some(slot) = memo.get(&key) {
                    return match slot {
                        MemoSlot::Done(value) => Ok(value.clone()),
                        MemoSlot::Pending => Err(SessionError::Recursion),
                    };
                }
                self.merge_map_contents(key, entity.structural_map(), policy, reference, memo)
            }
            Value::Map(map) => {
                let key = Arc::as_ptr(&map) as usize;
                if let Some(slot) = memo.get(&key) {
                    return match slot {
                        MemoSlot::Done(value) => Ok(value.clone()),
                        MemoSlot::Pending => Err(SessionError::Recursion),
                    };
                }
                self.merge_map_contents(key, (*map).clone(), policy, reference, memo)
            }
            Value::List(items) => {
                let key = Arc::as_ptr(&items) as *const () as usize;
                if let Some(slot) = memo.get(&key) {
                    return match slot {
                        MemoSlot::Done(value) => Ok(value.clone()),
                        MemoSlot::Pending => Err(SessionError::Recursion),
                    };
                }
                memo.insert(key, MemoSlot::Pending);
                let merged = items
                    .iter()
                    .cloned()
                    .map(|v| self.merge_value(v, policy, reference, memo))
                    .collect::<Result<Vec<Value>>>()?;
                let value = Value::List(Arc::new(merged));
                memo.insert(key, MemoSlot::Done(value.clone()));
                Ok(value)
            }
            Value::Text(text) => {
                if let Some(remap) = &self.path_remap {
                    if let Some(replaced) = remap.remap(&text) {
                        return Ok(Value::Text(replaced));
                    }
                }
                Ok(Value::Text(text))
            }
            other => Ok(other),
        }
    }

    fn merge_map_contents(
        &self,
        key: usize,
        fields: Fields,
        policy: OverridePolicy,
        reference: Option<DateTime<Utc>>,
        memo: &mut Memo,
    ) -> Result<Value> {
        let entity_type = fields
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_string);
        let id = fields.get("id").and_then(Value::as_i64);

        if let (Some(entity_type), Some(id)) = (entity_type, id) {
            let entity = self.get_or_create(&entity_type, id)?;
            // Memoized before the update so self-references resolve.
            memo.insert(key, MemoSlot::Done(Value::Entity(entity.clone())));
            self.apply_update(&entity, &fields, policy, reference, memo)?;
            return Ok(Value::Entity(entity));
        }

        memo.insert(key, MemoSlot::Pending);
        let mut merged = Fields::new();
        for (k, v) in fields {
            merged.insert(k, self.merge_value(v, policy, reference, memo)?);
        }
        let value = Value::Map(Arc::new(merged));
        memo.insert(key, MemoSlot::Done(value.clone()));
        Ok(value)
    }

    fn apply_update(
        &self,
        dst: &EntityRef,
        src: &Fields,
        policy: OverridePolicy,
        reference: Option<DateTime<Utc>>,
        memo: &mut Memo,
    ) -> Result<()> {
        // Fold deep-dotted keys into the stub maps they describe, seeded
        // from the cached value of the local field when there is one.
        let mut flat = Fields::new();
        for (key, value) in src {
            if key == "type" || key == "id" {
                continue;
            }
            if let Some((field, _, _)) = split_deep_field(key) {
                if !flat.contains_key(field) {
                    if let Some(existing) = dst.field(field) {
                        flat.insert(field.to_string(), existing);
                    }
                }
                insert_deep(&mut flat, key, value.clone())?;
            } else {
                flat.insert(key.clone(), value.clone());
            }
        }

        // One override decision per record, from the timestamp field. The
        // reference time stands in for a missing incoming timestamp; a
        // record without anything to compare against wins.
        let over = match policy {
            OverridePolicy::Always => true,
            OverridePolicy::Never => false,
            OverridePolicy::IfNewer => {
                let ts_field = self.policy.timestamp_field.as_str();
                let src_time = match flat.get(ts_field) {
                    Some(ts) if !ts.is_null() => Some(ts.as_timestamp()?),
                    _ => reference,
                };
                let dst_time = match dst.field(ts_field) {
                    Some(ts) if !ts.is_null() => Some(ts.as_timestamp()?),
                    _ => None,
                };
                match (src_time, dst_time) {
                    (Some(src_time), Some(dst_time)) => src_time > dst_time,
                    _ => true,
                }
            }
        };

        trace!(entity = %**dst, over, fields = flat.len(), "applying update");

        // Every incoming value merges even when the cached one keeps, so
        // nested records under kept keys still reach the cache.
        for (key, value) in flat {
            let merged = self.merge_value(value, policy, reference, memo)?;
            if !over && dst.field(&key).is_some() {
                continue;
            }
            if let Value::Entity(linked) = &merged {
                if let Some(dst_type) = dst.entity_type() {
                    linked.add_backref(&dst_type, &key, dst)?;
                }
            }
            dst.insert_field(key, merged)?;
        }
        Ok(())
    }
}

/// Deposit `value` under a deep-dotted `key` inside `map`, creating typed
/// stub maps along the way. A stub whose declared type disagrees with the
/// value already present is silently skipped; burying a value inside a
/// concrete scalar is a type mismatch.
fn insert_deep(map: &mut Fields, key: &str, value: Value) -> Result<()> {
    let Some((field, declared, rest)) = split_deep_field(key) else {
        map.insert(key.to_string(), value);
        return Ok(());
    };

    let mut stub = match map.get(field) {
        None | Some(Value::Null) => {
            let mut stub = Fields::new();
            stub.insert("type".to_string(), Value::Text(declared.to_string()));
            stub
        }
        Some(Value::Map(existing)) => {
            if existing.get("type").and_then(Value::as_str) != Some(declared) {
                return Ok(());
            }
            (**existing).clone()
        }
        Some(Value::Entity(existing)) => {
            if existing.entity_type().as_deref() != Some(declared) {
                return Ok(());
            }
            existing.structural_map()
        }
        Some(other) => {
            if value.is_null() {
                return Ok(());
            }
            return Err(SessionError::TypeMismatch(format!(
                "cannot bury {} under {} value at '{}'",
                key,
                other.type_name(),
                field
            )));
        }
    };
    insert_deep(&mut stub, rest, value)?;
    map.insert(field.to_string(), Value::Map(Arc::new(stub)));
    Ok(())
}
