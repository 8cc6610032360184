//! Batched resolution of ancestor chains.
//!
//! Rather than one request per entity per level, the resolver walks every
//! cached parent link first, groups the entities whose parent is still
//! unknown by type, and fetches the largest group in one find. Each pass
//! resolves a whole level of one type, so the pass count stays proportional
//! to the number of distinct types in play.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use tracing::debug;

use crate::core::{Result, SessionError, Value};
use crate::entity::EntityRef;
use crate::gateway::Filter;
use crate::session::Session;

impl Session {
    /// Resolve the parent chain of every given entity up to the hierarchy
    /// root, fetching missing links in batches. Returns every entity
    /// touched, including the given ones, in discovery order.
    pub fn fetch_hierarchy(&self, entities: &[EntityRef]) -> Result<Vec<EntityRef>> {
        for entity in entities {
            self.assert_ownership(entity)?;
        }

        let mut all: Vec<EntityRef> = Vec::new();
        let mut all_ptrs: HashSet<usize> = HashSet::new();
        let mut to_fetch: Vec<EntityRef> = entities.to_vec();
        let mut to_resolve: Vec<EntityRef> = Vec::new();
        let mut types_seen: BTreeSet<String> = BTreeSet::new();
        let mut passes = 0usize;

        while !to_fetch.is_empty() || !to_resolve.is_empty() {
            passes += 1;

            // Walk as far up as the cache already reaches.
            for entity in std::mem::take(&mut to_fetch) {
                let mut current = entity;
                let mut chain: Vec<usize> = Vec::new();
                loop {
                    if chain.contains(&current.as_ptr()) {
                        break;
                    }
                    chain.push(current.as_ptr());

                    let Some(entity_type) = current.entity_type() else {
                        return Err(SessionError::Identity(format!(
                            "{} has no type to resolve a hierarchy from",
                            current
                        )));
                    };
                    types_seen.insert(entity_type.clone());
                    if all_ptrs.insert(current.as_ptr()) {
                        all.push(current.clone());
                    }
                    if self.policy().parent_field(&entity_type)?.is_none() {
                        break;
                    }
                    match current.parent(false)? {
                        Some(parent) => current = parent,
                        None => {
                            if !to_resolve.iter().any(|e| e.ptr_eq(&current)) {
                                to_resolve.push(current);
                            }
                            break;
                        }
                    }
                }
            }

            if to_resolve.is_empty() {
                break;
            }
            if passes > 2 * types_seen.len() + 2 {
                return Err(SessionError::Internal(format!(
                    "hierarchy resolution did not converge after {} passes over {} types",
                    passes,
                    types_seen.len()
                )));
            }

            // Fetch the parent link for the most numerous unresolved type.
            let mut by_type: BTreeMap<String, Vec<EntityRef>> = BTreeMap::new();
            for entity in &to_resolve {
                let entity_type = entity
                    .entity_type()
                    .unwrap_or_else(|| "?".to_string());
                by_type.entry(entity_type).or_default().push(entity.clone());
            }
            let mut chosen: Option<(String, Vec<EntityRef>)> = None;
            for (entity_type, group) in by_type {
                if chosen.as_ref().is_none_or(|(_, best)| group.len() > best.len()) {
                    chosen = Some((entity_type, group));
                }
            }
            let (entity_type, group) =
                chosen.ok_or_else(|| SessionError::Internal("empty resolve set".to_string()))?;
            to_resolve.retain(|e| !group.iter().any(|g| g.ptr_eq(e)));

            let parent_field = self
                .policy()
                .parent_field(&entity_type)?
                .ok_or_else(|| {
                    SessionError::Internal(format!(
                        "root type {} queued for parent resolution",
                        entity_type
                    ))
                })?
                .to_string();
            let ids = group
                .iter()
                .map(|e| {
                    e.id().ok_or_else(|| {
                        SessionError::Identity(format!("{} has no id to fetch by", e))
                    })
                })
                .collect::<Result<Vec<i64>>>()?;

            debug!(entity_type = %entity_type, count = ids.len(), "resolving parent links");
            let found =
                self.find(&entity_type, &[Filter::id_in(&ids)], &[parent_field.as_str()])?;

            let found_ids: HashSet<i64> = found.iter().filter_map(|e| e.id()).collect();
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

            let mut no_parent: Vec<i64> = Vec::new();
            for entity in &group {
                if !matches!(entity.get(&parent_field)?, Some(Value::Entity(_))) {
                    no_parent.extend(entity.id());
                }
            }
            if !no_parent.is_empty() {
                return Err(SessionError::MissingParent {
                    entity_type,
                    ids: no_parent,
                });
            }

            // Re-walk the group; their chains now extend at least one level.
            to_fetch = group;
        }

        Ok(all)
    }
}
