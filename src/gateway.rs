//! The boundary to the remote store.
//!
//! The session never talks to a wire protocol directly; it drives a
//! [`RequestGateway`] implementation with already-typed requests and gets
//! raw field maps back. Tests plug in an in-memory gateway, production code
//! wraps a transport client.

use crate::core::{Fields, Result, Value};
use crate::entity::EntityRef;

/// One condition in a find request.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    /// `field` equals the value exactly.
    Is(String, Value),
    /// `field` equals any of the values.
    In(String, Vec<Value>),
    /// `field` is text starting with the prefix.
    StartsWith(String, String),
}

impl Filter {
    pub fn is<V: Into<Value>>(field: &str, value: V) -> Filter {
        Filter::Is(field.to_string(), value.into())
    }

    /// Match a link field against an entity, compared by minimal identity.
    pub fn is_entity(field: &str, entity: &EntityRef) -> Result<Filter> {
        Ok(Filter::Is(
            field.to_string(),
            Value::from(entity.minimal()?),
        ))
    }

    pub fn id_in(ids: &[i64]) -> Filter {
        Filter::In(
            "id".to_string(),
            ids.iter().copied().map(Value::Integer).collect(),
        )
    }

    pub fn starts_with(field: &str, prefix: &str) -> Filter {
        Filter::StartsWith(field.to_string(), prefix.to_string())
    }

    pub fn field(&self) -> &str {
        match self {
            Filter::Is(f, _) | Filter::StartsWith(f, _) => f,
            Filter::In(f, _) => f,
        }
    }
}

/// Knobs for a find request.
#[derive(Debug, Clone)]
pub struct FindOptions {
    /// Maximum number of records; `None` means all.
    pub limit: Option<usize>,
    /// Search retired records instead of live ones.
    pub retired_only: bool,
    /// Let the session widen the requested fields with its planning policy.
    pub plan_fields: bool,
}

impl Default for FindOptions {
    fn default() -> Self {
        Self {
            limit: None,
            retired_only: false,
            plan_fields: true,
        }
    }
}

/// One operation in a batch request.
#[derive(Debug, Clone)]
pub enum BatchRequest {
    Create {
        entity_type: String,
        fields: Fields,
    },
    Update {
        entity_type: String,
        id: i64,
        fields: Fields,
    },
    Delete {
        entity_type: String,
        id: i64,
    },
}

/// The per-operation results of a batch, in request order.
#[derive(Debug, Clone)]
pub enum BatchResponse {
    /// A created or updated record.
    Record(Fields),
    /// Whether a delete found its target.
    Ack(bool),
}

/// Synchronous capability surface of the remote store.
pub trait RequestGateway: Send + Sync {
    /// Return raw records of `entity_type` matching all filters, carrying
    /// at least the requested fields plus `type` and `id`.
    fn find(
        &self,
        entity_type: &str,
        filters: &[Filter],
        fields: &[String],
        options: &FindOptions,
    ) -> Result<Vec<Fields>>;

    /// Create a record and return it with the requested fields.
    fn create(&self, entity_type: &str, fields: &Fields, return_fields: &[String])
    -> Result<Fields>;

    /// Update a record and return its new state.
    fn update(&self, entity_type: &str, id: i64, fields: &Fields) -> Result<Fields>;

    /// Run several operations in one round trip.
    fn batch(&self, requests: &[BatchRequest]) -> Result<Vec<BatchResponse>>;

    /// Retire a record; `false` when it did not exist.
    fn delete(&self, entity_type: &str, id: i64) -> Result<bool>;
}

/// Optional alias resolution, applied to outgoing requests only.
pub trait SchemaResolver: Send + Sync {
    fn resolve_type(&self, entity_type: &str) -> String;
    fn resolve_field(&self, entity_type: &str, field: &str) -> String;
}

/// Optional rewriting of path-like text values during merges.
pub trait PathRemap: Send + Sync {
    /// Return `Some` to replace the text, `None` to keep it.
    fn remap(&self, raw: &str) -> Option<String>;
}
