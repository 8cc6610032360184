use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Identity error: {0}")]
    Identity(String),

    #[error("Entity does not belong to this session: {0}")]
    Ownership(String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("{entity_type} {ids:?} not found")]
    NotFound { entity_type: String, ids: Vec<i64> },

    #[error("{entity_type} {ids:?} came back without a parent link")]
    MissingParent { entity_type: String, ids: Vec<i64> },

    #[error("No parent field declared for entity type '{0}'")]
    UnknownType(String),

    #[error("Un-memoized recursion during merge")]
    Recursion,

    #[error("Cannot parse timestamp: {0}")]
    ParseTimestamp(String),

    #[error("Cannot parse entity spec: {0}")]
    ParseSpec(String),

    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;

impl<T> From<std::sync::PoisonError<T>> for SessionError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::Lock(err.to_string())
    }
}
