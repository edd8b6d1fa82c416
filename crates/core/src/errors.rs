use thiserror::Error;

use crate::store::StoreError;

/// Failure taxonomy for engine operations.
///
/// `NotFound`, `Conflict`, and `Forbidden` are surfaced to the caller as-is
/// and are never retried here. `InvalidRequest` indicates a broken template
/// or configuration and is logged at error severity by the engine before
/// being surfaced. `Store` wraps a failure of the authoritative persistence
/// write, which is the operation's failure by contract; side-effect
/// failures (notification, audit) never appear here.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("{entity} `{id}` was not found")]
    NotFound { entity: &'static str, id: String },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound { entity, id: id.into() }
    }
}
