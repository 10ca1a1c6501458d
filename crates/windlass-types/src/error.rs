use thiserror::Error;

use crate::entity::EntityKind;
use uuid::Uuid;

/// Errors from storage backend operations (used by the port definition in
/// windlass-core).
#[derive(Debug, Error)]
pub enum StorageError {
    /// An optimistic-lock revision check failed. The whole write batch was
    /// rolled back.
    #[error("concurrent update on {kind} {id}")]
    Conflict { kind: EntityKind, id: Uuid },

    /// A referenced row does not exist.
    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: Uuid },

    /// Backend-specific failure (connection, query, transaction).
    #[error("storage backend error: {0}")]
    Backend(String),

    /// A stored value could not be decoded.
    #[error("corrupt stored value: {0}")]
    Corrupt(String),
}
