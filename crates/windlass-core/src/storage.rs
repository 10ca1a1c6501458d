//! Storage backend port.
//!
//! The engine consumes a transactional row store through this trait; the
//! infrastructure layer (windlass-infra) implements it for SQLite and an
//! in-memory table set. Every row carries an optimistic-lock revision, and
//! `apply` is the engine's only write path: one batch per unit of work,
//! all-or-nothing.

use uuid::Uuid;

use windlass_types::entity::{EntityKind, Selector, StoredEntity, WriteOp};
use windlass_types::error::StorageError;

/// Transactional key/row store with optimistic-lock revisions.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait StorageBackend: Send + Sync + 'static {
    /// Load one entity by kind and id.
    fn select_by_id(
        &self,
        kind: EntityKind,
        id: Uuid,
    ) -> impl std::future::Future<Output = Result<Option<StoredEntity>, StorageError>> + Send;

    /// Load all entities matching a selector, in the selector's ordering.
    fn select_matching(
        &self,
        selector: &Selector,
    ) -> impl std::future::Future<Output = Result<Vec<StoredEntity>, StorageError>> + Send;

    /// Apply a write batch atomically.
    ///
    /// Updates and deletes name the revision the unit of work read; if any
    /// stored revision differs, nothing is applied and the call fails with
    /// `StorageError::Conflict` for the first mismatching entity.
    fn apply(
        &self,
        batch: &[WriteOp],
    ) -> impl std::future::Future<Output = Result<(), StorageError>> + Send;
}
