//! In-memory storage backend.
//!
//! A single-map store guarded by one mutex, with the same optimistic-lock
//! semantics as the SQLite backend: every revision in a batch is validated
//! before anything is applied, so a batch is all-or-nothing.

use std::collections::HashMap;
use std::sync::Mutex;

use uuid::Uuid;

use windlass_core::storage::StorageBackend;
use windlass_types::entity::{EntityKind, Selector, StoredEntity, WriteOp};
use windlass_types::error::StorageError;

/// Non-durable [`StorageBackend`] for tests and ephemeral embedding.
#[derive(Default)]
pub struct MemoryBackend {
    rows: Mutex<HashMap<(EntityKind, Uuid), StoredEntity>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rows currently stored for one entity family.
    pub fn count(&self, kind: EntityKind) -> usize {
        self.rows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .filter(|(k, _)| *k == kind)
            .count()
    }
}

impl StorageBackend for MemoryBackend {
    async fn select_by_id(
        &self,
        kind: EntityKind,
        id: Uuid,
    ) -> Result<Option<StoredEntity>, StorageError> {
        let rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        Ok(rows.get(&(kind, id)).cloned())
    }

    async fn select_matching(
        &self,
        selector: &Selector,
    ) -> Result<Vec<StoredEntity>, StorageError> {
        let rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());
        let mut results: Vec<StoredEntity> = rows
            .values()
            .filter(|e| selector.matches(e))
            .cloned()
            .collect();
        selector.sort(&mut results);
        if let Some(limit) = selector.limit() {
            results.truncate(limit);
        }
        Ok(results)
    }

    async fn apply(&self, batch: &[WriteOp]) -> Result<(), StorageError> {
        let mut rows = self.rows.lock().unwrap_or_else(|e| e.into_inner());

        for op in batch {
            match op {
                WriteOp::Insert(_) => {}
                WriteOp::Update {
                    entity,
                    expected_revision,
                } => {
                    let key = (entity.kind(), entity.id());
                    match rows.get(&key) {
                        Some(stored) if stored.revision() == *expected_revision => {}
                        _ => {
                            return Err(StorageError::Conflict {
                                kind: key.0,
                                id: key.1,
                            });
                        }
                    }
                }
                WriteOp::Delete {
                    kind,
                    id,
                    expected_revision,
                } => {
                    if let Some(stored) = rows.get(&(*kind, *id)) {
                        if stored.revision() != *expected_revision {
                            return Err(StorageError::Conflict {
                                kind: *kind,
                                id: *id,
                            });
                        }
                    }
                }
            }
        }

        for op in batch {
            match op {
                WriteOp::Insert(entity) | WriteOp::Update { entity, .. } => {
                    rows.insert((entity.kind(), entity.id()), entity.clone());
                }
                WriteOp::Delete { kind, id, .. } => {
                    rows.remove(&(*kind, *id));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use windlass_types::entity::ExecutionEntity;

    async fn seeded_execution(backend: &MemoryBackend) -> ExecutionEntity {
        let mut exec = ExecutionEntity::new_root("p", None);
        exec.revision = 1;
        let entity: StoredEntity = exec.clone().into();
        backend.apply(&[WriteOp::Insert(entity)]).await.unwrap();
        exec
    }

    #[tokio::test]
    async fn stale_update_fails_whole_batch() {
        let backend = MemoryBackend::new();
        let exec = seeded_execution(&backend).await;

        let mut fresh = exec.clone();
        fresh.revision = 2;
        let mut other = ExecutionEntity::new_root("q", None);
        other.revision = 1;

        // Valid insert paired with a stale update: nothing may land.
        let batch = [
            WriteOp::Insert(other.clone().into()),
            WriteOp::Update {
                entity: fresh.into(),
                expected_revision: 99,
            },
        ];
        let err = backend.apply(&batch).await.unwrap_err();
        assert!(matches!(err, StorageError::Conflict { .. }));
        assert!(
            backend
                .select_by_id(EntityKind::Execution, other.id)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn delete_of_missing_row_is_a_no_op() {
        let backend = MemoryBackend::new();
        backend
            .apply(&[WriteOp::Delete {
                kind: EntityKind::Job,
                id: Uuid::now_v7(),
                expected_revision: 1,
            }])
            .await
            .unwrap();
    }
}
