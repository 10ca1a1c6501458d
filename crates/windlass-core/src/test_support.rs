//! Test-only storage backend double.
//!
//! A single-mutex table map with optimistic revision checks, mirroring the
//! semantics the real backends in windlass-infra implement.

use std::collections::HashMap;
use std::sync::Mutex;

use uuid::Uuid;

use windlass_types::entity::{EntityKind, Selector, StoredEntity, WriteOp};
use windlass_types::error::StorageError;

use crate::storage::StorageBackend;

#[derive(Default)]
pub(crate) struct TableBackend {
    pub(crate) rows: Mutex<HashMap<(EntityKind, Uuid), StoredEntity>>,
    applied_batches: Mutex<Vec<Vec<WriteOp>>>,
}

impl TableBackend {
    /// Insert a row directly with revision 1, bypassing the write path.
    pub(crate) fn seed(&self, entity: impl Into<StoredEntity>) {
        let mut entity = entity.into();
        entity.set_revision(1);
        self.rows
            .lock()
            .unwrap()
            .insert((entity.kind(), entity.id()), entity);
    }

    pub(crate) fn batches(&self) -> Vec<Vec<WriteOp>> {
        self.applied_batches.lock().unwrap().clone()
    }

    pub(crate) fn row_count(&self, kind: EntityKind) -> usize {
        self.rows
            .lock()
            .unwrap()
            .keys()
            .filter(|(k, _)| *k == kind)
            .count()
    }

    pub(crate) fn get(&self, kind: EntityKind, id: Uuid) -> Option<StoredEntity> {
        self.rows.lock().unwrap().get(&(kind, id)).cloned()
    }
}

impl StorageBackend for TableBackend {
    async fn select_by_id(
        &self,
        kind: EntityKind,
        id: Uuid,
    ) -> Result<Option<StoredEntity>, StorageError> {
        Ok(self.rows.lock().unwrap().get(&(kind, id)).cloned())
    }

    async fn select_matching(
        &self,
        selector: &Selector,
    ) -> Result<Vec<StoredEntity>, StorageError> {
        let rows = self.rows.lock().unwrap();
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
        let mut rows = self.rows.lock().unwrap();

        // Validate every revision before touching anything.
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
                WriteOp::Insert(entity) => {
                    rows.insert((entity.kind(), entity.id()), entity.clone());
                }
                WriteOp::Update { entity, .. } => {
                    rows.insert((entity.kind(), entity.id()), entity.clone());
                }
                WriteOp::Delete { kind, id, .. } => {
                    rows.remove(&(*kind, *id));
                }
            }
        }
        self.applied_batches.lock().unwrap().push(batch.to_vec());
        Ok(())
    }
}
