//! Write-behind entity session: the per-unit-of-work persistence cache.
//!
//! The session tracks every entity a unit of work touches and defers all
//! store writes to a single `flush` at commit time. Flush emits the minimal
//! batch: transient entities become inserts, loaded entities that differ from
//! their pristine snapshot become optimistic-locked updates, deleted entities
//! become optimistic-locked deletes, and entities inserted and deleted within
//! the same unit of work produce no store traffic at all.
//!
//! A session is strictly context-scoped and never shared across threads.
//! Reads after a write observe the write (cache-first lookup), and selector
//! reads merge store rows with uncommitted cache state so no stale duplicate
//! can leak out.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use windlass_types::entity::{
    EntityKind, ExecutionEntity, JobEntity, Selector, StoredEntity, VariableEntity, WriteOp,
};
use windlass_types::error::StorageError;

use crate::storage::StorageBackend;

// ---------------------------------------------------------------------------
// Cache bookkeeping
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheState {
    /// Inserted in this unit of work; not yet in the store.
    Transient,
    /// Loaded from the store.
    Persistent,
    /// Marked deleted. `was_persistent` decides whether a delete is emitted.
    Removed { was_persistent: bool },
}

#[derive(Debug, Clone)]
struct CachedEntity {
    current: StoredEntity,
    /// Pristine copy as loaded, for dirty checking. `None` for entities
    /// handed to `update` without a prior load; those flush unconditionally.
    snapshot: Option<StoredEntity>,
    state: CacheState,
}

// ---------------------------------------------------------------------------
// EntitySession
// ---------------------------------------------------------------------------

/// Per-unit-of-work write-behind cache over a [`StorageBackend`].
pub struct EntitySession<S: StorageBackend> {
    backend: Arc<S>,
    cache: HashMap<(EntityKind, Uuid), CachedEntity>,
    flushed: bool,
}

impl<S: StorageBackend> EntitySession<S> {
    pub fn new(backend: Arc<S>) -> Self {
        Self {
            backend,
            cache: HashMap::new(),
            flushed: false,
        }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    /// Load one entity, cache-first. A store hit is retained with a pristine
    /// snapshot so later flushes can diff against it.
    pub async fn find_by_id(
        &mut self,
        kind: EntityKind,
        id: Uuid,
    ) -> Result<Option<StoredEntity>, StorageError> {
        if let Some(cached) = self.cache.get(&(kind, id)) {
            return Ok(match cached.state {
                CacheState::Removed { .. } => None,
                _ => Some(cached.current.clone()),
            });
        }

        let Some(entity) = self.backend.select_by_id(kind, id).await? else {
            return Ok(None);
        };
        self.cache.insert(
            (kind, id),
            CachedEntity {
                current: entity.clone(),
                snapshot: Some(entity.clone()),
                state: CacheState::Persistent,
            },
        );
        Ok(Some(entity))
    }

    /// Load all entities matching `selector`, merging store rows with cached
    /// state: cached copies supersede store rows, deletions are excluded,
    /// transient inserts that match are included.
    pub async fn find_matching(
        &mut self,
        selector: &Selector,
    ) -> Result<Vec<StoredEntity>, StorageError> {
        let kind = selector.kind();
        let store_rows = self.backend.select_matching(selector).await?;

        let mut results: Vec<StoredEntity> = Vec::new();
        for row in store_rows {
            let key = (kind, row.id());
            match self.cache.get(&key) {
                // Cached copy wins; it is added below from the cache walk.
                Some(_) => {}
                None => {
                    self.cache.insert(
                        key,
                        CachedEntity {
                            current: row.clone(),
                            snapshot: Some(row.clone()),
                            state: CacheState::Persistent,
                        },
                    );
                    results.push(row);
                }
            }
        }

        for cached in self.cache.values() {
            if cached.current.kind() != kind {
                continue;
            }
            if matches!(cached.state, CacheState::Removed { .. }) {
                continue;
            }
            if selector.matches(&cached.current) && !results.iter().any(|e| e.id() == cached.current.id())
            {
                results.push(cached.current.clone());
            }
        }

        selector.sort(&mut results);
        if let Some(limit) = selector.limit() {
            results.truncate(limit);
        }
        Ok(results)
    }

    /// Typed lookup helpers.
    pub async fn find_execution(
        &mut self,
        id: Uuid,
    ) -> Result<Option<ExecutionEntity>, StorageError> {
        Ok(self
            .find_by_id(EntityKind::Execution, id)
            .await?
            .and_then(StoredEntity::into_execution))
    }

    pub async fn find_job(&mut self, id: Uuid) -> Result<Option<JobEntity>, StorageError> {
        Ok(self
            .find_by_id(EntityKind::Job, id)
            .await?
            .and_then(StoredEntity::into_job))
    }

    pub async fn find_variable_by_name(
        &mut self,
        execution_id: Uuid,
        name: &str,
    ) -> Result<Option<VariableEntity>, StorageError> {
        let selector = Selector::VariableByName {
            execution_id,
            name: name.to_string(),
        };
        Ok(self
            .find_matching(&selector)
            .await?
            .into_iter()
            .next()
            .and_then(StoredEntity::into_variable))
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Register a newly created entity. It reaches the store at flush.
    pub fn insert(&mut self, entity: impl Into<StoredEntity>) {
        let entity = entity.into();
        let key = (entity.kind(), entity.id());
        self.cache.insert(
            key,
            CachedEntity {
                current: entity,
                snapshot: None,
                state: CacheState::Transient,
            },
        );
    }

    /// Record the new state of an entity. For loaded entities the flush only
    /// emits an update when the state actually differs from the snapshot.
    pub fn update(&mut self, entity: impl Into<StoredEntity>) {
        let entity = entity.into();
        let key = (entity.kind(), entity.id());
        match self.cache.get_mut(&key) {
            Some(cached) => match cached.state {
                CacheState::Removed { .. } => {
                    tracing::warn!(kind = %entity.kind(), id = %entity.id(), "update of deleted entity ignored");
                }
                _ => cached.current = entity,
            },
            None => {
                // Updated without a prior load in this session; flush
                // unconditionally with the revision the caller read.
                self.cache.insert(
                    key,
                    CachedEntity {
                        current: entity,
                        snapshot: None,
                        state: CacheState::Persistent,
                    },
                );
            }
        }
    }

    /// Mark an entity deleted. Inserted-then-deleted entities are elided
    /// entirely at flush.
    pub fn delete(&mut self, entity: impl Into<StoredEntity>) {
        let entity = entity.into();
        let key = (entity.kind(), entity.id());
        match self.cache.get_mut(&key) {
            Some(cached) => {
                let was_persistent = !matches!(cached.state, CacheState::Transient);
                cached.state = CacheState::Removed { was_persistent };
            }
            None => {
                self.cache.insert(
                    key,
                    CachedEntity {
                        current: entity,
                        snapshot: None,
                        state: CacheState::Removed {
                            was_persistent: true,
                        },
                    },
                );
            }
        }
    }

    // -----------------------------------------------------------------------
    // Flush
    // -----------------------------------------------------------------------

    /// Compute the minimal write batch for this unit of work.
    ///
    /// Inserts come first, then updates, then deletes, each in (kind, id)
    /// order so batches are deterministic.
    pub fn flush_ops(&self) -> Vec<WriteOp> {
        let mut inserts = Vec::new();
        let mut updates = Vec::new();
        let mut deletes = Vec::new();

        let mut entries: Vec<&CachedEntity> = self.cache.values().collect();
        entries.sort_by_key(|c| (c.current.kind(), c.current.id()));

        for cached in entries {
            match cached.state {
                CacheState::Transient => {
                    let mut entity = cached.current.clone();
                    entity.set_revision(1);
                    inserts.push(WriteOp::Insert(entity));
                }
                CacheState::Persistent => {
                    let dirty = match &cached.snapshot {
                        Some(snapshot) => *snapshot != cached.current,
                        None => true,
                    };
                    if dirty {
                        let expected = cached
                            .snapshot
                            .as_ref()
                            .map(StoredEntity::revision)
                            .unwrap_or_else(|| cached.current.revision());
                        let mut entity = cached.current.clone();
                        entity.set_revision(expected + 1);
                        updates.push(WriteOp::Update {
                            entity,
                            expected_revision: expected,
                        });
                    }
                }
                CacheState::Removed { was_persistent } => {
                    if was_persistent {
                        let expected = cached
                            .snapshot
                            .as_ref()
                            .map(StoredEntity::revision)
                            .unwrap_or_else(|| cached.current.revision());
                        deletes.push(WriteOp::Delete {
                            kind: cached.current.kind(),
                            id: cached.current.id(),
                            expected_revision: expected,
                        });
                    }
                }
            }
        }

        inserts.extend(updates);
        inserts.extend(deletes);
        inserts
    }

    /// Flush the computed batch to the backend. At most one flush per
    /// session; a second call is a logic error.
    pub async fn flush(&mut self) -> Result<(), StorageError> {
        if self.flushed {
            return Err(StorageError::Backend(
                "entity session flushed twice".to_string(),
            ));
        }
        self.flushed = true;

        let batch = self.flush_ops();
        if batch.is_empty() {
            return Ok(());
        }
        tracing::debug!(writes = batch.len(), "flushing entity session");
        self.backend.apply(&batch).await
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
