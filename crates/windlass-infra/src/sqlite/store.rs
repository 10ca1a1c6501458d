//! SQLite implementation of the engine storage port.
//!
//! Entities map to one table per family. `apply` runs the whole write batch
//! in a single transaction on the writer pool; every UPDATE and DELETE is
//! guarded by `AND revision = ?`, and a zero-row result aborts the batch
//! with a conflict, which the engine surfaces as a retryable
//! concurrent-update error.

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::Row;
use sqlx::sqlite::SqliteRow;
use uuid::Uuid;

use windlass_core::storage::StorageBackend;
use windlass_types::entity::{
    EntityKind, ExecutionEntity, JobEntity, JobKind, Selector, StoredEntity, VariableEntity,
    WriteOp,
};
use windlass_types::error::StorageError;

use super::pool::DatabasePool;

/// Durable [`StorageBackend`] over a [`DatabasePool`].
pub struct SqliteBackend {
    pool: DatabasePool,
}

impl SqliteBackend {
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn backend_err(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

fn parse_uuid(s: &str) -> Result<Uuid, StorageError> {
    s.parse::<Uuid>()
        .map_err(|e| StorageError::Corrupt(format!("invalid UUID '{s}': {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt(format!("invalid datetime '{s}': {e}")))
}

/// Fixed-width UTC formatting so stored datetimes compare lexicographically.
fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn job_kind_str(kind: JobKind) -> &'static str {
    match kind {
        JobKind::Timer => "timer",
        JobKind::AsyncContinuation => "async_continuation",
    }
}

fn parse_job_kind(s: &str) -> Result<JobKind, StorageError> {
    match s {
        "timer" => Ok(JobKind::Timer),
        "async_continuation" => Ok(JobKind::AsyncContinuation),
        other => Err(StorageError::Corrupt(format!("invalid job kind '{other}'"))),
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct ExecutionRow {
    id: String,
    process_instance_id: String,
    parent_id: Option<String>,
    definition_key: String,
    activity_id: Option<String>,
    is_active: bool,
    is_concurrent: bool,
    is_scope: bool,
    is_suspended: bool,
    waiting_signal: Option<String>,
    tenant_id: Option<String>,
    revision: i64,
}

impl ExecutionRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            process_instance_id: row.try_get("process_instance_id")?,
            parent_id: row.try_get("parent_id")?,
            definition_key: row.try_get("definition_key")?,
            activity_id: row.try_get("activity_id")?,
            is_active: row.try_get("is_active")?,
            is_concurrent: row.try_get("is_concurrent")?,
            is_scope: row.try_get("is_scope")?,
            is_suspended: row.try_get("is_suspended")?,
            waiting_signal: row.try_get("waiting_signal")?,
            tenant_id: row.try_get("tenant_id")?,
            revision: row.try_get("revision")?,
        })
    }

    fn into_entity(self) -> Result<ExecutionEntity, StorageError> {
        Ok(ExecutionEntity {
            id: parse_uuid(&self.id)?,
            process_instance_id: parse_uuid(&self.process_instance_id)?,
            parent_id: self.parent_id.as_deref().map(parse_uuid).transpose()?,
            definition_key: self.definition_key,
            activity_id: self.activity_id,
            is_active: self.is_active,
            is_concurrent: self.is_concurrent,
            is_scope: self.is_scope,
            is_suspended: self.is_suspended,
            waiting_signal: self.waiting_signal,
            tenant_id: self.tenant_id,
            revision: self.revision,
        })
    }
}

struct JobRow {
    id: String,
    kind: String,
    due_date: String,
    execution_id: String,
    payload: String,
    retries: i64,
    failures: i64,
    lock_owner: Option<String>,
    lock_expiry: Option<String>,
    failure_reason: Option<String>,
    tenant_id: Option<String>,
    revision: i64,
}

impl JobRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            kind: row.try_get("kind")?,
            due_date: row.try_get("due_date")?,
            execution_id: row.try_get("execution_id")?,
            payload: row.try_get("payload")?,
            retries: row.try_get("retries")?,
            failures: row.try_get("failures")?,
            lock_owner: row.try_get("lock_owner")?,
            lock_expiry: row.try_get("lock_expiry")?,
            failure_reason: row.try_get("failure_reason")?,
            tenant_id: row.try_get("tenant_id")?,
            revision: row.try_get("revision")?,
        })
    }

    fn into_entity(self) -> Result<JobEntity, StorageError> {
        Ok(JobEntity {
            id: parse_uuid(&self.id)?,
            kind: parse_job_kind(&self.kind)?,
            due_date: parse_datetime(&self.due_date)?,
            execution_id: parse_uuid(&self.execution_id)?,
            payload: serde_json::from_str(&self.payload)
                .map_err(|e| StorageError::Corrupt(format!("invalid job payload: {e}")))?,
            retries: self.retries as u32,
            failures: self.failures as u32,
            lock_owner: self.lock_owner,
            lock_expiry: self.lock_expiry.as_deref().map(parse_datetime).transpose()?,
            failure_reason: self.failure_reason,
            tenant_id: self.tenant_id,
            revision: self.revision,
        })
    }
}

struct VariableRow {
    id: String,
    execution_id: String,
    name: String,
    value: String,
    revision: i64,
}

impl VariableRow {
    fn from_row(row: &SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            id: row.try_get("id")?,
            execution_id: row.try_get("execution_id")?,
            name: row.try_get("name")?,
            value: row.try_get("value")?,
            revision: row.try_get("revision")?,
        })
    }

    fn into_entity(self) -> Result<VariableEntity, StorageError> {
        Ok(VariableEntity {
            id: parse_uuid(&self.id)?,
            execution_id: parse_uuid(&self.execution_id)?,
            name: self.name,
            value: serde_json::from_str(&self.value)
                .map_err(|e| StorageError::Corrupt(format!("invalid variable value: {e}")))?,
            revision: self.revision,
        })
    }
}

fn row_to_entity(kind: EntityKind, row: &SqliteRow) -> Result<StoredEntity, StorageError> {
    match kind {
        EntityKind::Execution => Ok(ExecutionRow::from_row(row)
            .map_err(backend_err)?
            .into_entity()?
            .into()),
        EntityKind::Job => Ok(JobRow::from_row(row)
            .map_err(backend_err)?
            .into_entity()?
            .into()),
        EntityKind::Variable => Ok(VariableRow::from_row(row)
            .map_err(backend_err)?
            .into_entity()?
            .into()),
    }
}

// ---------------------------------------------------------------------------
// Write statements
// ---------------------------------------------------------------------------

fn insert_query(entity: &StoredEntity) -> sqlx::query::Query<'_, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'_>> {
    match entity {
        StoredEntity::Execution(e) => sqlx::query(
            r#"INSERT INTO executions
               (id, process_instance_id, parent_id, definition_key, activity_id,
                is_active, is_concurrent, is_scope, is_suspended, waiting_signal,
                tenant_id, revision)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(e.id.to_string())
        .bind(e.process_instance_id.to_string())
        .bind(e.parent_id.map(|p| p.to_string()))
        .bind(&e.definition_key)
        .bind(&e.activity_id)
        .bind(e.is_active)
        .bind(e.is_concurrent)
        .bind(e.is_scope)
        .bind(e.is_suspended)
        .bind(&e.waiting_signal)
        .bind(&e.tenant_id)
        .bind(e.revision),
        StoredEntity::Job(j) => sqlx::query(
            r#"INSERT INTO jobs
               (id, kind, due_date, execution_id, payload, retries, failures,
                lock_owner, lock_expiry, failure_reason, tenant_id, revision)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(j.id.to_string())
        .bind(job_kind_str(j.kind))
        .bind(format_datetime(&j.due_date))
        .bind(j.execution_id.to_string())
        .bind(j.payload.to_string())
        .bind(j.retries as i64)
        .bind(j.failures as i64)
        .bind(&j.lock_owner)
        .bind(j.lock_expiry.as_ref().map(format_datetime))
        .bind(&j.failure_reason)
        .bind(&j.tenant_id)
        .bind(j.revision),
        StoredEntity::Variable(v) => sqlx::query(
            r#"INSERT INTO variables (id, execution_id, name, value, revision)
               VALUES (?, ?, ?, ?, ?)"#,
        )
        .bind(v.id.to_string())
        .bind(v.execution_id.to_string())
        .bind(&v.name)
        .bind(v.value.to_string())
        .bind(v.revision),
    }
}

fn update_query(
    entity: &StoredEntity,
    expected_revision: i64,
) -> sqlx::query::Query<'_, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'_>> {
    match entity {
        StoredEntity::Execution(e) => sqlx::query(
            r#"UPDATE executions SET
                 process_instance_id = ?, parent_id = ?, definition_key = ?,
                 activity_id = ?, is_active = ?, is_concurrent = ?, is_scope = ?,
                 is_suspended = ?, waiting_signal = ?, tenant_id = ?, revision = ?
               WHERE id = ? AND revision = ?"#,
        )
        .bind(e.process_instance_id.to_string())
        .bind(e.parent_id.map(|p| p.to_string()))
        .bind(&e.definition_key)
        .bind(&e.activity_id)
        .bind(e.is_active)
        .bind(e.is_concurrent)
        .bind(e.is_scope)
        .bind(e.is_suspended)
        .bind(&e.waiting_signal)
        .bind(&e.tenant_id)
        .bind(e.revision)
        .bind(e.id.to_string())
        .bind(expected_revision),
        StoredEntity::Job(j) => sqlx::query(
            r#"UPDATE jobs SET
                 kind = ?, due_date = ?, execution_id = ?, payload = ?, retries = ?,
                 failures = ?, lock_owner = ?, lock_expiry = ?, failure_reason = ?,
                 tenant_id = ?, revision = ?
               WHERE id = ? AND revision = ?"#,
        )
        .bind(job_kind_str(j.kind))
        .bind(format_datetime(&j.due_date))
        .bind(j.execution_id.to_string())
        .bind(j.payload.to_string())
        .bind(j.retries as i64)
        .bind(j.failures as i64)
        .bind(&j.lock_owner)
        .bind(j.lock_expiry.as_ref().map(format_datetime))
        .bind(&j.failure_reason)
        .bind(&j.tenant_id)
        .bind(j.revision)
        .bind(j.id.to_string())
        .bind(expected_revision),
        StoredEntity::Variable(v) => sqlx::query(
            r#"UPDATE variables SET execution_id = ?, name = ?, value = ?, revision = ?
               WHERE id = ? AND revision = ?"#,
        )
        .bind(v.execution_id.to_string())
        .bind(&v.name)
        .bind(v.value.to_string())
        .bind(v.revision)
        .bind(v.id.to_string())
        .bind(expected_revision),
    }
}

fn table_name(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::Execution => "executions",
        EntityKind::Job => "jobs",
        EntityKind::Variable => "variables",
    }
}

// ---------------------------------------------------------------------------
// StorageBackend impl
// ---------------------------------------------------------------------------

impl StorageBackend for SqliteBackend {
    async fn select_by_id(
        &self,
        kind: EntityKind,
        id: Uuid,
    ) -> Result<Option<StoredEntity>, StorageError> {
        let sql = format!("SELECT * FROM {} WHERE id = ?", table_name(kind));
        let row = sqlx::query(&sql)
            .bind(id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(backend_err)?;
        row.as_ref().map(|r| row_to_entity(kind, r)).transpose()
    }

    async fn select_matching(
        &self,
        selector: &Selector,
    ) -> Result<Vec<StoredEntity>, StorageError> {
        let rows = match selector {
            Selector::ChildrenOf { parent_id } => {
                sqlx::query("SELECT * FROM executions WHERE parent_id = ? ORDER BY id")
                    .bind(parent_id.to_string())
                    .fetch_all(&self.pool.reader)
                    .await
            }
            Selector::ExecutionsOfInstance {
                process_instance_id,
            } => {
                sqlx::query("SELECT * FROM executions WHERE process_instance_id = ? ORDER BY id")
                    .bind(process_instance_id.to_string())
                    .fetch_all(&self.pool.reader)
                    .await
            }
            Selector::WaitingOnSignal { signal_name } => {
                sqlx::query(
                    r#"SELECT * FROM executions
                       WHERE waiting_signal = ? AND is_active = 1 AND is_suspended = 0
                       ORDER BY id"#,
                )
                .bind(signal_name)
                .fetch_all(&self.pool.reader)
                .await
            }
            Selector::VariablesOf { execution_id } => {
                sqlx::query("SELECT * FROM variables WHERE execution_id = ? ORDER BY id")
                    .bind(execution_id.to_string())
                    .fetch_all(&self.pool.reader)
                    .await
            }
            Selector::VariableByName { execution_id, name } => {
                sqlx::query("SELECT * FROM variables WHERE execution_id = ? AND name = ?")
                    .bind(execution_id.to_string())
                    .bind(name)
                    .fetch_all(&self.pool.reader)
                    .await
            }
            Selector::JobsOfExecution { execution_id } => {
                sqlx::query("SELECT * FROM jobs WHERE execution_id = ? ORDER BY id")
                    .bind(execution_id.to_string())
                    .fetch_all(&self.pool.reader)
                    .await
            }
            Selector::AcquirableJobs {
                tenant_id,
                now,
                limit,
            } => {
                let now = format_datetime(now);
                sqlx::query(
                    r#"SELECT * FROM jobs
                       WHERE retries > 0
                         AND tenant_id IS ?
                         AND due_date <= ?
                         AND (lock_expiry IS NULL OR lock_expiry <= ?)
                       ORDER BY due_date, id
                       LIMIT ?"#,
                )
                .bind(tenant_id.as_deref())
                .bind(&now)
                .bind(&now)
                .bind(*limit as i64)
                .fetch_all(&self.pool.reader)
                .await
            }
        }
        .map_err(backend_err)?;

        let kind = selector.kind();
        rows.iter().map(|r| row_to_entity(kind, r)).collect()
    }

    async fn apply(&self, batch: &[WriteOp]) -> Result<(), StorageError> {
        tracing::trace!(writes = batch.len(), "applying write batch");
        let mut tx = self.pool.writer.begin().await.map_err(backend_err)?;

        for op in batch {
            match op {
                WriteOp::Insert(entity) => {
                    insert_query(entity)
                        .execute(&mut *tx)
                        .await
                        .map_err(backend_err)?;
                }
                WriteOp::Update {
                    entity,
                    expected_revision,
                } => {
                    let result = update_query(entity, *expected_revision)
                        .execute(&mut *tx)
                        .await
                        .map_err(backend_err)?;
                    if result.rows_affected() == 0 {
                        // Dropping the transaction rolls the batch back.
                        return Err(StorageError::Conflict {
                            kind: entity.kind(),
                            id: entity.id(),
                        });
                    }
                }
                WriteOp::Delete {
                    kind,
                    id,
                    expected_revision,
                } => {
                    let sql = format!(
                        "DELETE FROM {} WHERE id = ? AND revision = ?",
                        table_name(*kind)
                    );
                    let result = sqlx::query(&sql)
                        .bind(id.to_string())
                        .bind(expected_revision)
                        .execute(&mut *tx)
                        .await
                        .map_err(backend_err)?;
                    if result.rows_affected() == 0 {
                        // Gone entirely is fine; present at another revision
                        // means we lost the race.
                        let sql = format!("SELECT 1 FROM {} WHERE id = ?", table_name(*kind));
                        let exists = sqlx::query(&sql)
                            .bind(id.to_string())
                            .fetch_optional(&mut *tx)
                            .await
                            .map_err(backend_err)?;
                        if exists.is_some() {
                            return Err(StorageError::Conflict { kind: *kind, id: *id });
                        }
                    }
                }
            }
        }

        tx.commit().await.map_err(backend_err)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;

    use chrono::Duration;
    use serde_json::json;
    use tempfile::TempDir;

    use windlass_core::engine::ProcessEngine;
    use windlass_types::config::EngineConfig;
    use windlass_types::process::{ActivityKind, EventKind, ProcessDefinitionBuilder};

    async fn backend() -> (TempDir, SqliteBackend) {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("test.db").display());
        let pool = DatabasePool::new(&url).await.unwrap();
        (dir, SqliteBackend::new(pool))
    }

    fn job(due_offset_secs: i64, tenant: Option<&str>) -> JobEntity {
        let mut j = JobEntity::new(
            JobKind::Timer,
            Utc::now() + Duration::seconds(due_offset_secs),
            Uuid::now_v7(),
            json!({ "activity_id": "pause" }),
            3,
            tenant.map(str::to_string),
        );
        j.revision = 1;
        j
    }

    #[tokio::test]
    async fn entities_roundtrip_through_sqlite() {
        let (_dir, backend) = backend().await;

        let mut exec = ExecutionEntity::new_root("order-fulfilment", Some("acme".to_string()));
        exec.activity_id = Some("await-payment".to_string());
        exec.waiting_signal = Some("payment-received".to_string());
        exec.revision = 1;
        let job = job(60, Some("acme"));
        let mut var = VariableEntity::new(exec.id, "order", json!({"id": 7, "lines": [1, 2]}));
        var.revision = 1;

        backend
            .apply(&[
                WriteOp::Insert(exec.clone().into()),
                WriteOp::Insert(job.clone().into()),
                WriteOp::Insert(var.clone().into()),
            ])
            .await
            .unwrap();

        let stored_exec = backend
            .select_by_id(EntityKind::Execution, exec.id)
            .await
            .unwrap()
            .and_then(StoredEntity::into_execution)
            .unwrap();
        assert_eq!(stored_exec, exec);

        let stored_job = backend
            .select_by_id(EntityKind::Job, job.id)
            .await
            .unwrap()
            .and_then(StoredEntity::into_job)
            .unwrap();
        assert_eq!(stored_job.kind, job.kind);
        assert_eq!(stored_job.payload, job.payload);
        // Datetimes survive at microsecond precision.
        assert_eq!(
            stored_job.due_date.timestamp_micros(),
            job.due_date.timestamp_micros()
        );

        let stored_var = backend
            .select_by_id(EntityKind::Variable, var.id)
            .await
            .unwrap()
            .and_then(StoredEntity::into_variable)
            .unwrap();
        assert_eq!(stored_var, var);
    }

    #[tokio::test]
    async fn stale_update_rolls_back_whole_batch() {
        let (_dir, backend) = backend().await;
        let mut exec = ExecutionEntity::new_root("p", None);
        exec.revision = 1;
        backend
            .apply(&[WriteOp::Insert(exec.clone().into())])
            .await
            .unwrap();

        let mut moved = exec.clone();
        moved.activity_id = Some("next".to_string());
        moved.revision = 2;
        let mut other = ExecutionEntity::new_root("q", None);
        other.revision = 1;

        let err = backend
            .apply(&[
                WriteOp::Insert(other.clone().into()),
                WriteOp::Update {
                    entity: moved.into(),
                    expected_revision: 99,
                },
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict { .. }));

        // The insert in the same batch did not survive the rollback.
        assert!(
            backend
                .select_by_id(EntityKind::Execution, other.id)
                .await
                .unwrap()
                .is_none()
        );
        // The stored row is untouched.
        let stored = backend
            .select_by_id(EntityKind::Execution, exec.id)
            .await
            .unwrap()
            .and_then(StoredEntity::into_execution)
            .unwrap();
        assert_eq!(stored.activity_id, None);
    }

    #[tokio::test]
    async fn delete_semantics_match_the_engine_contract() {
        let (_dir, backend) = backend().await;
        let seeded = job(0, None);
        backend
            .apply(&[WriteOp::Insert(seeded.clone().into())])
            .await
            .unwrap();

        // Wrong revision: conflict.
        let err = backend
            .apply(&[WriteOp::Delete {
                kind: EntityKind::Job,
                id: seeded.id,
                expected_revision: 5,
            }])
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Conflict { .. }));

        // Right revision: gone.
        backend
            .apply(&[WriteOp::Delete {
                kind: EntityKind::Job,
                id: seeded.id,
                expected_revision: 1,
            }])
            .await
            .unwrap();
        assert!(
            backend
                .select_by_id(EntityKind::Job, seeded.id)
                .await
                .unwrap()
                .is_none()
        );

        // Already gone: no-op.
        backend
            .apply(&[WriteOp::Delete {
                kind: EntityKind::Job,
                id: seeded.id,
                expected_revision: 1,
            }])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn acquirable_jobs_query_filters_and_orders() {
        let (_dir, backend) = backend().await;

        let due_late = job(-10, None);
        let due_early = job(-60, None);
        let not_due = job(600, None);
        let other_tenant = job(-60, Some("acme"));
        let mut locked = job(-60, None);
        locked.lock_owner = Some("node-a".to_string());
        locked.lock_expiry = Some(Utc::now() + Duration::minutes(5));
        let mut exhausted = job(-60, None);
        exhausted.retries = 0;

        for j in [&due_late, &due_early, &not_due, &other_tenant, &locked, &exhausted] {
            backend
                .apply(&[WriteOp::Insert(j.clone().into())])
                .await
                .unwrap();
        }

        let matches = backend
            .select_matching(&Selector::AcquirableJobs {
                tenant_id: None,
                now: Utc::now(),
                limit: 10,
            })
            .await
            .unwrap();
        let ids: Vec<Uuid> = matches.iter().map(|e| e.id()).collect();
        assert_eq!(ids, vec![due_early.id, due_late.id]);

        let acme = backend
            .select_matching(&Selector::AcquirableJobs {
                tenant_id: Some("acme".to_string()),
                now: Utc::now(),
                limit: 10,
            })
            .await
            .unwrap();
        assert_eq!(acme.len(), 1);
        assert_eq!(acme[0].id(), other_tenant.id);

        // An expired lease makes the job acquirable again.
        let mut released = locked.clone();
        released.lock_expiry = Some(Utc::now() - Duration::minutes(1));
        released.revision = 2;
        backend
            .apply(&[WriteOp::Update {
                entity: released.into(),
                expected_revision: 1,
            }])
            .await
            .unwrap();
        let matches = backend
            .select_matching(&Selector::AcquirableJobs {
                tenant_id: None,
                now: Utc::now(),
                limit: 10,
            })
            .await
            .unwrap();
        assert_eq!(matches.len(), 3);
    }

    #[tokio::test]
    async fn waiting_on_signal_excludes_suspended_and_inactive() {
        let (_dir, backend) = backend().await;

        let mut waiting = ExecutionEntity::new_root("p", None);
        waiting.waiting_signal = Some("go".to_string());
        waiting.revision = 1;
        let mut suspended = ExecutionEntity::new_root("p", None);
        suspended.waiting_signal = Some("go".to_string());
        suspended.is_suspended = true;
        suspended.revision = 1;
        let mut inactive = ExecutionEntity::new_root("p", None);
        inactive.waiting_signal = Some("go".to_string());
        inactive.is_active = false;
        inactive.revision = 1;

        for e in [&waiting, &suspended, &inactive] {
            backend
                .apply(&[WriteOp::Insert(e.clone().into())])
                .await
                .unwrap();
        }

        let matches = backend
            .select_matching(&Selector::WaitingOnSignal {
                signal_name: "go".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].id(), waiting.id);
    }

    #[tokio::test]
    async fn engine_runs_timer_process_over_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("engine.db").display());
        let pool = DatabasePool::new(&url).await.unwrap();
        let backend = Arc::new(SqliteBackend::new(pool.clone()));

        let def = ProcessDefinitionBuilder::new("p")
            .activity("pause", ActivityKind::Event {
                event: EventKind::Timer { delay_secs: 0 },
            })
            .activity("done", ActivityKind::End)
            .transition("t1", "pause", "done", None)
            .build();
        let mut config = EngineConfig::default();
        config.job_executor.poll_interval_secs = 1;
        let engine = ProcessEngine::builder(backend)
            .definition(def)
            .config(config)
            .build();

        engine
            .start_process("p", None, HashMap::new())
            .await
            .unwrap();
        engine.start_job_executor(None).await;

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(15);
        loop {
            let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM executions")
                .fetch_one(&pool.reader)
                .await
                .unwrap();
            if count == 0 {
                break;
            }
            assert!(
                std::time::Instant::now() < deadline,
                "timer instance did not complete over sqlite"
            );
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        engine.shutdown().await;

        let (jobs,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM jobs")
            .fetch_one(&pool.reader)
            .await
            .unwrap();
        assert_eq!(jobs, 0);
    }
}
