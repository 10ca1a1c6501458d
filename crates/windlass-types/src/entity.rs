//! Persisted entity model: executions, jobs, and variable instances.
//!
//! Every row type carries a `revision` counter used for optimistic locking.
//! Cross-process coordination happens entirely through these counters: an
//! update or delete names the revision it read, and the storage backend
//! rejects the write if the stored revision no longer matches.
//!
//! `StoredEntity` is the closed union the entity session and storage port
//! traffic in; `Selector` is the closed query language both the backends and
//! the in-memory cache interpret.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// EntityKind
// ---------------------------------------------------------------------------

/// Discriminator for the persisted entity families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Execution,
    Job,
    Variable,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EntityKind::Execution => "execution",
            EntityKind::Job => "job",
            EntityKind::Variable => "variable",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ExecutionEntity
// ---------------------------------------------------------------------------

/// A single path of control through a running process instance.
///
/// Executions form a tree: the root execution's own id is the process
/// instance id, children reference their parent. Deleting a parent cascades
/// to its children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEntity {
    /// UUIDv7, assigned at creation.
    pub id: Uuid,
    /// Root execution's id. For the root itself this equals `id`.
    pub process_instance_id: Uuid,
    /// Parent execution. `None` exactly for the root.
    pub parent_id: Option<Uuid>,
    /// Key of the process definition this execution runs.
    pub definition_key: String,
    /// The activity the execution currently sits at, if any.
    pub activity_id: Option<String>,
    /// False once the execution has ended or parked at a join.
    pub is_active: bool,
    /// True for a branch created by a parallel fork.
    pub is_concurrent: bool,
    /// True if this execution owns local variables and is a join point
    /// for concurrent children it spawned.
    pub is_scope: bool,
    /// Suspended executions reject signals and variable writes.
    pub is_suspended: bool,
    /// Signal name this execution is waiting on, if parked at a signal
    /// event activity. Cleared when the execution moves on.
    pub waiting_signal: Option<String>,
    /// Tenant this execution belongs to.
    pub tenant_id: Option<String>,
    /// Optimistic-lock revision.
    pub revision: i64,
}

impl ExecutionEntity {
    /// Create a root execution for a new process instance.
    pub fn new_root(definition_key: impl Into<String>, tenant_id: Option<String>) -> Self {
        let id = Uuid::now_v7();
        Self {
            id,
            process_instance_id: id,
            parent_id: None,
            definition_key: definition_key.into(),
            activity_id: None,
            is_active: true,
            is_concurrent: false,
            is_scope: true,
            is_suspended: false,
            waiting_signal: None,
            tenant_id,
            revision: 0,
        }
    }

    /// Create a child of `parent`. The child inherits the instance id,
    /// definition key, and tenant.
    pub fn new_child(parent: &ExecutionEntity, concurrent: bool, scope: bool) -> Self {
        Self {
            id: Uuid::now_v7(),
            process_instance_id: parent.process_instance_id,
            parent_id: Some(parent.id),
            definition_key: parent.definition_key.clone(),
            activity_id: None,
            is_active: true,
            is_concurrent: concurrent,
            is_scope: scope,
            is_suspended: false,
            waiting_signal: None,
            tenant_id: parent.tenant_id.clone(),
            revision: 0,
        }
    }

    /// Whether this is the root execution of its process instance.
    pub fn is_root(&self) -> bool {
        self.parent_id.is_none()
    }
}

// ---------------------------------------------------------------------------
// JobEntity
// ---------------------------------------------------------------------------

/// The kind of deferred work a job represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Fire an event activity once its due date passes.
    Timer,
    /// Continue an execution at its current activity on a worker thread.
    AsyncContinuation,
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobKind::Timer => "timer",
            JobKind::AsyncContinuation => "async_continuation",
        };
        f.write_str(s)
    }
}

/// A persisted unit of deferred work.
///
/// A job with a lock owner and a lock expiry in the future is claimed and
/// must not be acquired by another worker. A job whose `retries` has reached
/// zero after a failure is permanently failed: it stays in the table for
/// operator inspection and is never acquired again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEntity {
    pub id: Uuid,
    pub kind: JobKind,
    /// Earliest point the job may run.
    pub due_date: DateTime<Utc>,
    /// Execution this job continues.
    pub execution_id: Uuid,
    /// Opaque payload interpreted by the handler for `kind`.
    pub payload: serde_json::Value,
    /// Remaining execution attempts. Zero means permanently failed.
    pub retries: u32,
    /// Failed attempts so far. Drives the backoff series independently of
    /// the job's initial retry budget.
    pub failures: u32,
    pub lock_owner: Option<String>,
    pub lock_expiry: Option<DateTime<Utc>>,
    /// Message of the failure that exhausted the retries, if any.
    pub failure_reason: Option<String>,
    pub tenant_id: Option<String>,
    /// Optimistic-lock revision.
    pub revision: i64,
}

impl JobEntity {
    /// Create a job due at `due_date` for `execution_id`.
    pub fn new(
        kind: JobKind,
        due_date: DateTime<Utc>,
        execution_id: Uuid,
        payload: serde_json::Value,
        retries: u32,
        tenant_id: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            kind,
            due_date,
            execution_id,
            payload,
            retries,
            failures: 0,
            lock_owner: None,
            lock_expiry: None,
            failure_reason: None,
            tenant_id,
            revision: 0,
        }
    }

    /// Whether the job may be claimed at `now` by an executor for `tenant_id`.
    pub fn is_acquirable(&self, tenant_id: Option<&str>, now: DateTime<Utc>) -> bool {
        if self.retries == 0 {
            return false;
        }
        if self.tenant_id.as_deref() != tenant_id {
            return false;
        }
        if self.due_date > now {
            return false;
        }
        match self.lock_expiry {
            Some(expiry) => expiry <= now,
            None => true,
        }
    }
}

// ---------------------------------------------------------------------------
// VariableEntity
// ---------------------------------------------------------------------------

/// A name/value pair owned by one execution.
///
/// `(execution_id, name)` is unique. Lookups that miss on an execution walk
/// up the parent chain; that chain-walk is interpreter logic, not storage
/// logic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableEntity {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub name: String,
    pub value: serde_json::Value,
    /// Optimistic-lock revision.
    pub revision: i64,
}

impl VariableEntity {
    pub fn new(execution_id: Uuid, name: impl Into<String>, value: serde_json::Value) -> Self {
        Self {
            id: Uuid::now_v7(),
            execution_id,
            name: name.into(),
            value,
            revision: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// StoredEntity
// ---------------------------------------------------------------------------

/// Closed union of every persisted entity family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoredEntity {
    Execution(ExecutionEntity),
    Job(JobEntity),
    Variable(VariableEntity),
}

impl StoredEntity {
    pub fn kind(&self) -> EntityKind {
        match self {
            StoredEntity::Execution(_) => EntityKind::Execution,
            StoredEntity::Job(_) => EntityKind::Job,
            StoredEntity::Variable(_) => EntityKind::Variable,
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            StoredEntity::Execution(e) => e.id,
            StoredEntity::Job(j) => j.id,
            StoredEntity::Variable(v) => v.id,
        }
    }

    pub fn revision(&self) -> i64 {
        match self {
            StoredEntity::Execution(e) => e.revision,
            StoredEntity::Job(j) => j.revision,
            StoredEntity::Variable(v) => v.revision,
        }
    }

    pub fn set_revision(&mut self, revision: i64) {
        match self {
            StoredEntity::Execution(e) => e.revision = revision,
            StoredEntity::Job(j) => j.revision = revision,
            StoredEntity::Variable(v) => v.revision = revision,
        }
    }

    pub fn as_execution(&self) -> Option<&ExecutionEntity> {
        match self {
            StoredEntity::Execution(e) => Some(e),
            _ => None,
        }
    }

    pub fn as_job(&self) -> Option<&JobEntity> {
        match self {
            StoredEntity::Job(j) => Some(j),
            _ => None,
        }
    }

    pub fn as_variable(&self) -> Option<&VariableEntity> {
        match self {
            StoredEntity::Variable(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_execution(self) -> Option<ExecutionEntity> {
        match self {
            StoredEntity::Execution(e) => Some(e),
            _ => None,
        }
    }

    pub fn into_job(self) -> Option<JobEntity> {
        match self {
            StoredEntity::Job(j) => Some(j),
            _ => None,
        }
    }

    pub fn into_variable(self) -> Option<VariableEntity> {
        match self {
            StoredEntity::Variable(v) => Some(v),
            _ => None,
        }
    }
}

impl From<ExecutionEntity> for StoredEntity {
    fn from(e: ExecutionEntity) -> Self {
        StoredEntity::Execution(e)
    }
}

impl From<JobEntity> for StoredEntity {
    fn from(j: JobEntity) -> Self {
        StoredEntity::Job(j)
    }
}

impl From<VariableEntity> for StoredEntity {
    fn from(v: VariableEntity) -> Self {
        StoredEntity::Variable(v)
    }
}

// ---------------------------------------------------------------------------
// Selector
// ---------------------------------------------------------------------------

/// Closed query language shared by the storage backends and the entity
/// session.
///
/// Backends translate selectors to native queries; the session evaluates
/// `matches` against its cached copies so that reads merge store rows with
/// uncommitted changes.
#[derive(Debug, Clone, PartialEq)]
pub enum Selector {
    /// Executions whose parent is `parent_id`.
    ChildrenOf { parent_id: Uuid },
    /// Every execution of a process instance, the root included.
    ExecutionsOfInstance { process_instance_id: Uuid },
    /// All variables owned by one execution.
    VariablesOf { execution_id: Uuid },
    /// The variable named `name` on one execution, if present.
    VariableByName { execution_id: Uuid, name: String },
    /// Jobs associated with one execution.
    JobsOfExecution { execution_id: Uuid },
    /// Jobs claimable at `now` by an executor for `tenant_id`, due-date
    /// ascending, at most `limit`.
    AcquirableJobs {
        tenant_id: Option<String>,
        now: DateTime<Utc>,
        limit: usize,
    },
    /// Active, unsuspended executions parked on the named signal.
    WaitingOnSignal { signal_name: String },
}

impl Selector {
    /// The entity family this selector ranges over.
    pub fn kind(&self) -> EntityKind {
        match self {
            Selector::ChildrenOf { .. }
            | Selector::ExecutionsOfInstance { .. }
            | Selector::WaitingOnSignal { .. } => EntityKind::Execution,
            Selector::VariablesOf { .. } | Selector::VariableByName { .. } => EntityKind::Variable,
            Selector::JobsOfExecution { .. } | Selector::AcquirableJobs { .. } => EntityKind::Job,
        }
    }

    /// Whether `entity` satisfies this selector, ignoring `limit`.
    pub fn matches(&self, entity: &StoredEntity) -> bool {
        match (self, entity) {
            (Selector::ChildrenOf { parent_id }, StoredEntity::Execution(e)) => {
                e.parent_id == Some(*parent_id)
            }
            (
                Selector::ExecutionsOfInstance {
                    process_instance_id,
                },
                StoredEntity::Execution(e),
            ) => e.process_instance_id == *process_instance_id,
            (Selector::WaitingOnSignal { signal_name }, StoredEntity::Execution(e)) => {
                e.is_active
                    && !e.is_suspended
                    && e.waiting_signal.as_deref() == Some(signal_name.as_str())
            }
            (Selector::VariablesOf { execution_id }, StoredEntity::Variable(v)) => {
                v.execution_id == *execution_id
            }
            (Selector::VariableByName { execution_id, name }, StoredEntity::Variable(v)) => {
                v.execution_id == *execution_id && v.name == *name
            }
            (Selector::JobsOfExecution { execution_id }, StoredEntity::Job(j)) => {
                j.execution_id == *execution_id
            }
            (
                Selector::AcquirableJobs {
                    tenant_id, now, ..
                },
                StoredEntity::Job(j),
            ) => j.is_acquirable(tenant_id.as_deref(), *now),
            _ => false,
        }
    }

    /// Result cap, if the selector carries one.
    pub fn limit(&self) -> Option<usize> {
        match self {
            Selector::AcquirableJobs { limit, .. } => Some(*limit),
            _ => None,
        }
    }

    /// Deterministic result ordering: due-date ascending for job acquisition,
    /// id order (UUIDv7 = creation order) everywhere else.
    pub fn sort(&self, results: &mut Vec<StoredEntity>) {
        match self {
            Selector::AcquirableJobs { .. } => {
                results.sort_by(|a, b| {
                    let da = a.as_job().map(|j| j.due_date);
                    let db = b.as_job().map(|j| j.due_date);
                    da.cmp(&db).then_with(|| a.id().cmp(&b.id()))
                });
            }
            _ => results.sort_by_key(|e| e.id()),
        }
    }
}

// ---------------------------------------------------------------------------
// WriteOp
// ---------------------------------------------------------------------------

/// One element of a flush batch.
///
/// `Update` and `Delete` name the revision the unit of work read; the backend
/// must reject the whole batch if any stored revision differs. The entity
/// inside `Update` already carries the bumped revision to persist.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    Insert(StoredEntity),
    Update {
        entity: StoredEntity,
        expected_revision: i64,
    },
    Delete {
        kind: EntityKind,
        id: Uuid,
        expected_revision: i64,
    },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
