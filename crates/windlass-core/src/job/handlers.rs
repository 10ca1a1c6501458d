//! Per-kind job handlers.
//!
//! A handler runs inside the claimed-job unit of work: everything it does
//! through the context commits together with the job's consumption (or
//! deferral), or not at all. The built-in handlers bridge back into the
//! interpreter; the registry stays open so embedders can add job kinds of
//! their own behind a custom storage schema.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;

use windlass_types::entity::{JobEntity, JobKind};

use crate::command::context::CommandContext;
use crate::error::EngineError;
use crate::interpreter::ops;
use crate::job::JobOutcome;
use crate::storage::StorageBackend;

/// Executes one claimed job inside its unit of work.
///
/// Returning [`JobOutcome::Deferred`] keeps the job row alive with its
/// retry budget untouched; an `Err` counts against the budget.
pub trait JobHandler<S: StorageBackend>: Send + Sync {
    fn execute<'a>(
        &'a self,
        job: &'a JobEntity,
        ctx: &'a mut CommandContext<S>,
    ) -> BoxFuture<'a, Result<JobOutcome, EngineError>>;
}

/// JobKind -> handler table.
pub struct JobHandlerRegistry<S: StorageBackend> {
    handlers: HashMap<JobKind, Arc<dyn JobHandler<S>>>,
}

impl<S: StorageBackend> Default for JobHandlerRegistry<S> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<S: StorageBackend> JobHandlerRegistry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in timer and async-continuation handlers.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(JobKind::Timer, Arc::new(TimerFiredHandler));
        registry.register(JobKind::AsyncContinuation, Arc::new(ContinuationHandler));
        registry
    }

    pub fn register(&mut self, kind: JobKind, handler: Arc<dyn JobHandler<S>>) {
        self.handlers.insert(kind, handler);
    }

    pub fn resolve(&self, kind: JobKind) -> Result<Arc<dyn JobHandler<S>>, EngineError> {
        self.handlers
            .get(&kind)
            .cloned()
            .ok_or_else(|| EngineError::UnknownHandler(kind.to_string()))
    }
}

/// The event activity a job was persisted against, read from its payload.
fn payload_activity(job: &JobEntity) -> Result<&str, EngineError> {
    job.payload
        .get("activity_id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            EngineError::IllegalState(format!("job {} payload has no activity_id", job.id))
        })
}

/// Fires a due timer: the parked execution leaves its timer event activity.
pub struct TimerFiredHandler;

impl<S: StorageBackend> JobHandler<S> for TimerFiredHandler {
    fn execute<'a>(
        &'a self,
        job: &'a JobEntity,
        ctx: &'a mut CommandContext<S>,
    ) -> BoxFuture<'a, Result<JobOutcome, EngineError>> {
        Box::pin(async move {
            let activity = payload_activity(job)?;
            ops::fire_timer(ctx, job.execution_id, activity).await
        })
    }
}

/// Runs an asynchronously-parked task on the worker and moves the execution
/// on.
pub struct ContinuationHandler;

impl<S: StorageBackend> JobHandler<S> for ContinuationHandler {
    fn execute<'a>(
        &'a self,
        job: &'a JobEntity,
        ctx: &'a mut CommandContext<S>,
    ) -> BoxFuture<'a, Result<JobOutcome, EngineError>> {
        Box::pin(async move {
            let activity = payload_activity(job)?;
            ops::resume_async_task(ctx, job.execution_id, activity).await
        })
    }
}
