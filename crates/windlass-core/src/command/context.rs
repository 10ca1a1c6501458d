//! Per-unit-of-work context and the shared engine services it closes over.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::Notify;

use windlass_types::config::EngineConfig;
use windlass_types::process::ProcessDefinition;

use crate::error::EngineError;
use crate::expression::ExpressionEvaluator;
use crate::graph::ProcessGraphProvider;
use crate::interpreter::AtomicOperation;
use crate::interpreter::behavior::DelegateRegistry;
use crate::job::handlers::JobHandlerRegistry;
use crate::session::EntitySession;
use crate::storage::StorageBackend;

// ---------------------------------------------------------------------------
// EngineServices
// ---------------------------------------------------------------------------

/// Immutable service wiring shared by every context: the process graph
/// provider, the expression evaluator, delegate and job handler registries,
/// configuration, and the job-executor wakeup handle.
pub struct EngineServices<S: StorageBackend> {
    pub config: EngineConfig,
    pub graphs: Arc<dyn ProcessGraphProvider>,
    pub evaluator: Arc<dyn ExpressionEvaluator>,
    pub delegates: DelegateRegistry<S>,
    pub job_handlers: JobHandlerRegistry<S>,
    /// Notified after commit whenever a unit of work inserted a job, so
    /// acquisition loops pick it up without waiting out the poll interval.
    pub job_wakeup: Arc<Notify>,
}

// ---------------------------------------------------------------------------
// CommandContext
// ---------------------------------------------------------------------------

/// Request-scoped state of one unit of work: the entity session, the queue
/// of pending interpreter operations, and deferred post-commit callbacks.
pub struct CommandContext<S: StorageBackend> {
    session: EntitySession<S>,
    services: Arc<EngineServices<S>>,
    operations: VecDeque<AtomicOperation>,
    commit_hooks: Vec<Box<dyn FnOnce() + Send>>,
}

impl<S: StorageBackend> CommandContext<S> {
    pub fn new(backend: Arc<S>, services: Arc<EngineServices<S>>) -> Self {
        Self {
            session: EntitySession::new(backend),
            services,
            operations: VecDeque::new(),
            commit_hooks: Vec::new(),
        }
    }

    pub fn session(&mut self) -> &mut EntitySession<S> {
        &mut self.session
    }

    pub fn services(&self) -> &Arc<EngineServices<S>> {
        &self.services
    }

    pub fn config(&self) -> &EngineConfig {
        &self.services.config
    }

    /// Resolve a process definition or fail with `UnknownDefinition`.
    pub fn definition(&self, key: &str) -> Result<Arc<ProcessDefinition>, EngineError> {
        self.services
            .graphs
            .process_definition(key)
            .ok_or_else(|| EngineError::UnknownDefinition(key.to_string()))
    }

    /// Queue an interpreter operation for the drain loop.
    pub fn enqueue(&mut self, operation: AtomicOperation) {
        self.operations.push_back(operation);
    }

    pub(crate) fn pop_operation(&mut self) -> Option<AtomicOperation> {
        self.operations.pop_front()
    }

    /// Defer a side effect until after durable commit.
    pub fn on_commit(&mut self, hook: impl FnOnce() + Send + 'static) {
        self.commit_hooks.push(Box::new(hook));
    }

    /// Schedule a post-commit wakeup of the job acquisition loops. Called by
    /// interpreter code that inserts a job row.
    pub fn notify_jobs_on_commit(&mut self) {
        let wakeup = Arc::clone(&self.services.job_wakeup);
        self.on_commit(move || wakeup.notify_waiters());
    }

    /// Flush the session, then fire commit hooks. Pipeline-internal.
    pub(crate) async fn commit(&mut self) -> Result<(), EngineError> {
        self.session.flush().await?;
        for hook in self.commit_hooks.drain(..) {
            hook();
        }
        Ok(())
    }
}
