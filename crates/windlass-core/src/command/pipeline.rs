//! Interceptor chain around every unit of work.
//!
//! Outermost to innermost: diagnostic logging -> bounded conflict retry ->
//! context lifecycle (open, run, drain interpreter operations, flush,
//! commit hooks). A failed unit of work flushes nothing: dropping the
//! context is the rollback.

use std::sync::Arc;

use tracing::Instrument;

use crate::command::Command;
use crate::command::context::{CommandContext, EngineServices};
use crate::error::EngineError;
use crate::interpreter;
use crate::storage::StorageBackend;

/// Executes commands through the interceptor chain.
pub struct CommandPipeline<S: StorageBackend> {
    backend: Arc<S>,
    services: Arc<EngineServices<S>>,
}

impl<S: StorageBackend> CommandPipeline<S> {
    pub fn new(backend: Arc<S>, services: Arc<EngineServices<S>>) -> Self {
        Self { backend, services }
    }

    pub fn services(&self) -> &Arc<EngineServices<S>> {
        &self.services
    }

    pub fn backend(&self) -> &Arc<S> {
        &self.backend
    }

    /// Execute one command as one (or, after conflicts, several) complete
    /// units of work.
    pub async fn execute<C: Command<S>>(&self, command: &C) -> Result<C::Output, EngineError> {
        let span = tracing::debug_span!("command", name = command.name());
        async {
            let started = std::time::Instant::now();

            let result = self.execute_with_retry(command).await;

            match &result {
                Ok(_) => tracing::debug!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "command completed"
                ),
                Err(e) => tracing::debug!(
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    error = %e,
                    "command failed"
                ),
            }
            result
        }
        .instrument(span)
        .await
    }

    /// Retry interceptor: concurrent-update conflicts re-run the whole
    /// command from scratch with a fresh context. Intermediate in-memory
    /// state is not replayable, so nothing is resumed.
    async fn execute_with_retry<C: Command<S>>(
        &self,
        command: &C,
    ) -> Result<C::Output, EngineError> {
        let max_retries = command.max_retries(&self.services.config);
        let mut attempt = 0;
        loop {
            match self.execute_in_context(command).await {
                Err(e) if e.is_retryable() && attempt < max_retries => {
                    attempt += 1;
                    tracing::warn!(
                        attempt,
                        max_retries,
                        error = %e,
                        "optimistic lock conflict, re-running command"
                    );
                }
                other => return other,
            }
        }
    }

    /// Context lifecycle interceptor: one context, one flush.
    async fn execute_in_context<C: Command<S>>(
        &self,
        command: &C,
    ) -> Result<C::Output, EngineError> {
        let mut ctx = CommandContext::new(Arc::clone(&self.backend), Arc::clone(&self.services));
        let output = command.run(&mut ctx).await?;
        interpreter::run_operations(&mut ctx).await?;
        ctx.commit().await?;
        Ok(output)
    }
}
