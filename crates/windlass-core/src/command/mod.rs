//! Transactional unit-of-work pipeline.
//!
//! Every engine operation is a [`Command`] executed through the
//! [`pipeline::CommandPipeline`], which wraps it in an interceptor chain:
//! diagnostic logging, bounded retry on concurrent-update conflicts, and
//! context lifecycle (open a [`context::CommandContext`], run, drain queued
//! interpreter operations, flush the entity session, fire on-commit hooks).
//!
//! Re-entrancy rule: code already holding a `CommandContext` invokes nested
//! commands directly with that context (`command.run(ctx)`), never through
//! the pipeline. One context, one flush, per logical operation.

pub mod context;
pub mod pipeline;

use windlass_types::config::EngineConfig;

use crate::error::EngineError;
use crate::storage::StorageBackend;
use context::CommandContext;

/// A unit of work against an open [`CommandContext`].
///
/// Commands must be re-runnable from scratch: the pipeline re-executes the
/// whole body after a concurrent-update conflict, so a command must not
/// perform side effects outside the context (no I/O to non-transactional
/// systems).
pub trait Command<S: StorageBackend>: Send + Sync {
    type Output: Send;

    /// Short name for log spans.
    fn name(&self) -> &'static str;

    /// Retry budget for concurrent-update conflicts. Commands that must not
    /// be retried (job claims) override this with zero.
    fn max_retries(&self, config: &EngineConfig) -> u32 {
        config.command_retries
    }

    fn run(
        &self,
        ctx: &mut CommandContext<S>,
    ) -> impl std::future::Future<Output = Result<Self::Output, EngineError>> + Send;
}
