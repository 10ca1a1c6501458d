//! Engine error taxonomy.
//!
//! `ConcurrentUpdate` is the only retryable class: the command pipeline
//! re-runs the whole unit of work a bounded number of times before surfacing
//! it. Everything else propagates to the caller after rollback.

use thiserror::Error;
use uuid::Uuid;

use windlass_types::entity::EntityKind;
use windlass_types::error::StorageError;

use crate::expression::ExpressionError;

/// Errors raised by engine commands and the interpreter.
#[derive(Debug, Error)]
pub enum EngineError {
    /// An optimistic-lock revision check failed at flush time.
    #[error("concurrent update on {kind} {id}")]
    ConcurrentUpdate { kind: EntityKind, id: Uuid },

    /// A referenced entity does not exist. Never retried.
    #[error("{kind} {id} not found")]
    NotFound { kind: EntityKind, id: Uuid },

    /// No process definition registered under the key.
    #[error("unknown process definition '{0}'")]
    UnknownDefinition(String),

    /// The definition references an activity that is not in the graph.
    #[error("definition '{definition}' has no activity '{activity}'")]
    UnknownActivity {
        definition: String,
        activity: String,
    },

    /// The definition references a transition that is not in the graph.
    #[error("definition '{definition}' has no transition '{transition}'")]
    UnknownTransition {
        definition: String,
        transition: String,
    },

    /// No delegate handler registered under the key.
    #[error("no delegate handler registered for '{0}'")]
    UnknownHandler(String),

    /// A transition guard failed to evaluate.
    #[error("guard evaluation failed: {0}")]
    GuardEvaluation(#[from] ExpressionError),

    /// An explicitly taken transition's guard evaluated to false.
    #[error("guard rejected transition '{transition}'")]
    GuardRejected { transition: String },

    /// An activity has outgoing transitions but none was enabled.
    #[error("no outgoing transition enabled at activity '{activity}'")]
    NoTransitionEnabled { activity: String },

    /// A delegate handler raised a business error and no error boundary
    /// applied. The unit of work was rolled back in full.
    #[error("delegate failed at activity '{activity}': {message}")]
    Delegate { activity: String, message: String },

    /// The execution is suspended and rejects signals and writes.
    #[error("execution {execution_id} is suspended")]
    Suspended { execution_id: Uuid },

    /// Non-conflict storage failure.
    #[error(transparent)]
    Storage(StorageError),

    /// Internal invariant violation.
    #[error("illegal engine state: {0}")]
    IllegalState(String),
}

impl EngineError {
    /// Whether the command pipeline may re-run the unit of work.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::ConcurrentUpdate { .. })
    }
}

impl From<StorageError> for EngineError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Conflict { kind, id } => EngineError::ConcurrentUpdate { kind, id },
            StorageError::NotFound { kind, id } => EngineError::NotFound { kind, id },
            other => EngineError::Storage(other),
        }
    }
}
