//! Delegate handler registry: user-supplied business logic behind task
//! activities.
//!
//! Handlers are registered under string keys and resolved when a task
//! activity executes; an unregistered key is an explicit error, never a
//! runtime lookup of external code.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use thiserror::Error;

use windlass_types::entity::ExecutionEntity;

use crate::command::context::CommandContext;
use crate::error::EngineError;
use crate::storage::StorageBackend;

/// A business error raised by a delegate. The interpreter routes it to the
/// activity's error boundary when one is declared, otherwise the whole unit
/// of work rolls back.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct DelegateError(pub String);

impl From<String> for DelegateError {
    fn from(message: String) -> Self {
        DelegateError(message)
    }
}

impl From<&str> for DelegateError {
    fn from(message: &str) -> Self {
        DelegateError(message.to_string())
    }
}

/// User-supplied behavior invoked when a task activity executes.
///
/// Implementations must confine their side effects to the context: the
/// pipeline re-runs the whole unit of work after an optimistic-lock
/// conflict, so anything written outside the context would be replayed.
pub trait DelegateHandler<S: StorageBackend>: Send + Sync {
    fn invoke<'a>(
        &'a self,
        execution: &'a ExecutionEntity,
        ctx: &'a mut CommandContext<S>,
    ) -> BoxFuture<'a, Result<(), DelegateError>>;
}

/// String key -> handler table, resolved at engine build time.
pub struct DelegateRegistry<S: StorageBackend> {
    handlers: HashMap<String, Arc<dyn DelegateHandler<S>>>,
}

impl<S: StorageBackend> Default for DelegateRegistry<S> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<S: StorageBackend> DelegateRegistry<S> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, key: impl Into<String>, handler: Arc<dyn DelegateHandler<S>>) {
        self.handlers.insert(key.into(), handler);
    }

    pub fn resolve(&self, key: &str) -> Result<Arc<dyn DelegateHandler<S>>, EngineError> {
        self.handlers
            .get(key)
            .cloned()
            .ok_or_else(|| EngineError::UnknownHandler(key.to_string()))
    }

    pub fn keys(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}
