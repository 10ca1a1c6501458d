//! Process graph provider port.
//!
//! Graphs arrive pre-built (parsing and validation live outside the engine);
//! the interpreter resolves definitions by key through this trait.
//! `GraphRegistry` is the bundled in-memory implementation.

use std::sync::Arc;

use dashmap::DashMap;

use windlass_types::process::ProcessDefinition;

/// Resolves process definitions by key.
pub trait ProcessGraphProvider: Send + Sync {
    fn process_definition(&self, key: &str) -> Option<Arc<ProcessDefinition>>;
}

/// In-memory definition registry.
#[derive(Default)]
pub struct GraphRegistry {
    definitions: DashMap<String, Arc<ProcessDefinition>>,
}

impl GraphRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) a definition under its key.
    pub fn register(&self, definition: ProcessDefinition) {
        tracing::debug!(key = definition.key.as_str(), "registering process definition");
        self.definitions
            .insert(definition.key.clone(), Arc::new(definition));
    }

    pub fn keys(&self) -> Vec<String> {
        self.definitions.iter().map(|e| e.key().clone()).collect()
    }
}

impl ProcessGraphProvider for GraphRegistry {
    fn process_definition(&self, key: &str) -> Option<Arc<ProcessDefinition>> {
        self.definitions.get(key).map(|e| Arc::clone(e.value()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use windlass_types::process::{ActivityKind, ProcessDefinitionBuilder};

    #[test]
    fn registry_resolves_by_key() {
        let registry = GraphRegistry::new();
        let def = ProcessDefinitionBuilder::new("invoicing")
            .activity("done", ActivityKind::End)
            .build();
        registry.register(def);

        assert!(registry.process_definition("invoicing").is_some());
        assert!(registry.process_definition("missing").is_none());
        assert_eq!(registry.keys(), vec!["invoicing".to_string()]);
    }
}
