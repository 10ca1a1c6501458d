//! Public engine facade.
//!
//! Wires the service graph (definitions, evaluator, handler registries),
//! owns the command pipeline, and exposes process operations as plain async
//! methods. Job execution is opt-in per tenant via the embedded executor
//! manager.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Notify;
use uuid::Uuid;

use windlass_types::config::EngineConfig;
use windlass_types::entity::JobKind;
use windlass_types::process::ProcessDefinition;

use crate::command::context::EngineServices;
use crate::command::pipeline::CommandPipeline;
use crate::commands::{
    ActivateInstanceCommand, DeleteInstanceCommand, GetVariableCommand, SetVariableCommand,
    SignalByNameCommand, SignalCommand, StartProcessCommand, SuspendInstanceCommand,
};
use crate::error::EngineError;
use crate::expression::{ExpressionEvaluator, JexlEvaluator};
use crate::graph::GraphRegistry;
use crate::interpreter::behavior::{DelegateHandler, DelegateRegistry};
use crate::job::handlers::{JobHandler, JobHandlerRegistry};
use crate::job::tenant::TenantExecutorManager;
use crate::storage::StorageBackend;

// ---------------------------------------------------------------------------
// ProcessEngineBuilder
// ---------------------------------------------------------------------------

/// Assembles a [`ProcessEngine`] over a storage backend.
pub struct ProcessEngineBuilder<S: StorageBackend> {
    backend: Arc<S>,
    config: EngineConfig,
    graphs: GraphRegistry,
    evaluator: Arc<dyn ExpressionEvaluator>,
    delegates: DelegateRegistry<S>,
    job_handlers: JobHandlerRegistry<S>,
}

impl<S: StorageBackend> ProcessEngineBuilder<S> {
    pub fn new(backend: Arc<S>) -> Self {
        Self {
            backend,
            config: EngineConfig::default(),
            graphs: GraphRegistry::new(),
            evaluator: Arc::new(JexlEvaluator::new()),
            delegates: DelegateRegistry::new(),
            job_handlers: JobHandlerRegistry::with_builtins(),
        }
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a process definition under its key.
    pub fn definition(self, definition: ProcessDefinition) -> Self {
        self.graphs.register(definition);
        self
    }

    /// Register a delegate handler for task activities.
    pub fn delegate(mut self, key: impl Into<String>, handler: Arc<dyn DelegateHandler<S>>) -> Self {
        self.delegates.register(key, handler);
        self
    }

    /// Override or extend a job handler.
    pub fn job_handler(mut self, kind: JobKind, handler: Arc<dyn JobHandler<S>>) -> Self {
        self.job_handlers.register(kind, handler);
        self
    }

    /// Swap the guard-expression evaluator.
    pub fn evaluator(mut self, evaluator: Arc<dyn ExpressionEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    pub fn build(self) -> ProcessEngine<S> {
        let services = Arc::new(EngineServices {
            config: self.config,
            graphs: Arc::new(self.graphs),
            evaluator: self.evaluator,
            delegates: self.delegates,
            job_handlers: self.job_handlers,
            job_wakeup: Arc::new(Notify::new()),
        });
        let pipeline = Arc::new(CommandPipeline::new(self.backend, services));
        ProcessEngine {
            executors: TenantExecutorManager::new(Arc::clone(&pipeline)),
            pipeline,
        }
    }
}

// ---------------------------------------------------------------------------
// ProcessEngine
// ---------------------------------------------------------------------------

/// A running workflow engine bound to one storage backend.
pub struct ProcessEngine<S: StorageBackend> {
    pipeline: Arc<CommandPipeline<S>>,
    executors: TenantExecutorManager<S>,
}

impl<S: StorageBackend> ProcessEngine<S> {
    pub fn builder(backend: Arc<S>) -> ProcessEngineBuilder<S> {
        ProcessEngineBuilder::new(backend)
    }

    /// The command pipeline, for embedders running their own commands.
    pub fn pipeline(&self) -> &Arc<CommandPipeline<S>> {
        &self.pipeline
    }

    // -----------------------------------------------------------------------
    // Process operations
    // -----------------------------------------------------------------------

    /// Start a process instance and advance it to its first wait state (or
    /// completion). Returns the process instance id.
    pub async fn start_process(
        &self,
        definition_key: impl Into<String>,
        tenant_id: Option<String>,
        variables: HashMap<String, Value>,
    ) -> Result<Uuid, EngineError> {
        self.pipeline
            .execute(&StartProcessCommand {
                definition_key: definition_key.into(),
                tenant_id,
                variables,
            })
            .await
    }

    /// Deliver a signal to a specific waiting execution.
    pub async fn signal(
        &self,
        execution_id: Uuid,
        payload: HashMap<String, Value>,
    ) -> Result<(), EngineError> {
        self.pipeline
            .execute(&SignalCommand {
                execution_id,
                payload,
            })
            .await
    }

    /// Deliver a named signal to the deepest waiting execution. Returns the
    /// signaled execution's id, or `None` when nothing waits on the name.
    pub async fn signal_by_name(
        &self,
        signal_name: impl Into<String>,
        payload: HashMap<String, Value>,
    ) -> Result<Option<Uuid>, EngineError> {
        self.pipeline
            .execute(&SignalByNameCommand {
                signal_name: signal_name.into(),
                payload,
            })
            .await
    }

    /// Write a variable. Global writes resolve through the scope chain,
    /// local writes pin the variable to the execution itself.
    pub async fn set_variable(
        &self,
        execution_id: Uuid,
        name: impl Into<String>,
        value: Value,
        local: bool,
    ) -> Result<(), EngineError> {
        self.pipeline
            .execute(&SetVariableCommand {
                execution_id,
                name: name.into(),
                value,
                local,
            })
            .await
    }

    /// Read a variable visible to an execution.
    pub async fn get_variable(
        &self,
        execution_id: Uuid,
        name: impl Into<String>,
    ) -> Result<Option<Value>, EngineError> {
        self.pipeline
            .execute(&GetVariableCommand {
                execution_id,
                name: name.into(),
            })
            .await
    }

    /// Suspend a process instance: signals, variable writes, and timers are
    /// rejected until activation.
    pub async fn suspend_instance(&self, process_instance_id: Uuid) -> Result<(), EngineError> {
        self.pipeline
            .execute(&SuspendInstanceCommand {
                process_instance_id,
            })
            .await
    }

    /// Lift a suspension.
    pub async fn activate_instance(&self, process_instance_id: Uuid) -> Result<(), EngineError> {
        self.pipeline
            .execute(&ActivateInstanceCommand {
                process_instance_id,
            })
            .await
    }

    /// Remove a process instance and everything it owns.
    pub async fn delete_instance(&self, process_instance_id: Uuid) -> Result<(), EngineError> {
        self.pipeline
            .execute(&DeleteInstanceCommand {
                process_instance_id,
            })
            .await
    }

    // -----------------------------------------------------------------------
    // Job execution
    // -----------------------------------------------------------------------

    /// Register a job executor for one tenant, optionally leaving it idle
    /// until `start_job_executor`.
    pub async fn add_job_executor(&self, tenant_id: Option<String>, start_immediately: bool) {
        self.executors.add_tenant(tenant_id, start_immediately).await;
    }

    /// Start a job executor for one tenant (`None` = the default partition).
    pub async fn start_job_executor(&self, tenant_id: Option<String>) {
        self.executors.start_tenant(tenant_id).await;
    }

    /// Stop one tenant's executor, draining its in-flight jobs.
    pub async fn stop_job_executor(&self, tenant_id: &Option<String>) {
        self.executors.stop_tenant(tenant_id).await;
    }

    /// Tenants with a running executor.
    pub fn running_executors(&self) -> Vec<Option<String>> {
        self.executors.tenants()
    }

    /// Drain and stop every executor.
    pub async fn shutdown(&self) {
        self.executors.shutdown_all().await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use futures_util::future::BoxFuture;
    use serde_json::json;

    use windlass_types::entity::{EntityKind, ExecutionEntity, StoredEntity};
    use windlass_types::process::{ActivityKind, EventKind, ProcessDefinitionBuilder};

    use crate::command::context::CommandContext;
    use crate::interpreter::behavior::DelegateError;
    use crate::test_support::TableBackend;

    struct Recorder {
        log: Arc<Mutex<Vec<String>>>,
    }

    impl DelegateHandler<TableBackend> for Recorder {
        fn invoke<'a>(
            &'a self,
            execution: &'a ExecutionEntity,
            _ctx: &'a mut CommandContext<TableBackend>,
        ) -> BoxFuture<'a, Result<(), DelegateError>> {
            let log = Arc::clone(&self.log);
            let activity = execution.activity_id.clone().unwrap_or_default();
            Box::pin(async move {
                log.lock().unwrap().push(activity);
                Ok(())
            })
        }
    }

    fn order_fulfilment() -> windlass_types::process::ProcessDefinition {
        ProcessDefinitionBuilder::new("order-fulfilment")
            .activity("await-payment", ActivityKind::Event {
                event: EventKind::Signal {
                    name: "payment-received".to_string(),
                },
            })
            .activity("split", ActivityKind::ParallelFork)
            .activity("pick", ActivityKind::Task {
                handler: "record".to_string(),
                asynchronous: false,
            })
            .activity("invoice", ActivityKind::Task {
                handler: "record".to_string(),
                asynchronous: false,
            })
            .activity("merge", ActivityKind::ParallelJoin)
            .activity("express-ship", ActivityKind::Task {
                handler: "record".to_string(),
                asynchronous: false,
            })
            .activity("ship", ActivityKind::Task {
                handler: "record".to_string(),
                asynchronous: false,
            })
            .activity("done", ActivityKind::End)
            .transition("t1", "await-payment", "split", None)
            .transition("t-pick", "split", "pick", None)
            .transition("t-invoice", "split", "invoice", None)
            .transition("t2", "pick", "merge", None)
            .transition("t3", "invoice", "merge", None)
            .transition("t-express", "merge", "express-ship", Some("express == true"))
            .transition("t-standard", "merge", "ship", None)
            .transition("t4", "express-ship", "done", None)
            .transition("t5", "ship", "done", None)
            .build()
    }

    fn engine_with(
        def: windlass_types::process::ProcessDefinition,
    ) -> (ProcessEngine<TableBackend>, Arc<TableBackend>, Arc<Mutex<Vec<String>>>) {
        let backend = Arc::new(TableBackend::default());
        let log = Arc::new(Mutex::new(Vec::new()));
        let engine = ProcessEngine::builder(Arc::clone(&backend))
            .definition(def)
            .delegate("record", Arc::new(Recorder {
                log: Arc::clone(&log),
            }))
            .build();
        (engine, backend, log)
    }

    #[tokio::test]
    async fn order_scenario_signal_fork_join_and_guarded_choice() {
        let (engine, backend, log) = engine_with(order_fulfilment());

        let instance = engine
            .start_process(
                "order-fulfilment",
                None,
                HashMap::from([("express".to_string(), json!(true))]),
            )
            .await
            .unwrap();

        // Parked at the payment signal.
        let root = backend
            .get(EntityKind::Execution, instance)
            .and_then(StoredEntity::into_execution)
            .unwrap();
        assert_eq!(root.waiting_signal.as_deref(), Some("payment-received"));

        let woken = engine
            .signal_by_name("payment-received", HashMap::new())
            .await
            .unwrap();
        assert_eq!(woken, Some(instance));

        // Both branches ran, then the express guard won.
        let recorded = log.lock().unwrap().clone();
        assert!(recorded.contains(&"pick".to_string()));
        assert!(recorded.contains(&"invoice".to_string()));
        assert_eq!(recorded.last().map(String::as_str), Some("express-ship"));
        assert_eq!(backend.row_count(EntityKind::Execution), 0);
    }

    #[tokio::test]
    async fn variable_scope_chain_is_visible_to_nested_executions() {
        let def = ProcessDefinitionBuilder::new("p")
            .activity("outer", ActivityKind::SubProcess {
                start_activity: "inner-wait".to_string(),
            })
            .activity("inner-wait", ActivityKind::Event {
                event: EventKind::Signal {
                    name: "go".to_string(),
                },
            })
            .activity("inner-done", ActivityKind::End)
            .activity("done", ActivityKind::End)
            .transition("t1", "inner-wait", "inner-done", None)
            .transition("t2", "outer", "done", None)
            .build();
        let (engine, backend, _log) = engine_with(def);

        let instance = engine
            .start_process("p", None, HashMap::from([("shared".to_string(), json!(1))]))
            .await
            .unwrap();

        // The sub-process child is the execution parked on the signal.
        let child = backend
            .rows
            .lock()
            .unwrap()
            .values()
            .filter_map(StoredEntity::as_execution)
            .find(|e| e.parent_id.is_some())
            .cloned()
            .unwrap();

        // Root variables are visible from the child through the chain.
        let seen = engine.get_variable(child.id, "shared").await.unwrap();
        assert_eq!(seen, Some(json!(1)));

        // A local write on the child shadows without touching the root.
        engine
            .set_variable(child.id, "shared", json!(2), true)
            .await
            .unwrap();
        assert_eq!(
            engine.get_variable(child.id, "shared").await.unwrap(),
            Some(json!(2))
        );
        assert_eq!(
            engine.get_variable(instance, "shared").await.unwrap(),
            Some(json!(1))
        );

        // A global write resolves to where the name is defined: the child's
        // own scope now holds it, so the root stays untouched.
        engine
            .set_variable(child.id, "shared", json!(3), false)
            .await
            .unwrap();
        assert_eq!(
            engine.get_variable(instance, "shared").await.unwrap(),
            Some(json!(1))
        );
        assert_eq!(
            engine.get_variable(child.id, "shared").await.unwrap(),
            Some(json!(3))
        );
    }

    #[tokio::test]
    async fn signal_by_name_prefers_the_deepest_waiter() {
        let def = ProcessDefinitionBuilder::new("p")
            .activity("outer", ActivityKind::SubProcess {
                start_activity: "inner-wait".to_string(),
            })
            .activity("inner-wait", ActivityKind::Event {
                event: EventKind::Signal {
                    name: "go".to_string(),
                },
            })
            .activity("inner-done", ActivityKind::End)
            .activity("done", ActivityKind::End)
            .transition("t1", "inner-wait", "inner-done", None)
            .transition("t2", "outer", "done", None)
            .build();
        let shallow = ProcessDefinitionBuilder::new("q")
            .activity("wait", ActivityKind::Event {
                event: EventKind::Signal {
                    name: "go".to_string(),
                },
            })
            .activity("done", ActivityKind::End)
            .transition("t1", "wait", "done", None)
            .build();

        let backend = Arc::new(TableBackend::default());
        let engine = ProcessEngine::builder(Arc::clone(&backend))
            .definition(def)
            .definition(shallow)
            .build();

        // Shallow waiter first, nested waiter second.
        let shallow_instance = engine.start_process("q", None, HashMap::new()).await.unwrap();
        engine.start_process("p", None, HashMap::new()).await.unwrap();

        let woken = engine
            .signal_by_name("go", HashMap::new())
            .await
            .unwrap()
            .unwrap();
        // The nested (depth 1) waiter wins over the earlier root-level one.
        assert_ne!(woken, shallow_instance);
        assert!(backend.get(EntityKind::Execution, shallow_instance).is_some());
    }

    #[tokio::test]
    async fn executor_lifecycle_via_facade() {
        let def = ProcessDefinitionBuilder::new("p")
            .activity("pause", ActivityKind::Event {
                event: EventKind::Timer { delay_secs: 0 },
            })
            .activity("done", ActivityKind::End)
            .transition("t1", "pause", "done", None)
            .build();
        let backend = Arc::new(TableBackend::default());
        let mut config = EngineConfig::default();
        config.job_executor.poll_interval_secs = 1;
        let engine = ProcessEngine::builder(Arc::clone(&backend))
            .definition(def)
            .config(config)
            .build();

        engine.start_process("p", None, HashMap::new()).await.unwrap();
        engine.start_job_executor(None).await;
        assert_eq!(engine.running_executors(), vec![None]);

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(10);
        while backend.row_count(EntityKind::Execution) > 0 {
            assert!(std::time::Instant::now() < deadline, "timer never fired");
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }

        engine.shutdown().await;
        assert!(engine.running_executors().is_empty());
    }
}
