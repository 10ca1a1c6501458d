//! Engine-level commands: the units of work behind the public facade.
//!
//! Each command validates its target, mutates entities through the session,
//! and queues interpreter operations; the pipeline drains the queue and
//! commits. Job-executor commands (claiming, failure bookkeeping) live in
//! [`crate::job`].

use std::collections::HashMap;

use serde_json::Value;
use uuid::Uuid;

use windlass_types::entity::{EntityKind, ExecutionEntity, Selector, StoredEntity, VariableEntity};

use crate::command::Command;
use crate::command::context::CommandContext;
use crate::error::EngineError;
use crate::interpreter::{AtomicOperation, variables};
use crate::storage::StorageBackend;

// ---------------------------------------------------------------------------
// StartProcessCommand
// ---------------------------------------------------------------------------

/// Create a root execution for `definition_key`, seed the initial variables
/// on it, and advance from the definition's initial activity.
pub struct StartProcessCommand {
    pub definition_key: String,
    pub tenant_id: Option<String>,
    pub variables: HashMap<String, Value>,
}

impl<S: StorageBackend> Command<S> for StartProcessCommand {
    type Output = Uuid;

    fn name(&self) -> &'static str {
        "start-process"
    }

    async fn run(&self, ctx: &mut CommandContext<S>) -> Result<Uuid, EngineError> {
        let definition = ctx.definition(&self.definition_key)?;
        if definition.activity(&definition.initial_activity).is_none() {
            return Err(EngineError::UnknownActivity {
                definition: self.definition_key.clone(),
                activity: definition.initial_activity.clone(),
            });
        }

        let mut root = ExecutionEntity::new_root(&self.definition_key, self.tenant_id.clone());
        root.activity_id = Some(definition.initial_activity.clone());
        let root_id = root.id;
        tracing::info!(
            process_instance_id = %root_id,
            definition = self.definition_key.as_str(),
            "starting process instance"
        );
        ctx.session().insert(root);
        for (name, value) in &self.variables {
            ctx.session()
                .insert(VariableEntity::new(root_id, name.clone(), value.clone()));
        }
        ctx.enqueue(AtomicOperation::ExecuteActivity {
            execution_id: root_id,
        });
        Ok(root_id)
    }
}

// ---------------------------------------------------------------------------
// SignalCommand / SignalByNameCommand
// ---------------------------------------------------------------------------

/// Deliver a signal to one execution parked at a signal event. The payload
/// is written as local variables before the execution moves on, so outgoing
/// guards can see it.
pub struct SignalCommand {
    pub execution_id: Uuid,
    pub payload: HashMap<String, Value>,
}

impl<S: StorageBackend> Command<S> for SignalCommand {
    type Output = ();

    fn name(&self) -> &'static str {
        "signal"
    }

    async fn run(&self, ctx: &mut CommandContext<S>) -> Result<(), EngineError> {
        deliver_signal(ctx, self.execution_id, &self.payload).await
    }
}

/// Deliver a named signal to the single deepest execution waiting on it.
///
/// Depth-first targeting means a signal caught inside a sub-process wakes
/// the inner wait state, not an outer one listening for the same name.
/// Returns the signaled execution's id, or `None` when nothing waits.
pub struct SignalByNameCommand {
    pub signal_name: String,
    pub payload: HashMap<String, Value>,
}

impl<S: StorageBackend> Command<S> for SignalByNameCommand {
    type Output = Option<Uuid>;

    fn name(&self) -> &'static str {
        "signal-by-name"
    }

    async fn run(&self, ctx: &mut CommandContext<S>) -> Result<Option<Uuid>, EngineError> {
        let waiting = ctx
            .session()
            .find_matching(&Selector::WaitingOnSignal {
                signal_name: self.signal_name.clone(),
            })
            .await?;

        let mut target: Option<(usize, Uuid)> = None;
        for entity in waiting {
            let StoredEntity::Execution(e) = entity else {
                continue;
            };
            let depth = variables::depth(ctx, e.id).await?;
            // Strictly-greater keeps the earliest-created on depth ties.
            if target.map(|(d, _)| depth > d).unwrap_or(true) {
                target = Some((depth, e.id));
            }
        }

        let Some((_, execution_id)) = target else {
            tracing::debug!(signal = self.signal_name.as_str(), "no execution waiting");
            return Ok(None);
        };
        deliver_signal(ctx, execution_id, &self.payload).await?;
        Ok(Some(execution_id))
    }
}

async fn deliver_signal<S: StorageBackend>(
    ctx: &mut CommandContext<S>,
    execution_id: Uuid,
    payload: &HashMap<String, Value>,
) -> Result<(), EngineError> {
    let execution = ctx
        .session()
        .find_execution(execution_id)
        .await?
        .ok_or(EngineError::NotFound {
            kind: EntityKind::Execution,
            id: execution_id,
        })?;
    if execution.is_suspended {
        return Err(EngineError::Suspended { execution_id });
    }
    let Some(signal) = execution.waiting_signal.clone() else {
        return Err(EngineError::IllegalState(format!(
            "execution {execution_id} is not waiting on a signal"
        )));
    };
    tracing::debug!(
        execution_id = %execution_id,
        signal = signal.as_str(),
        "delivering signal"
    );

    for (name, value) in payload {
        variables::write_variable(ctx, execution_id, name, value.clone(), true).await?;
    }
    ctx.enqueue(AtomicOperation::LeaveActivity { execution_id });
    Ok(())
}

// ---------------------------------------------------------------------------
// Variable commands
// ---------------------------------------------------------------------------

/// Write a variable on (or above, for global writes) one execution.
pub struct SetVariableCommand {
    pub execution_id: Uuid,
    pub name: String,
    pub value: Value,
    /// Local writes always target the execution itself; global writes
    /// resolve through the scope chain.
    pub local: bool,
}

impl<S: StorageBackend> Command<S> for SetVariableCommand {
    type Output = ();

    fn name(&self) -> &'static str {
        "set-variable"
    }

    async fn run(&self, ctx: &mut CommandContext<S>) -> Result<(), EngineError> {
        let execution = ctx
            .session()
            .find_execution(self.execution_id)
            .await?
            .ok_or(EngineError::NotFound {
                kind: EntityKind::Execution,
                id: self.execution_id,
            })?;
        if execution.is_suspended {
            return Err(EngineError::Suspended {
                execution_id: self.execution_id,
            });
        }
        variables::write_variable(
            ctx,
            self.execution_id,
            &self.name,
            self.value.clone(),
            self.local,
        )
        .await
    }
}

/// Read a variable visible to one execution, walking the scope chain.
pub struct GetVariableCommand {
    pub execution_id: Uuid,
    pub name: String,
}

impl<S: StorageBackend> Command<S> for GetVariableCommand {
    type Output = Option<Value>;

    fn name(&self) -> &'static str {
        "get-variable"
    }

    async fn run(&self, ctx: &mut CommandContext<S>) -> Result<Option<Value>, EngineError> {
        if ctx
            .session()
            .find_execution(self.execution_id)
            .await?
            .is_none()
        {
            return Err(EngineError::NotFound {
                kind: EntityKind::Execution,
                id: self.execution_id,
            });
        }
        variables::read_variable(ctx, self.execution_id, &self.name).await
    }
}

// ---------------------------------------------------------------------------
// Instance lifecycle commands
// ---------------------------------------------------------------------------

/// Suspend every execution of a process instance. Suspended executions
/// reject signals, variable writes, and timer firings until activated.
pub struct SuspendInstanceCommand {
    pub process_instance_id: Uuid,
}

impl<S: StorageBackend> Command<S> for SuspendInstanceCommand {
    type Output = ();

    fn name(&self) -> &'static str {
        "suspend-instance"
    }

    async fn run(&self, ctx: &mut CommandContext<S>) -> Result<(), EngineError> {
        set_suspended(ctx, self.process_instance_id, true).await
    }
}

/// Lift a suspension set by [`SuspendInstanceCommand`].
pub struct ActivateInstanceCommand {
    pub process_instance_id: Uuid,
}

impl<S: StorageBackend> Command<S> for ActivateInstanceCommand {
    type Output = ();

    fn name(&self) -> &'static str {
        "activate-instance"
    }

    async fn run(&self, ctx: &mut CommandContext<S>) -> Result<(), EngineError> {
        set_suspended(ctx, self.process_instance_id, false).await
    }
}

async fn set_suspended<S: StorageBackend>(
    ctx: &mut CommandContext<S>,
    process_instance_id: Uuid,
    suspended: bool,
) -> Result<(), EngineError> {
    let members = ctx
        .session()
        .find_matching(&Selector::ExecutionsOfInstance {
            process_instance_id,
        })
        .await?;
    if members.is_empty() {
        return Err(EngineError::NotFound {
            kind: EntityKind::Execution,
            id: process_instance_id,
        });
    }
    tracing::info!(
        process_instance_id = %process_instance_id,
        suspended,
        executions = members.len(),
        "changing instance suspension"
    );
    for member in members {
        if let StoredEntity::Execution(mut e) = member {
            if e.is_suspended != suspended {
                e.is_suspended = suspended;
                ctx.session().update(e);
            }
        }
    }
    Ok(())
}

/// Remove a process instance and everything it owns, regardless of state.
pub struct DeleteInstanceCommand {
    pub process_instance_id: Uuid,
}

impl<S: StorageBackend> Command<S> for DeleteInstanceCommand {
    type Output = ();

    fn name(&self) -> &'static str {
        "delete-instance"
    }

    async fn run(&self, ctx: &mut CommandContext<S>) -> Result<(), EngineError> {
        let members = ctx
            .session()
            .find_matching(&Selector::ExecutionsOfInstance {
                process_instance_id: self.process_instance_id,
            })
            .await?;
        if members.is_empty() {
            return Err(EngineError::NotFound {
                kind: EntityKind::Execution,
                id: self.process_instance_id,
            });
        }
        for member in members {
            let StoredEntity::Execution(e) = member else {
                continue;
            };
            let jobs = ctx
                .session()
                .find_matching(&Selector::JobsOfExecution { execution_id: e.id })
                .await?;
            for job in jobs {
                ctx.session().delete(job);
            }
            let vars = ctx
                .session()
                .find_matching(&Selector::VariablesOf { execution_id: e.id })
                .await?;
            for var in vars {
                ctx.session().delete(var);
            }
            ctx.session().delete(e);
        }
        tracing::info!(
            process_instance_id = %self.process_instance_id,
            "process instance deleted"
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use futures_util::future::BoxFuture;
    use serde_json::json;
    use tokio::sync::Notify;

    use windlass_types::config::EngineConfig;
    use windlass_types::process::{
        ActivityKind, EventKind, ProcessDefinition, ProcessDefinitionBuilder,
    };

    use crate::command::context::EngineServices;
    use crate::command::pipeline::CommandPipeline;
    use crate::expression::JexlEvaluator;
    use crate::graph::GraphRegistry;
    use crate::interpreter::behavior::{DelegateError, DelegateHandler, DelegateRegistry};
    use crate::job::handlers::JobHandlerRegistry;
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

    fn pipeline(
        definition: ProcessDefinition,
    ) -> (CommandPipeline<TableBackend>, Arc<Mutex<Vec<String>>>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut delegates = DelegateRegistry::new();
        delegates.register("record", Arc::new(Recorder {
            log: Arc::clone(&log),
        }));
        let graphs = GraphRegistry::new();
        graphs.register(definition);
        let services = Arc::new(EngineServices {
            config: EngineConfig::default(),
            graphs: Arc::new(graphs),
            evaluator: Arc::new(JexlEvaluator::new()),
            delegates,
            job_handlers: JobHandlerRegistry::new(),
            job_wakeup: Arc::new(Notify::new()),
        });
        (
            CommandPipeline::new(Arc::new(TableBackend::default()), services),
            log,
        )
    }

    fn signal_then_end(signal: &str) -> ProcessDefinition {
        ProcessDefinitionBuilder::new("p")
            .activity("wait", ActivityKind::Event {
                event: EventKind::Signal {
                    name: signal.to_string(),
                },
            })
            .activity("after", ActivityKind::Task {
                handler: "record".to_string(),
                asynchronous: false,
            })
            .activity("done", ActivityKind::End)
            .transition("t1", "wait", "after", None)
            .transition("t2", "after", "done", None)
            .build()
    }

    #[tokio::test]
    async fn start_process_runs_to_wait_state_and_persists() {
        let (pipeline, _log) = pipeline(signal_then_end("go"));

        let instance_id = pipeline
            .execute(&StartProcessCommand {
                definition_key: "p".to_string(),
                tenant_id: None,
                variables: HashMap::from([("amount".to_string(), json!(7))]),
            })
            .await
            .unwrap();

        let root = pipeline
            .backend()
            .get(EntityKind::Execution, instance_id)
            .and_then(StoredEntity::into_execution)
            .unwrap();
        assert_eq!(root.waiting_signal.as_deref(), Some("go"));
        assert_eq!(pipeline.backend().row_count(EntityKind::Variable), 1);
    }

    #[tokio::test]
    async fn start_process_with_unknown_definition_fails() {
        let (pipeline, _log) = pipeline(signal_then_end("go"));
        let err = pipeline
            .execute(&StartProcessCommand {
                definition_key: "missing".to_string(),
                tenant_id: None,
                variables: HashMap::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::UnknownDefinition(_)));
    }

    #[tokio::test]
    async fn signal_resumes_and_applies_payload() {
        let (pipeline, log) = pipeline(signal_then_end("go"));
        let instance_id = pipeline
            .execute(&StartProcessCommand {
                definition_key: "p".to_string(),
                tenant_id: None,
                variables: HashMap::new(),
            })
            .await
            .unwrap();

        pipeline
            .execute(&SignalCommand {
                execution_id: instance_id,
                payload: HashMap::from([("approved".to_string(), json!(true))]),
            })
            .await
            .unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["after"]);
        // Instance ran to completion.
        assert_eq!(pipeline.backend().row_count(EntityKind::Execution), 0);
    }

    #[tokio::test]
    async fn join_completes_regardless_of_branch_arrival_order() {
        let def = ProcessDefinitionBuilder::new("p")
            .activity("split", ActivityKind::ParallelFork)
            .activity("wait-a", ActivityKind::Event {
                event: EventKind::Signal {
                    name: "first".to_string(),
                },
            })
            .activity("wait-b", ActivityKind::Event {
                event: EventKind::Signal {
                    name: "second".to_string(),
                },
            })
            .activity("merge", ActivityKind::ParallelJoin)
            .activity("after", ActivityKind::Task {
                handler: "record".to_string(),
                asynchronous: false,
            })
            .activity("done", ActivityKind::End)
            .transition("t1", "split", "wait-a", None)
            .transition("t2", "split", "wait-b", None)
            .transition("t3", "wait-a", "merge", None)
            .transition("t4", "wait-b", "merge", None)
            .transition("t5", "merge", "after", None)
            .transition("t6", "after", "done", None)
            .build();
        let (pipeline, log) = pipeline(def);
        pipeline
            .execute(&StartProcessCommand {
                definition_key: "p".to_string(),
                tenant_id: None,
                variables: HashMap::new(),
            })
            .await
            .unwrap();

        // Both branches parked at their signal events. Resume them in the
        // reverse of their creation order: the join must hold after the
        // first arrival and fire exactly once after the last.
        pipeline
            .execute(&SignalByNameCommand {
                signal_name: "second".to_string(),
                payload: HashMap::new(),
            })
            .await
            .unwrap();
        assert!(log.lock().unwrap().is_empty());
        assert!(pipeline.backend().row_count(EntityKind::Execution) > 0);

        pipeline
            .execute(&SignalByNameCommand {
                signal_name: "first".to_string(),
                payload: HashMap::new(),
            })
            .await
            .unwrap();

        assert_eq!(*log.lock().unwrap(), vec!["after"]);
        assert_eq!(pipeline.backend().row_count(EntityKind::Execution), 0);
    }

    #[tokio::test]
    async fn signal_to_execution_not_waiting_is_rejected() {
        let def = ProcessDefinitionBuilder::new("p")
            .activity("pause", ActivityKind::Event {
                event: EventKind::Timer { delay_secs: 600 },
            })
            .activity("done", ActivityKind::End)
            .transition("t1", "pause", "done", None)
            .build();
        let (pipeline, _log) = pipeline(def);
        let instance_id = pipeline
            .execute(&StartProcessCommand {
                definition_key: "p".to_string(),
                tenant_id: None,
                variables: HashMap::new(),
            })
            .await
            .unwrap();

        let err = pipeline
            .execute(&SignalCommand {
                execution_id: instance_id,
                payload: HashMap::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::IllegalState(_)));
    }

    #[tokio::test]
    async fn signal_by_name_wakes_one_waiter() {
        let (pipeline, _log) = pipeline(signal_then_end("payment"));
        let a = pipeline
            .execute(&StartProcessCommand {
                definition_key: "p".to_string(),
                tenant_id: None,
                variables: HashMap::new(),
            })
            .await
            .unwrap();
        let b = pipeline
            .execute(&StartProcessCommand {
                definition_key: "p".to_string(),
                tenant_id: None,
                variables: HashMap::new(),
            })
            .await
            .unwrap();

        let woken = pipeline
            .execute(&SignalByNameCommand {
                signal_name: "payment".to_string(),
                payload: HashMap::new(),
            })
            .await
            .unwrap()
            .unwrap();

        // Equal depth: the earlier instance wins, the other keeps waiting.
        assert_eq!(woken, a);
        assert!(
            pipeline
                .backend()
                .get(EntityKind::Execution, b)
                .is_some()
        );

        let none = pipeline
            .execute(&SignalByNameCommand {
                signal_name: "unrelated".to_string(),
                payload: HashMap::new(),
            })
            .await
            .unwrap();
        assert!(none.is_none());
    }

    #[tokio::test]
    async fn suspension_blocks_signals_until_activation() {
        let (pipeline, _log) = pipeline(signal_then_end("go"));
        let instance_id = pipeline
            .execute(&StartProcessCommand {
                definition_key: "p".to_string(),
                tenant_id: None,
                variables: HashMap::new(),
            })
            .await
            .unwrap();

        pipeline
            .execute(&SuspendInstanceCommand {
                process_instance_id: instance_id,
            })
            .await
            .unwrap();

        let err = pipeline
            .execute(&SignalCommand {
                execution_id: instance_id,
                payload: HashMap::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Suspended { .. }));

        // Suspended executions are invisible to name-based delivery.
        let none = pipeline
            .execute(&SignalByNameCommand {
                signal_name: "go".to_string(),
                payload: HashMap::new(),
            })
            .await
            .unwrap();
        assert!(none.is_none());

        pipeline
            .execute(&ActivateInstanceCommand {
                process_instance_id: instance_id,
            })
            .await
            .unwrap();
        pipeline
            .execute(&SignalCommand {
                execution_id: instance_id,
                payload: HashMap::new(),
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn variables_round_trip_and_respect_suspension() {
        let (pipeline, _log) = pipeline(signal_then_end("go"));
        let instance_id = pipeline
            .execute(&StartProcessCommand {
                definition_key: "p".to_string(),
                tenant_id: None,
                variables: HashMap::new(),
            })
            .await
            .unwrap();

        pipeline
            .execute(&SetVariableCommand {
                execution_id: instance_id,
                name: "order".to_string(),
                value: json!({"id": 42}),
                local: false,
            })
            .await
            .unwrap();
        let value = pipeline
            .execute(&GetVariableCommand {
                execution_id: instance_id,
                name: "order".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(value, Some(json!({"id": 42})));

        pipeline
            .execute(&SuspendInstanceCommand {
                process_instance_id: instance_id,
            })
            .await
            .unwrap();
        let err = pipeline
            .execute(&SetVariableCommand {
                execution_id: instance_id,
                name: "order".to_string(),
                value: json!(null),
                local: false,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Suspended { .. }));
    }

    #[tokio::test]
    async fn delete_instance_removes_everything_it_owns() {
        let (pipeline, _log) = pipeline(signal_then_end("go"));
        let instance_id = pipeline
            .execute(&StartProcessCommand {
                definition_key: "p".to_string(),
                tenant_id: None,
                variables: HashMap::from([("k".to_string(), json!(1))]),
            })
            .await
            .unwrap();

        pipeline
            .execute(&DeleteInstanceCommand {
                process_instance_id: instance_id,
            })
            .await
            .unwrap();

        assert_eq!(pipeline.backend().row_count(EntityKind::Execution), 0);
        assert_eq!(pipeline.backend().row_count(EntityKind::Variable), 0);
        assert_eq!(pipeline.backend().row_count(EntityKind::Job), 0);

        let err = pipeline
            .execute(&DeleteInstanceCommand {
                process_instance_id: instance_id,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::NotFound { .. }));
    }
}
