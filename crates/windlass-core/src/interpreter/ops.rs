//! Atomic interpreter operations and the drain loop.
//!
//! Every step of process execution is one of four operations. Each operation
//! mutates entities through the session and may enqueue follow-up operations
//! on the context; `run_operations` drains the queue until the unit of work
//! reaches a quiescent state (every live execution parked at a wait state or
//! the instance ended). Nothing here touches storage directly, so the whole
//! chain commits or rolls back as one batch.

use chrono::{Duration, Utc};
use serde_json::json;
use uuid::Uuid;

use windlass_types::entity::{
    EntityKind, ExecutionEntity, JobEntity, JobKind, Selector, StoredEntity,
};
use windlass_types::process::{Activity, ActivityKind, EventKind};

use crate::command::context::CommandContext;
use crate::error::EngineError;
use crate::job::JobOutcome;
use crate::storage::StorageBackend;

/// Upper bound on operations per unit of work. A well-formed graph never
/// comes close; hitting it means a cycle without a wait state.
const MAX_OPERATIONS: usize = 10_000;

// ---------------------------------------------------------------------------
// AtomicOperation
// ---------------------------------------------------------------------------

/// One interpreter step, addressed to a single execution.
#[derive(Debug, Clone, PartialEq)]
pub enum AtomicOperation {
    /// Run the behavior of the activity the execution currently sits at.
    ExecuteActivity { execution_id: Uuid },
    /// Pick the first enabled outgoing transition and take it, or end the
    /// execution if the activity has no outgoing transitions.
    LeaveActivity { execution_id: Uuid },
    /// Move the execution across a specific transition.
    TakeTransition {
        execution_id: Uuid,
        transition_id: String,
    },
    /// Tear down the execution, cascading per its position in the tree.
    EndExecution { execution_id: Uuid },
}

/// Drain the context's operation queue to quiescence.
pub async fn run_operations<S: StorageBackend>(
    ctx: &mut CommandContext<S>,
) -> Result<(), EngineError> {
    let mut budget = MAX_OPERATIONS;
    while let Some(operation) = ctx.pop_operation() {
        if budget == 0 {
            return Err(EngineError::IllegalState(format!(
                "operation budget of {MAX_OPERATIONS} exhausted, graph likely cycles without a wait state"
            )));
        }
        budget -= 1;
        tracing::trace!(?operation, "interpreter step");
        match operation {
            AtomicOperation::ExecuteActivity { execution_id } => {
                execute_activity(ctx, execution_id).await?;
            }
            AtomicOperation::LeaveActivity { execution_id } => {
                leave_activity(ctx, execution_id).await?;
            }
            AtomicOperation::TakeTransition {
                execution_id,
                transition_id,
            } => {
                take_transition(ctx, execution_id, &transition_id).await?;
            }
            AtomicOperation::EndExecution { execution_id } => {
                end_execution(ctx, execution_id).await?;
            }
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// ExecuteActivity
// ---------------------------------------------------------------------------

async fn execute_activity<S: StorageBackend>(
    ctx: &mut CommandContext<S>,
    execution_id: Uuid,
) -> Result<(), EngineError> {
    let execution = load_execution(ctx, execution_id).await?;
    let definition = ctx.definition(&execution.definition_key)?;
    let activity_id = execution.activity_id.clone().ok_or_else(|| {
        EngineError::IllegalState(format!("execution {execution_id} has no current activity"))
    })?;
    let activity = definition
        .activity(&activity_id)
        .ok_or_else(|| EngineError::UnknownActivity {
            definition: execution.definition_key.clone(),
            activity: activity_id.clone(),
        })?;

    match &activity.kind {
        ActivityKind::Task {
            handler,
            asynchronous,
        } => {
            if *asynchronous {
                schedule_continuation(ctx, &execution, activity);
            } else {
                invoke_task(ctx, &execution, activity, handler).await?;
            }
        }

        ActivityKind::ParallelFork => {
            fork(ctx, execution, activity);
        }

        ActivityKind::ParallelJoin => {
            if !execution.is_concurrent {
                // A single path of control arriving at a join passes through.
                ctx.enqueue(AtomicOperation::LeaveActivity { execution_id });
                return Ok(());
            }
            let parent_id = execution.parent_id.ok_or_else(|| {
                EngineError::IllegalState(format!(
                    "concurrent execution {execution_id} has no parent at join '{activity_id}'"
                ))
            })?;
            let mut execution = execution;
            execution.is_active = false;
            ctx.session().update(execution);
            try_complete_join(ctx, parent_id).await?;
        }

        ActivityKind::Event { event } => match event {
            EventKind::Signal { name } => {
                let mut execution = execution;
                execution.waiting_signal = Some(name.clone());
                tracing::debug!(
                    execution_id = %execution_id,
                    signal = name.as_str(),
                    "execution waiting on signal"
                );
                ctx.session().update(execution);
                // Wait state: nothing enqueued.
            }
            EventKind::Timer { delay_secs } => {
                let job = JobEntity::new(
                    JobKind::Timer,
                    Utc::now() + Duration::seconds(*delay_secs as i64),
                    execution.id,
                    json!({ "activity_id": activity.id }),
                    ctx.config().job_executor.default_retries,
                    execution.tenant_id.clone(),
                );
                tracing::debug!(
                    execution_id = %execution_id,
                    job_id = %job.id,
                    due = %job.due_date,
                    "timer scheduled"
                );
                ctx.session().insert(job);
                ctx.notify_jobs_on_commit();
                // Wait state until the timer fires.
            }
        },

        ActivityKind::SubProcess { start_activity } => {
            if definition.activity(start_activity).is_none() {
                return Err(EngineError::UnknownActivity {
                    definition: execution.definition_key.clone(),
                    activity: start_activity.clone(),
                });
            }
            let mut child = ExecutionEntity::new_child(&execution, false, true);
            child.activity_id = Some(start_activity.clone());
            let child_id = child.id;
            let mut parent = execution;
            parent.is_active = false;
            ctx.session().update(parent);
            ctx.session().insert(child);
            ctx.enqueue(AtomicOperation::ExecuteActivity {
                execution_id: child_id,
            });
        }

        ActivityKind::End => {
            ctx.enqueue(AtomicOperation::EndExecution { execution_id });
        }
    }
    Ok(())
}

/// Spawn one concurrent child per outgoing transition of a fork. The parent
/// deactivates and becomes the join scope for its children.
fn fork<S: StorageBackend>(
    ctx: &mut CommandContext<S>,
    mut parent: ExecutionEntity,
    activity: &Activity,
) {
    if activity.outgoing.is_empty() {
        ctx.enqueue(AtomicOperation::EndExecution {
            execution_id: parent.id,
        });
        return;
    }

    let mut children = Vec::with_capacity(activity.outgoing.len());
    for transition_id in &activity.outgoing {
        let mut child = ExecutionEntity::new_child(&parent, true, false);
        child.activity_id = Some(activity.id.clone());
        children.push((child, transition_id.clone()));
    }
    tracing::debug!(
        execution_id = %parent.id,
        activity = activity.id.as_str(),
        branches = children.len(),
        "parallel fork"
    );

    parent.is_active = false;
    parent.is_scope = true;
    ctx.session().update(parent);
    for (child, transition_id) in children {
        let execution_id = child.id;
        ctx.session().insert(child);
        ctx.enqueue(AtomicOperation::TakeTransition {
            execution_id,
            transition_id,
        });
    }
}

/// Invoke a task delegate inline. A business error routes to the activity's
/// error boundary when declared, otherwise fails the unit of work.
async fn invoke_task<S: StorageBackend>(
    ctx: &mut CommandContext<S>,
    execution: &ExecutionEntity,
    activity: &Activity,
    handler_key: &str,
) -> Result<(), EngineError> {
    let handler = ctx.services().delegates.resolve(handler_key)?;
    match handler.invoke(execution, ctx).await {
        Ok(()) => {
            ctx.enqueue(AtomicOperation::LeaveActivity {
                execution_id: execution.id,
            });
            Ok(())
        }
        Err(err) => match &activity.error_transition {
            Some(transition_id) => {
                tracing::warn!(
                    execution_id = %execution.id,
                    activity = activity.id.as_str(),
                    error = %err,
                    boundary = transition_id.as_str(),
                    "delegate failed, taking error boundary"
                );
                ctx.enqueue(AtomicOperation::TakeTransition {
                    execution_id: execution.id,
                    transition_id: transition_id.clone(),
                });
                Ok(())
            }
            None => Err(EngineError::Delegate {
                activity: activity.id.clone(),
                message: err.to_string(),
            }),
        },
    }
}

/// Persist an async-continuation job for a task marked `asynchronous`. The
/// execution parks at the task; a job-executor worker picks it up after
/// commit.
fn schedule_continuation<S: StorageBackend>(
    ctx: &mut CommandContext<S>,
    execution: &ExecutionEntity,
    activity: &Activity,
) {
    let job = JobEntity::new(
        JobKind::AsyncContinuation,
        Utc::now(),
        execution.id,
        json!({ "activity_id": activity.id }),
        ctx.config().job_executor.default_retries,
        execution.tenant_id.clone(),
    );
    tracing::debug!(
        execution_id = %execution.id,
        activity = activity.id.as_str(),
        job_id = %job.id,
        "async continuation scheduled"
    );
    ctx.session().insert(job);
    ctx.notify_jobs_on_commit();
}

// ---------------------------------------------------------------------------
// LeaveActivity / TakeTransition
// ---------------------------------------------------------------------------

async fn leave_activity<S: StorageBackend>(
    ctx: &mut CommandContext<S>,
    execution_id: Uuid,
) -> Result<(), EngineError> {
    let mut execution = load_execution(ctx, execution_id).await?;
    if execution.waiting_signal.is_some() {
        execution.waiting_signal = None;
        ctx.session().update(execution.clone());
    }

    let definition = ctx.definition(&execution.definition_key)?;
    let activity_id = execution.activity_id.clone().ok_or_else(|| {
        EngineError::IllegalState(format!("execution {execution_id} has no current activity"))
    })?;
    let activity = definition
        .activity(&activity_id)
        .ok_or_else(|| EngineError::UnknownActivity {
            definition: execution.definition_key.clone(),
            activity: activity_id.clone(),
        })?;

    if activity.outgoing.is_empty() {
        ctx.enqueue(AtomicOperation::EndExecution { execution_id });
        return Ok(());
    }

    // Exclusive choice: first transition whose guard passes, document order.
    for transition_id in activity.outgoing.clone() {
        let transition =
            definition
                .transition(&transition_id)
                .ok_or_else(|| EngineError::UnknownTransition {
                    definition: execution.definition_key.clone(),
                    transition: transition_id.clone(),
                })?;
        let enabled = match &transition.guard {
            None => true,
            Some(expr) => {
                let expr = expr.clone();
                let scope = super::variables::build_scope(ctx, execution_id).await?;
                ctx.services().evaluator.evaluate_bool(&expr, &scope)?
            }
        };
        if enabled {
            ctx.enqueue(AtomicOperation::TakeTransition {
                execution_id,
                transition_id,
            });
            return Ok(());
        }
    }

    Err(EngineError::NoTransitionEnabled {
        activity: activity_id,
    })
}

async fn take_transition<S: StorageBackend>(
    ctx: &mut CommandContext<S>,
    execution_id: Uuid,
    transition_id: &str,
) -> Result<(), EngineError> {
    let mut execution = load_execution(ctx, execution_id).await?;
    if execution.is_suspended {
        return Err(EngineError::Suspended { execution_id });
    }

    let definition = ctx.definition(&execution.definition_key)?;
    let transition =
        definition
            .transition(transition_id)
            .ok_or_else(|| EngineError::UnknownTransition {
                definition: execution.definition_key.clone(),
                transition: transition_id.to_string(),
            })?;
    if definition.activity(&transition.target).is_none() {
        return Err(EngineError::UnknownActivity {
            definition: execution.definition_key.clone(),
            activity: transition.target.clone(),
        });
    }

    if let Some(expr) = &transition.guard {
        let expr = expr.clone();
        let scope = super::variables::build_scope(ctx, execution_id).await?;
        if !ctx.services().evaluator.evaluate_bool(&expr, &scope)? {
            return Err(EngineError::GuardRejected {
                transition: transition_id.to_string(),
            });
        }
    }

    tracing::trace!(
        execution_id = %execution_id,
        transition = transition_id,
        target = transition.target.as_str(),
        "taking transition"
    );
    execution.activity_id = Some(transition.target.clone());
    ctx.session().update(execution);
    ctx.enqueue(AtomicOperation::ExecuteActivity { execution_id });
    Ok(())
}

// ---------------------------------------------------------------------------
// EndExecution
// ---------------------------------------------------------------------------

async fn end_execution<S: StorageBackend>(
    ctx: &mut CommandContext<S>,
    execution_id: Uuid,
) -> Result<(), EngineError> {
    // Already torn down by a cascade earlier in this unit of work.
    let Some(execution) = ctx.session().find_execution(execution_id).await? else {
        return Ok(());
    };

    if execution.is_root() {
        let members = ctx
            .session()
            .find_matching(&Selector::ExecutionsOfInstance {
                process_instance_id: execution.process_instance_id,
            })
            .await?;
        for member in members {
            if let StoredEntity::Execution(e) = member {
                delete_owned(ctx, e.id).await?;
                ctx.session().delete(e);
            }
        }
        tracing::info!(
            process_instance_id = %execution.process_instance_id,
            definition = execution.definition_key.as_str(),
            "process instance completed"
        );
        return Ok(());
    }

    delete_owned(ctx, execution_id).await?;
    ctx.session().delete(execution.clone());

    let parent_id = execution.parent_id.ok_or_else(|| {
        EngineError::IllegalState(format!("non-root execution {execution_id} has no parent"))
    })?;

    if execution.is_concurrent {
        let remaining = ctx
            .session()
            .find_matching(&Selector::ChildrenOf { parent_id })
            .await?;
        if remaining.is_empty() {
            // Every branch ended without reaching a join.
            ctx.enqueue(AtomicOperation::EndExecution {
                execution_id: parent_id,
            });
        } else {
            // The ended branch may have been the last one still running.
            try_complete_join(ctx, parent_id).await?;
        }
        return Ok(());
    }

    // A completed sub-process scope hands control back to its parent, which
    // still sits at the sub-process activity.
    let mut parent = load_execution(ctx, parent_id).await?;
    parent.is_active = true;
    ctx.session().update(parent);
    ctx.enqueue(AtomicOperation::LeaveActivity {
        execution_id: parent_id,
    });
    Ok(())
}

/// Delete the jobs and variables owned by one execution.
async fn delete_owned<S: StorageBackend>(
    ctx: &mut CommandContext<S>,
    execution_id: Uuid,
) -> Result<(), EngineError> {
    let jobs = ctx
        .session()
        .find_matching(&Selector::JobsOfExecution { execution_id })
        .await?;
    for job in jobs {
        ctx.session().delete(job);
    }
    let variables = ctx
        .session()
        .find_matching(&Selector::VariablesOf { execution_id })
        .await?;
    for variable in variables {
        ctx.session().delete(variable);
    }
    Ok(())
}

/// Complete the join under `parent_id` if every remaining child has arrived
/// at the same parallel-join activity. The children are consumed and the
/// parent resumes at the join.
async fn try_complete_join<S: StorageBackend>(
    ctx: &mut CommandContext<S>,
    parent_id: Uuid,
) -> Result<bool, EngineError> {
    let children: Vec<ExecutionEntity> = ctx
        .session()
        .find_matching(&Selector::ChildrenOf { parent_id })
        .await?
        .into_iter()
        .filter_map(StoredEntity::into_execution)
        .collect();
    if children.is_empty() {
        return Ok(false);
    }
    let Some(join_id) = children[0].activity_id.clone() else {
        return Ok(false);
    };
    let all_arrived = children
        .iter()
        .all(|c| !c.is_active && c.activity_id.as_deref() == Some(join_id.as_str()));
    if !all_arrived {
        return Ok(false);
    }

    let mut parent = load_execution(ctx, parent_id).await?;
    let definition = ctx.definition(&parent.definition_key)?;
    match definition.activity(&join_id).map(|a| &a.kind) {
        Some(ActivityKind::ParallelJoin) => {}
        _ => return Ok(false),
    }

    tracing::debug!(
        execution_id = %parent_id,
        activity = join_id.as_str(),
        branches = children.len(),
        "parallel join complete"
    );
    for child in children {
        delete_owned(ctx, child.id).await?;
        ctx.session().delete(child);
    }
    parent.is_active = true;
    parent.activity_id = Some(join_id);
    ctx.session().update(parent);
    ctx.enqueue(AtomicOperation::LeaveActivity {
        execution_id: parent_id,
    });
    Ok(true)
}

// ---------------------------------------------------------------------------
// Job-driven resumption
// ---------------------------------------------------------------------------

/// Continue an asynchronously-parked task on a worker. Dropped silently when
/// the execution is gone or has moved on since the job was persisted; a
/// suspended target defers the job instead of consuming it.
pub(crate) async fn resume_async_task<S: StorageBackend>(
    ctx: &mut CommandContext<S>,
    execution_id: Uuid,
    expected_activity: &str,
) -> Result<JobOutcome, EngineError> {
    let Some(execution) = ctx.session().find_execution(execution_id).await? else {
        tracing::debug!(execution_id = %execution_id, "continuation target gone, dropping");
        return Ok(JobOutcome::Completed);
    };
    if !execution.is_active || execution.activity_id.as_deref() != Some(expected_activity) {
        tracing::debug!(
            execution_id = %execution_id,
            expected = expected_activity,
            "continuation stale, dropping"
        );
        return Ok(JobOutcome::Completed);
    }
    if execution.is_suspended {
        tracing::debug!(execution_id = %execution_id, "continuation target suspended, deferring");
        return Ok(JobOutcome::Deferred);
    }

    let definition = ctx.definition(&execution.definition_key)?;
    let activity =
        definition
            .activity(expected_activity)
            .ok_or_else(|| EngineError::UnknownActivity {
                definition: execution.definition_key.clone(),
                activity: expected_activity.to_string(),
            })?;
    let ActivityKind::Task { handler, .. } = &activity.kind else {
        return Err(EngineError::IllegalState(format!(
            "continuation job targets non-task activity '{expected_activity}'"
        )));
    };
    invoke_task(ctx, &execution, activity, handler).await?;
    Ok(JobOutcome::Completed)
}

/// Fire a due timer: leave the event activity the execution is parked at.
/// Dropped silently when the execution is gone or has moved on; a suspended
/// target defers the job instead of consuming it.
pub(crate) async fn fire_timer<S: StorageBackend>(
    ctx: &mut CommandContext<S>,
    execution_id: Uuid,
    expected_activity: &str,
) -> Result<JobOutcome, EngineError> {
    let Some(execution) = ctx.session().find_execution(execution_id).await? else {
        tracing::debug!(execution_id = %execution_id, "timer target gone, dropping");
        return Ok(JobOutcome::Completed);
    };
    if !execution.is_active || execution.activity_id.as_deref() != Some(expected_activity) {
        tracing::debug!(
            execution_id = %execution_id,
            expected = expected_activity,
            "timer stale, dropping"
        );
        return Ok(JobOutcome::Completed);
    }
    if execution.is_suspended {
        tracing::debug!(execution_id = %execution_id, "timer target suspended, deferring");
        return Ok(JobOutcome::Deferred);
    }
    ctx.enqueue(AtomicOperation::LeaveActivity { execution_id });
    Ok(JobOutcome::Completed)
}

async fn load_execution<S: StorageBackend>(
    ctx: &mut CommandContext<S>,
    execution_id: Uuid,
) -> Result<ExecutionEntity, EngineError> {
    ctx.session()
        .find_execution(execution_id)
        .await?
        .ok_or(EngineError::NotFound {
            kind: EntityKind::Execution,
            id: execution_id,
        })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
