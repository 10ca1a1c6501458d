//! Variable resolution over the execution tree.
//!
//! Lookups walk the parent chain and stop at the first execution owning a
//! variable of that name. Writes either target the current execution
//! (local) or the nearest scope-owning ancestor (global); a global write
//! that finds the name already defined somewhere on the chain overwrites it
//! where it is defined.

use serde_json::{Map, Value};
use uuid::Uuid;

use windlass_types::entity::{EntityKind, ExecutionEntity, Selector, StoredEntity, VariableEntity};

use crate::command::context::CommandContext;
use crate::error::EngineError;
use crate::storage::StorageBackend;

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

/// Read a variable, walking up the scope chain.
pub async fn read_variable<S: StorageBackend>(
    ctx: &mut CommandContext<S>,
    execution_id: Uuid,
    name: &str,
) -> Result<Option<Value>, EngineError> {
    let mut cursor = Some(execution_id);
    while let Some(id) = cursor {
        if let Some(variable) = ctx.session().find_variable_by_name(id, name).await? {
            return Ok(Some(variable.value));
        }
        let execution = load_execution(ctx, id).await?;
        cursor = execution.parent_id;
    }
    Ok(None)
}

/// Write a variable.
///
/// `local` targets the current execution unconditionally. A global write
/// overwrites the variable where the chain walk finds it, or creates it on
/// the nearest scope-owning ancestor (the execution itself when it is a
/// scope).
pub async fn write_variable<S: StorageBackend>(
    ctx: &mut CommandContext<S>,
    execution_id: Uuid,
    name: &str,
    value: Value,
    local: bool,
) -> Result<(), EngineError> {
    let target = if local {
        execution_id
    } else {
        resolve_global_target(ctx, execution_id, name).await?
    };

    match ctx.session().find_variable_by_name(target, name).await? {
        Some(mut existing) => {
            existing.value = value;
            ctx.session().update(existing);
        }
        None => {
            ctx.session().insert(VariableEntity::new(target, name, value));
        }
    }
    Ok(())
}

async fn resolve_global_target<S: StorageBackend>(
    ctx: &mut CommandContext<S>,
    execution_id: Uuid,
    name: &str,
) -> Result<Uuid, EngineError> {
    let mut nearest_scope = None;
    let mut cursor = Some(execution_id);
    while let Some(id) = cursor {
        if ctx.session().find_variable_by_name(id, name).await?.is_some() {
            return Ok(id);
        }
        let execution = load_execution(ctx, id).await?;
        if nearest_scope.is_none() && execution.is_scope {
            nearest_scope = Some(id);
        }
        cursor = execution.parent_id;
    }
    // No scope on the chain means the root itself (always a scope) was seen,
    // so this only falls back for degenerate trees.
    Ok(nearest_scope.unwrap_or(execution_id))
}

/// Assemble the full variable scope visible to an execution, inner scopes
/// shadowing outer, as a JSON object for guard evaluation.
pub async fn build_scope<S: StorageBackend>(
    ctx: &mut CommandContext<S>,
    execution_id: Uuid,
) -> Result<Value, EngineError> {
    // Collect the chain from the execution up to the root.
    let mut chain = Vec::new();
    let mut cursor = Some(execution_id);
    while let Some(id) = cursor {
        chain.push(id);
        let execution = load_execution(ctx, id).await?;
        cursor = execution.parent_id;
    }

    // Apply outermost first so inner values win.
    let mut scope = Map::new();
    for id in chain.into_iter().rev() {
        let variables = ctx
            .session()
            .find_matching(&Selector::VariablesOf { execution_id: id })
            .await?;
        for entity in variables {
            if let StoredEntity::Variable(v) = entity {
                scope.insert(v.name, v.value);
            }
        }
    }
    Ok(Value::Object(scope))
}

/// Depth of an execution in its tree (root = 0). Used to order signal
/// delivery innermost-first.
pub async fn depth<S: StorageBackend>(
    ctx: &mut CommandContext<S>,
    execution_id: Uuid,
) -> Result<usize, EngineError> {
    let mut depth = 0;
    let mut cursor = load_execution(ctx, execution_id).await?.parent_id;
    while let Some(id) = cursor {
        depth += 1;
        cursor = load_execution(ctx, id).await?.parent_id;
    }
    Ok(depth)
}
