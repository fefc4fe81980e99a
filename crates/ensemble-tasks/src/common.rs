//! Helpers shared by the built-in task kinds.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value as Json;

use ensemble_core::{ConstructError, Context, Input, Output, Registry, Task, TaskError};

/// Runs `f` under the task's timeout, if any, racing it against cancellation
/// of the surrounding scope.
///
/// The body receives a child cancellation scope; when the deadline fires the
/// body future is dropped and the child scope is cancelled, which stops any
/// subtasks, iterator producers or actors it spawned.
pub(crate) async fn execute_with_timeout<F, Fut>(
    ctx: &Context,
    input: &Input,
    timeout: Option<Duration>,
    f: F,
) -> Result<Output, TaskError>
where
    F: FnOnce(Context, Input) -> Fut,
    Fut: Future<Output = Result<Output, TaskError>>,
{
    let Some(limit) = timeout.filter(|t| !t.is_zero()) else {
        return tokio::select! {
            _ = ctx.cancelled() => Err(TaskError::Canceled),
            result = f(ctx.clone(), input.clone()) => result,
        };
    };

    let scope = ctx.child();
    let result = tokio::select! {
        _ = ctx.cancelled() => Err(TaskError::Canceled),
        result = tokio::time::timeout(limit, f(scope.clone(), input.clone())) => {
            result.unwrap_or(Err(TaskError::Timeout))
        }
    };
    if matches!(result, Err(TaskError::Timeout) | Err(TaskError::Canceled)) {
        scope.cancel();
    }
    result
}

/// Constructs an ordered list of subtasks, rejecting duplicate names.
pub(crate) fn construct_subtasks(
    registry: &Registry,
    definitions: Vec<Json>,
) -> Result<Vec<Arc<dyn Task>>, ConstructError> {
    let mut names = HashSet::new();
    let mut tasks = Vec::with_capacity(definitions.len());
    for definition in definitions {
        let task = registry.construct_value(definition)?;
        if !names.insert(task.header().name.clone()) {
            return Err(ConstructError::DuplicateTaskName(task.header().name.clone()));
        }
        tasks.push(task);
    }
    Ok(tasks)
}

/// Decodes a kind-specific input block out of a definition document.
pub(crate) fn decode_input<T: serde::de::DeserializeOwned>(
    input: &serde_json::Map<String, Json>,
) -> Result<T, ConstructError> {
    Ok(serde_json::from_value(Json::Object(input.clone()))?)
}
