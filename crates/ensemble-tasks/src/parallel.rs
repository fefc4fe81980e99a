//! Parallel: scatters its subtasks onto their own tokio tasks and gathers
//! one result per subtask, keyed by name.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as Json;
use tokio::sync::mpsc;

use ensemble_core::{
    ConstructError, Context, Input, Output, Registry, Task, TaskError, TaskFactory, TaskHeader,
    TaskResult,
};

use crate::common::{construct_subtasks, decode_input, execute_with_timeout};

pub const TYPE_PARALLEL: &str = "parallel";

#[derive(Deserialize)]
struct ParallelInput {
    #[serde(default)]
    tasks: Vec<Json>,
}

/// A composite task that executes its subtasks concurrently.
///
/// Subtasks share the environment read-only; their outputs are gathered into
/// the parallel's own output instead of being fed back. When several
/// subtasks fail, their messages are sorted and joined so the combined error
/// is deterministic.
pub struct Parallel {
    header: TaskHeader,
    tasks: Vec<Arc<dyn Task>>,
}

pub fn register(registry: &mut Registry) -> Result<(), ConstructError> {
    registry.register(TaskFactory::new(TYPE_PARALLEL, |registry, definition| {
        let raw: ParallelInput = decode_input(&definition.input)?;
        Ok(Arc::new(Parallel {
            header: definition.header(),
            tasks: construct_subtasks(registry, raw.tasks)?,
        }) as Arc<dyn Task>)
    }))
}

impl Parallel {
    pub fn new(name: impl Into<String>) -> Self {
        Parallel {
            header: TaskHeader::new(name, TYPE_PARALLEL),
            tasks: Vec::new(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.header.timeout = Some(timeout);
        self
    }

    pub fn with_task(mut self, task: Arc<dyn Task>) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn with_tasks(mut self, tasks: Vec<Arc<dyn Task>>) -> Self {
        self.tasks = tasks;
        self
    }

    pub fn build(self) -> Arc<dyn Task> {
        Arc::new(self)
    }

    /// Scatters the subtasks onto detached tokio tasks and gathers one
    /// result per subtask.
    ///
    /// When the parallel is cancelled or times out, stopping a scattered
    /// subtask depends on that subtask observing `ctx.cancelled()` itself —
    /// the spawned tasks are not owned by the dropped gather future. A leaf
    /// task that never checks the context (a func or code body, say)
    /// outlives a timed-out parallel; its late result is discarded on
    /// arrival.
    async fn run(&self, ctx: &Context, input: &Input) -> Result<Output, TaskError> {
        let trace = ctx.trace().child(&self.header.name);
        let ctx = ctx.with_trace(trace.clone());

        // Scatter: the channel is sized to the fan-out so no subtask ever
        // blocks on reporting its result.
        let (results_tx, mut results_rx) = mpsc::channel::<TaskResult>(self.tasks.len().max(1));
        for task in &self.tasks {
            let task = trace.wrap(task.clone());
            let results = results_tx.clone();
            let ctx = ctx.clone();
            let input = input.clone();
            tokio::spawn(async move {
                let name = task.header().name.clone();
                let message = match task.execute(&ctx, &input).await {
                    Ok(output) => TaskResult {
                        name,
                        output,
                        err: None,
                    },
                    Err(err) => TaskResult {
                        name,
                        output: Output::new(),
                        err: Some(err),
                    },
                };
                let _ = results.send(message).await;
            });
        }
        drop(results_tx);

        // Gather exactly one result per subtask.
        let mut output = Output::new();
        let mut errors = Vec::new();
        for _ in 0..self.tasks.len() {
            let Some(result) = results_rx.recv().await else {
                break;
            };
            match result.err {
                Some(err) => errors.push(err.to_string()),
                None => output.insert(result.name, result.output.into_value()),
            }
        }

        if !errors.is_empty() {
            errors.sort();
            tracing::warn!(task = %self.header.name, failures = errors.len(), "parallel subtasks failed");
            return Err(TaskError::Failed(errors.join("; ")));
        }
        Ok(output)
    }
}

#[async_trait]
impl Task for Parallel {
    fn header(&self) -> &TaskHeader {
        &self.header
    }

    async fn execute(&self, ctx: &Context, input: &Input) -> Result<Output, TaskError> {
        execute_with_timeout(ctx, input, self.header.timeout, |ctx, input| async move {
            self.run(&ctx, &input).await
        })
        .await
    }
}
