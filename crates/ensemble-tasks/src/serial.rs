//! Serial: executes its subtasks in order, feeding each subtask's output
//! back into the environment under the subtask's name.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as Json;

use ensemble_core::{
    ActorHandle, ConstructError, Context, Input, Output, Registry, Schema, Task, TaskError,
    TaskFactory, TaskHeader, Value,
};

use crate::common::{construct_subtasks, decode_input, execute_with_timeout};

pub const TYPE_SERIAL: &str = "serial";

#[derive(Deserialize)]
struct SerialInput {
    #[serde(default)]
    tasks: Vec<Json>,
    #[serde(default, rename = "async")]
    run_async: bool,
    #[serde(default)]
    schema: Option<Schema>,
}

/// A composite task that executes its subtasks one after another.
///
/// With `async: true` the subtasks run on a detached actor instead, and the
/// immediate output carries the actor handle under the reserved `actor` key.
pub struct Serial {
    header: TaskHeader,
    tasks: Vec<Arc<dyn Task>>,
    schema: Option<Schema>,
    run_async: bool,
}

pub fn register(registry: &mut Registry) -> Result<(), ConstructError> {
    registry.register(TaskFactory::new(TYPE_SERIAL, |registry, definition| {
        let raw: SerialInput = decode_input(&definition.input)?;
        Ok(Arc::new(Serial {
            header: definition.header(),
            tasks: construct_subtasks(registry, raw.tasks)?,
            schema: raw.schema,
            run_async: raw.run_async,
        }) as Arc<dyn Task>)
    }))
}

impl Serial {
    pub fn new(name: impl Into<String>) -> Self {
        Serial {
            header: TaskHeader::new(name, TYPE_SERIAL),
            tasks: Vec::new(),
            schema: None,
            run_async: false,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.header.timeout = Some(timeout);
        self
    }

    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn asynchronous(mut self, run_async: bool) -> Self {
        self.run_async = run_async;
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

    fn spawn_actor(&self, ctx: &Context, input: &Input) -> Output {
        let name = self.header.name.clone();
        let tasks = self.tasks.clone();
        let input = input.clone();
        let handle = ActorHandle::new(ctx, move |scope, behavior| async move {
            let mut port = Output::new();
            port.insert("behavior", Value::Behavior(behavior.clone()));
            input.add("actor", port);

            match run_in_order(&name, &tasks, &scope, &input).await {
                Ok(mut output) => {
                    output.insert("status", "finish");
                    behavior.send(output, None).await;
                }
                Err(err) => {
                    behavior.send(Output::new(), Some(err)).await;
                }
            }
        });

        let mut output = Output::new();
        output.insert("actor", Value::Actor(handle));
        output
    }
}

async fn run_in_order(
    name: &str,
    tasks: &[Arc<dyn Task>],
    ctx: &Context,
    input: &Input,
) -> Result<Output, TaskError> {
    let trace = ctx.trace().child(name);
    let ctx = ctx.with_trace(trace.clone());

    let mut output = Output::new();
    for task in tasks {
        let subtask = task.header().name.clone();
        tracing::debug!(task = %name, %subtask, "executing serial subtask");
        output = trace.wrap(task.clone()).execute(&ctx, input).await?;
        if output.is_terminated() {
            tracing::debug!(task = %name, %subtask, "serial terminated early");
            return Ok(output);
        }
        input.add(subtask, output.clone());
    }
    Ok(output)
}

#[async_trait]
impl Task for Serial {
    fn header(&self) -> &TaskHeader {
        &self.header
    }

    async fn execute(&self, ctx: &Context, input: &Input) -> Result<Output, TaskError> {
        if let Some(schema) = &self.schema {
            let root = match input.get("input").map(|v| v.to_json_lossy()) {
                Some(Json::Object(entries)) => entries,
                _ => serde_json::Map::new(),
            };
            schema.validate(&root)?;
        }

        if self.run_async {
            return Ok(self.spawn_actor(ctx, input));
        }

        execute_with_timeout(ctx, input, self.header.timeout, |ctx, input| async move {
            run_in_order(&self.header.name, &self.tasks, &ctx, &input).await
        })
        .await
    }
}
