//! Loop: drives a body task once per value produced by an iterator subtask.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as Json;

use ensemble_core::{
    ConstructError, Context, Input, Output, Registry, Task, TaskError, TaskFactory, TaskHeader,
};

use crate::common::execute_with_timeout;

pub const TYPE_LOOP: &str = "loop";

#[derive(Deserialize)]
struct LoopInput {
    iterator: Json,
    body: Json,
}

/// A composite task that executes its body once per iterator value.
///
/// The iterator subtask must return an iterator handle under the reserved
/// `iterator` key. Before each body execution the current value is bound in
/// the environment under the iterator subtask's name. Body executions are
/// strictly sequential; a body output with `terminated` set breaks the
/// iteration and stops the producer.
pub struct Loop {
    header: TaskHeader,
    iterator: Arc<dyn Task>,
    body: Arc<dyn Task>,
}

pub fn register(registry: &mut Registry) -> Result<(), ConstructError> {
    registry.register(TaskFactory::new(TYPE_LOOP, |registry, definition| {
        let raw: LoopInput = crate::common::decode_input(&definition.input)?;
        Ok(Arc::new(Loop {
            header: definition.header(),
            iterator: registry.construct_value(raw.iterator)?,
            body: registry.construct_value(raw.body)?,
        }) as Arc<dyn Task>)
    }))
}

impl Loop {
    pub fn new(name: impl Into<String>, iterator: Arc<dyn Task>, body: Arc<dyn Task>) -> Self {
        Loop {
            header: TaskHeader::new(name, TYPE_LOOP),
            iterator,
            body,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.header.timeout = Some(timeout);
        self
    }

    pub fn build(self) -> Arc<dyn Task> {
        Arc::new(self)
    }

    async fn run(&self, ctx: &Context, input: &Input) -> Result<Output, TaskError> {
        let trace = ctx.trace().child(&self.header.name);
        let ctx = ctx.with_trace(trace.clone());

        let iterator_name = self.iterator.header().name.clone();
        let iterator_output = trace
            .wrap(self.iterator.clone())
            .execute(&ctx, input)
            .await?;
        let Some(iterator) = iterator_output.iterator() else {
            return Err(TaskError::BadIterator(iterator_name));
        };

        let mut output = Output::new();
        let mut iteration: i64 = 0;
        loop {
            let Some(result) = iterator.next().await else {
                break;
            };
            if let Some(err) = result.err {
                iterator.stop();
                return Err(err);
            }

            input.add(iterator_name.clone(), result.output);
            let body_output = match trace.wrap(self.body.clone()).execute(&ctx, input).await {
                Ok(body_output) => body_output,
                Err(err) => {
                    iterator.stop();
                    return Err(err);
                }
            };

            let terminated = body_output.is_terminated();
            output.insert(iteration.to_string(), body_output.into_value());
            iteration += 1;
            if terminated {
                iterator.stop();
                break;
            }
        }

        tracing::debug!(task = %self.header.name, iterations = iteration, "loop finished");
        output.insert("iteration", iteration);
        Ok(output)
    }
}

#[async_trait]
impl Task for Loop {
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
