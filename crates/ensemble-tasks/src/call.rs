//! Call: loads another task definition through a registered loader and
//! executes it in a fresh scope.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as Json;

use ensemble_core::{
    ConstructError, Context, Expr, Input, Output, Registry, Task, TaskError, TaskFactory,
    TaskHeader,
};

pub const TYPE_CALL: &str = "call";

#[derive(Deserialize)]
struct CallInput {
    loader: String,
    task: String,
    #[serde(default)]
    raw: bool,
    #[serde(default)]
    input: Json,
}

/// A composite task that invokes a separately-loaded workflow.
///
/// The loader and the referenced definition are resolved at construction
/// time. At execution the `input` map is evaluated (or passed literally with
/// `raw: true`) and becomes the callee's entire environment; the caller's
/// environment is not visible inside. A `terminated` flag on the callee's
/// result is cleared, since termination is scoped to the called workflow.
pub struct Call {
    header: TaskHeader,
    raw: bool,
    input: Expr<serde_json::Map<String, Json>>,
    task: Arc<dyn Task>,
}

pub fn register(registry: &mut Registry) -> Result<(), ConstructError> {
    registry.register(TaskFactory::new(TYPE_CALL, |registry, definition| {
        let raw: CallInput = crate::common::decode_input(&definition.input)?;
        let loader = registry.loader(&raw.loader)?;
        let loaded = loader.load(&raw.task)?;
        let task = registry.construct_value(Json::Object(loaded))?;
        Ok(Arc::new(Call {
            header: definition.header(),
            raw: raw.raw,
            input: Expr::new(raw.input),
            task,
        }) as Arc<dyn Task>)
    }))
}

impl Call {
    fn scoped_input(&self, input: &Input) -> Result<Input, TaskError> {
        if self.raw {
            return match self.input.raw() {
                Json::Object(entries) => Ok(Input::new(entries.clone())),
                Json::Null => Ok(Input::default()),
                _ => Err(TaskError::failed("call input must be a map")),
            };
        }
        if self.input.is_empty() {
            return Ok(Input::default());
        }
        Ok(Input::new(self.input.evaluate(input)?))
    }
}

#[async_trait]
impl Task for Call {
    fn header(&self) -> &TaskHeader {
        &self.header
    }

    async fn execute(&self, ctx: &Context, input: &Input) -> Result<Output, TaskError> {
        let trace = ctx.trace().child(&self.header.name);
        let ctx = ctx.with_trace(trace.clone());

        // The called workflow runs in its own scope.
        let scoped = self.scoped_input(input)?;
        let mut output = trace.wrap(self.task.clone()).execute(&ctx, &scoped).await?;

        // Termination only works within the called workflow.
        output.clear_terminated();
        Ok(output)
    }
}
