//! Terminate: ends the enclosing serial or loop scope, either with a final
//! output or by raising an error.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as Json;

use ensemble_core::{
    ConstructError, Context, Expr, Input, Output, Registry, Task, TaskError, TaskFactory,
    TaskHeader,
};

pub const TYPE_TERMINATE: &str = "terminate";

#[derive(Deserialize)]
struct TerminateInput {
    #[serde(default)]
    output: Json,
    #[serde(default)]
    error: Json,
}

/// A leaf task that stops the surrounding scope.
///
/// When the evaluated `error` is a non-empty message the task fails with
/// exactly that message. Otherwise it returns the evaluated `output` with
/// the reserved `terminated` flag set, which the enclosing serial or loop
/// recovers without surfacing an error.
pub struct Terminate {
    header: TaskHeader,
    output: Expr<serde_json::Map<String, Json>>,
    error: Expr<String>,
}

pub fn register(registry: &mut Registry) -> Result<(), ConstructError> {
    registry.register(TaskFactory::new(TYPE_TERMINATE, |_registry, definition| {
        let raw: TerminateInput = crate::common::decode_input(&definition.input)?;
        Ok(Arc::new(Terminate {
            header: definition.header(),
            output: Expr::new(raw.output),
            error: Expr::new(raw.error),
        }) as Arc<dyn Task>)
    }))
}

impl Terminate {
    pub fn new(name: impl Into<String>) -> Self {
        Terminate {
            header: TaskHeader::new(name, TYPE_TERMINATE),
            output: Expr::default(),
            error: Expr::default(),
        }
    }

    pub fn with_output(mut self, output: impl Into<Json>) -> Self {
        self.output = Expr::new(output);
        self
    }

    pub fn with_error(mut self, error: impl Into<Json>) -> Self {
        self.error = Expr::new(error);
        self
    }

    pub fn build(self) -> Arc<dyn Task> {
        Arc::new(self)
    }
}

#[async_trait]
impl Task for Terminate {
    fn header(&self) -> &TaskHeader {
        &self.header
    }

    async fn execute(&self, _ctx: &Context, input: &Input) -> Result<Output, TaskError> {
        if !self.error.is_empty() {
            let message = self.error.evaluate(input)?;
            if !message.is_empty() {
                return Err(TaskError::Failed(message));
            }
        }

        let mut output = if self.output.is_empty() {
            Output::new()
        } else {
            Output::from_json_map(self.output.evaluate(input)?)
        };
        output.set_terminated();
        Ok(output)
    }
}
