//! Code: executes an embedded script against the environment.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;

use ensemble_core::{
    script, ConstructError, Context, Input, Output, Registry, Task, TaskError, TaskFactory,
    TaskHeader, Value,
};

pub const TYPE_CODE: &str = "code";

#[derive(Deserialize)]
struct CodeInput {
    code: String,
}

/// A leaf task that runs a script snippet defining `fn main(env)`, where
/// `env` holds the root input and the outputs of previously executed tasks.
///
/// A map return value becomes the output directly; anything else is wrapped
/// as `{"result": value}`.
///
/// ```text
/// fn main(env) {
///     #{"doubled": env.input.n * 2}
/// }
/// ```
pub struct Code {
    header: TaskHeader,
    code: String,
}

pub fn register(registry: &mut Registry) -> Result<(), ConstructError> {
    registry.register(TaskFactory::new(TYPE_CODE, |_registry, definition| {
        let raw: CodeInput = crate::common::decode_input(&definition.input)?;
        Ok(Arc::new(Code {
            header: definition.header(),
            code: raw.code,
        }) as Arc<dyn Task>)
    }))
}

impl Code {
    pub fn new(name: impl Into<String>, code: impl Into<String>) -> Self {
        Code {
            header: TaskHeader::new(name, TYPE_CODE),
            code: code.into(),
        }
    }

    pub fn build(self) -> Arc<dyn Task> {
        Arc::new(self)
    }
}

#[async_trait]
impl Task for Code {
    fn header(&self) -> &TaskHeader {
        &self.header
    }

    async fn execute(&self, _ctx: &Context, input: &Input) -> Result<Output, TaskError> {
        match script::call(&self.code, &input.env())? {
            Value::Map(entries) => Ok(Output::from(entries)),
            other => {
                let mut output = Output::new();
                output.insert("result", other);
                Ok(output)
            }
        }
    }
}
