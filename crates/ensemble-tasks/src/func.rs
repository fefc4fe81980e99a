//! Func: wraps a host-provided callable as a leaf task.

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;

use ensemble_core::{
    ConstructError, Context, Input, Output, Registry, Task, TaskError, TaskFactory, TaskHeader,
};

pub const TYPE_FUNC: &str = "func";

type FuncBody =
    Arc<dyn Fn(Context, Input) -> BoxFuture<'static, Result<Output, TaskError>> + Send + Sync>;

/// A leaf task that executes a host-provided callable with the current
/// context and environment.
///
/// Only buildable programmatically; a callable cannot appear in a JSON
/// definition document, so the registered factory reports exactly that.
pub struct Func {
    header: TaskHeader,
    body: FuncBody,
}

pub fn register(registry: &mut Registry) -> Result<(), ConstructError> {
    registry.register(TaskFactory::new(TYPE_FUNC, |_registry, _definition| {
        Err(ConstructError::Definition(
            "func tasks carry a host callable and cannot be constructed from a definition"
                .to_string(),
        ))
    }))
}

impl Func {
    pub fn new<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Context, Input) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Output, TaskError>> + Send + 'static,
    {
        Func {
            header: TaskHeader::new(name, TYPE_FUNC),
            body: Arc::new(move |ctx, input| Box::pin(f(ctx, input))),
        }
    }

    pub fn build(self) -> Arc<dyn Task> {
        Arc::new(self)
    }
}

#[async_trait]
impl Task for Func {
    fn header(&self) -> &TaskHeader {
        &self.header
    }

    async fn execute(&self, ctx: &Context, input: &Input) -> Result<Output, TaskError> {
        (self.body)(ctx.clone(), input.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ensemble_core::Value;

    #[test]
    fn test_func_runs_the_callable() {
        tokio_test::block_on(async {
            let task = Func::new("answer", |_ctx, _input| async move {
                let mut output = Output::new();
                output.insert("n", 42);
                Ok(output)
            })
            .build();

            let output = task
                .execute(&Context::new(), &Input::default())
                .await
                .unwrap();
            assert_eq!(output.get("n"), Some(&Value::Int(42)));
        });
    }

    #[test]
    fn test_func_cannot_be_constructed_from_a_document() {
        let registry = crate::registry();
        let err = registry
            .construct_from_json(r#"{"name": "f", "type": "func"}"#)
            .unwrap_err();
        assert!(err.to_string().contains("cannot be constructed"));
    }
}
