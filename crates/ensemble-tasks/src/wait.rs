//! Wait: pauses an asynchronous flow until the host supplies the next
//! input, optionally announcing the pause with an output payload and the
//! schema the next input must satisfy.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as Json;

use ensemble_core::{
    ActorBehavior, ConstructError, Context, Expr, Input, Output, Registry, Schema, Task,
    TaskError, TaskFactory, TaskHeader, Value,
};

pub const TYPE_WAIT: &str = "wait";

#[derive(Deserialize)]
struct WaitInput {
    #[serde(default)]
    output: Json,
    #[serde(default)]
    input_schema: serde_json::Map<String, Json>,
}

/// A leaf task that hands control back to the host of an asynchronous flow.
///
/// Must execute inside an async serial: it takes the actor behavior from the
/// environment, sends a `status: "pause"` message when it has an output to
/// announce, then blocks on the inbox. The received map is validated against
/// `input_schema` and returned under `input`.
pub struct Wait {
    header: TaskHeader,
    output: Expr<serde_json::Map<String, Json>>,
    input_schema: serde_json::Map<String, Json>,
}

pub fn register(registry: &mut Registry) -> Result<(), ConstructError> {
    registry.register(TaskFactory::new(TYPE_WAIT, |_registry, definition| {
        let raw: WaitInput = crate::common::decode_input(&definition.input)?;
        Ok(Arc::new(Wait {
            header: definition.header(),
            output: Expr::new(raw.output),
            input_schema: raw.input_schema,
        }) as Arc<dyn Task>)
    }))
}

impl Wait {
    pub fn new(name: impl Into<String>) -> Self {
        Wait {
            header: TaskHeader::new(name, TYPE_WAIT),
            output: Expr::default(),
            input_schema: serde_json::Map::new(),
        }
    }

    pub fn with_output(mut self, output: impl Into<Json>) -> Self {
        self.output = Expr::new(output);
        self
    }

    pub fn with_input_schema(mut self, schema: serde_json::Map<String, Json>) -> Self {
        self.input_schema = schema;
        self
    }

    pub fn build(self) -> Arc<dyn Task> {
        Arc::new(self)
    }

    fn behavior(&self, input: &Input) -> Result<ActorBehavior, TaskError> {
        if let Some(Value::Map(port)) = input.get("actor") {
            if let Some(Value::Behavior(behavior)) = port.get("behavior") {
                return Ok(behavior.clone());
            }
        }
        Err(TaskError::failed(format!(
            "task {:?} (of type wait) must be used within an asynchronous flow",
            self.header.name
        )))
    }
}

#[async_trait]
impl Task for Wait {
    fn header(&self) -> &TaskHeader {
        &self.header
    }

    async fn execute(&self, _ctx: &Context, input: &Input) -> Result<Output, TaskError> {
        let behavior = self.behavior(input)?;

        let payload = if self.output.is_empty() {
            serde_json::Map::new()
        } else {
            self.output.evaluate(input)?
        };
        if !payload.is_empty() {
            let mut pause = Output::new();
            pause.insert("output", Value::from_json(Json::Object(payload)));
            pause.insert(
                "input_schema",
                Value::from_json(Json::Object(self.input_schema.clone())),
            );
            pause.insert("status", "pause");
            behavior.send(pause, None).await;
        }

        let Some(received) = behavior.receive().await else {
            return Err(TaskError::Canceled);
        };

        let schema = Schema {
            input: self.input_schema.clone(),
            output: serde_json::Map::new(),
        };
        schema.validate(&received)?;

        let mut output = Output::new();
        output.insert("input", Value::from_json(Json::Object(received)));
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};
    use std::time::Duration;

    use crate::func::Func;
    use crate::serial::Serial;

    #[test]
    fn test_wait_outside_an_async_flow_fails() {
        tokio_test::block_on(async {
            let task = Wait::new("ask").build();
            let err = task
                .execute(&Context::new(), &Input::default())
                .await
                .unwrap_err();
            assert!(err.to_string().contains("asynchronous flow"));
        });
    }

    #[test]
    fn test_wait_pauses_and_resumes_with_host_input() {
        tokio_test::block_on(async {
            let schema = json!({
                "type": "object",
                "required": ["name"],
            });
            let ask = Wait::new("ask")
                .with_output(json!({"question": "who goes there?"}))
                .with_input_schema(schema.as_object().cloned().unwrap())
                .build();
            let answer = Func::new("answer", |_ctx, input: Input| async move {
                let name = Expr::<String>::new("${ask.input.name}").evaluate(&input)?;
                let mut output = Output::new();
                output.insert("hello", name);
                Ok(output)
            })
            .build();

            let flow = Serial::new("interactive")
                .asynchronous(true)
                .with_tasks(vec![ask, answer])
                .build();
            let output = flow
                .execute(&Context::new(), &Input::default())
                .await
                .unwrap();
            let actor = output.actor().expect("actor handle");

            let paused = actor.receive().await.expect("pause message");
            assert_eq!(
                paused.output.get("status"),
                Some(&Value::String("pause".into()))
            );
            assert_eq!(
                paused.output.get("output"),
                Some(&Value::from_json(json!({"question": "who goes there?"})))
            );

            let mut reply = Map::new();
            reply.insert("name".to_string(), json!("world"));
            assert!(actor.send(reply).await);

            let finished = actor.receive().await.expect("final result");
            assert!(finished.err.is_none());
            assert_eq!(
                finished.output.get("hello"),
                Some(&Value::String("world".into()))
            );
        });
    }

    #[test]
    fn test_schema_violation_surfaces_on_the_outbox() {
        tokio_test::block_on(async {
            let schema = json!({
                "type": "object",
                "required": ["name"],
            });
            let ask = Wait::new("ask")
                .with_output(json!({"question": "who goes there?"}))
                .with_input_schema(schema.as_object().cloned().unwrap())
                .build();

            let flow = Serial::new("interactive")
                .asynchronous(true)
                .with_tasks(vec![ask])
                .build();
            let output = flow
                .execute(&Context::new(), &Input::default())
                .await
                .unwrap();
            let actor = output.actor().expect("actor handle");

            let _paused = actor.receive().await.expect("pause message");
            assert!(actor.send(Map::new()).await);

            let failed = actor.receive().await.expect("error result");
            let err = failed.err.expect("schema error");
            assert!(err.to_string().contains("missing required field 'name'"));
        });
    }

    #[test]
    fn test_cancelled_wait_reports_cancellation() {
        tokio_test::block_on(async {
            let ask = Wait::new("ask").build();
            let flow = Serial::new("interactive")
                .asynchronous(true)
                .with_tasks(vec![ask])
                .build();
            let output = flow
                .execute(&Context::new(), &Input::default())
                .await
                .unwrap();
            let actor = output.actor().expect("actor handle");

            // No pause output was configured, so the wait sits straight on
            // the inbox until the host stops the actor.
            tokio::time::sleep(Duration::from_millis(20)).await;
            actor.stop();
            if let Some(result) = actor.receive().await {
                assert_eq!(result.err, Some(TaskError::Canceled));
            }
        });
    }
}
