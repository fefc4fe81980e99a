//! Decision: evaluates an expression and dispatches to the matching case,
//! falling back to the default when no case matches.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as Json;

use ensemble_core::{
    ConstructError, Context, Expr, Input, Output, Registry, Task, TaskError, TaskFactory,
    TaskHeader, Value,
};

pub const TYPE_DECISION: &str = "decision";

#[derive(Deserialize)]
struct DecisionInput {
    #[serde(default)]
    expression: Json,
    #[serde(default)]
    cases: serde_json::Map<String, Json>,
    #[serde(default)]
    default: Option<Json>,
}

/// A composite task that picks one subtask by the evaluated value of its
/// expression.
///
/// Document case keys are JSON object keys, i.e. strings; matching uses the
/// evaluated value's canonical rendering, so expression `1` selects case
/// `"1"` and `true` selects case `"true"`.
pub struct Decision {
    header: TaskHeader,
    expression: Expr<Json>,
    cases: HashMap<String, Arc<dyn Task>>,
    default_task: Option<Arc<dyn Task>>,
}

pub fn register(registry: &mut Registry) -> Result<(), ConstructError> {
    registry.register(TaskFactory::new(TYPE_DECISION, |registry, definition| {
        let raw: DecisionInput = crate::common::decode_input(&definition.input)?;

        let mut names = HashSet::new();
        let mut cases = HashMap::with_capacity(raw.cases.len());
        for (case, case_definition) in raw.cases {
            let task = registry.construct_value(case_definition)?;
            if !names.insert(task.header().name.clone()) {
                return Err(ConstructError::DuplicateTaskName(
                    task.header().name.clone(),
                ));
            }
            cases.insert(case, task);
        }
        let default_task = raw
            .default
            .map(|definition| registry.construct_value(definition))
            .transpose()?;

        Ok(Arc::new(Decision {
            header: definition.header(),
            expression: Expr::new(raw.expression),
            cases,
            default_task,
        }) as Arc<dyn Task>)
    }))
}

fn case_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

impl Decision {
    pub fn new(name: impl Into<String>) -> Self {
        Decision {
            header: TaskHeader::new(name, TYPE_DECISION),
            expression: Expr::default(),
            cases: HashMap::new(),
            default_task: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.header.timeout = Some(timeout);
        self
    }

    pub fn with_expression(mut self, expression: impl Into<Json>) -> Self {
        self.expression = Expr::new(expression);
        self
    }

    pub fn with_case(mut self, case: impl Into<String>, task: Arc<dyn Task>) -> Self {
        self.cases.insert(case.into(), task);
        self
    }

    pub fn with_default(mut self, task: Arc<dyn Task>) -> Self {
        self.default_task = Some(task);
        self
    }

    pub fn build(self) -> Arc<dyn Task> {
        Arc::new(self)
    }
}

#[async_trait]
impl Task for Decision {
    fn header(&self) -> &TaskHeader {
        &self.header
    }

    async fn execute(&self, ctx: &Context, input: &Input) -> Result<Output, TaskError> {
        let trace = ctx.trace().child(&self.header.name);
        let ctx = ctx.with_trace(trace.clone());

        let value = self.expression.evaluate_value(input)?;
        let key = case_key(&value);
        let chosen = self
            .cases
            .get(&key)
            .or(self.default_task.as_ref())
            .cloned();
        tracing::debug!(task = %self.header.name, case = %key, matched = chosen.is_some(), "decision evaluated");

        match chosen {
            Some(task) => trace.wrap(task).execute(&ctx, input).await,
            None => Ok(Output::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::func::Func;

    fn result_task(name: &str, result: &str) -> Arc<dyn Task> {
        let result = result.to_string();
        Func::new(name, move |_ctx, _input| {
            let result = result.clone();
            async move {
                let mut output = Output::new();
                output.insert("result", result);
                Ok(output)
            }
        })
        .build()
    }

    #[test]
    fn test_matching_case_wins() {
        tokio_test::block_on(async {
            let flow = Decision::new("pick")
                .with_expression(0)
                .with_case("0", result_task("case_0", "case_0"))
                .with_default(result_task("fallback", "default"))
                .build();

            let output = flow
                .execute(&Context::new(), &Input::default())
                .await
                .unwrap();
            assert_eq!(output.get("result"), Some(&Value::String("case_0".into())));
        });
    }

    #[test]
    fn test_unmatched_expression_falls_back_to_default() {
        tokio_test::block_on(async {
            let flow = Decision::new("pick")
                .with_expression(1)
                .with_case("0", result_task("case_0", "case_0"))
                .with_default(result_task("fallback", "default"))
                .build();

            let output = flow
                .execute(&Context::new(), &Input::default())
                .await
                .unwrap();
            assert_eq!(output.get("result"), Some(&Value::String("default".into())));
        });
    }

    #[test]
    fn test_no_case_and_no_default_yields_empty_output() {
        tokio_test::block_on(async {
            let flow = Decision::new("pick").with_expression(9).build();
            let output = flow
                .execute(&Context::new(), &Input::default())
                .await
                .unwrap();
            assert!(output.is_empty());
        });
    }
}
