//! Iterate: turns a list, map or integer range into a streaming iterator.
//! Always used as the iterator subtask of a loop.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as Json;

use ensemble_core::{
    ConstructError, Context, Expr, Input, IteratorHandle, Output, Registry, Task, TaskError,
    TaskFactory, TaskHeader, Value,
};

pub const TYPE_ITERATE: &str = "iterate";

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum IterateKind {
    List,
    Map,
    Range,
}

#[derive(Deserialize)]
struct IterateInput {
    #[serde(rename = "type")]
    kind: IterateKind,
    #[serde(default)]
    value: Json,
}

/// A leaf task that produces an iterator over an evaluated value.
///
/// - `list` emits `{"value": v}` in sequence order
/// - `map` emits `{"key": k, "value": v}` with keys in ascending order
/// - `range` takes `[start, stop]` or `[start, stop, step]` with a positive
///   step and emits `{"value": n}` for each n in the half-open interval
pub struct Iterate {
    header: TaskHeader,
    kind: IterateKind,
    value: Json,
}

pub fn register(registry: &mut Registry) -> Result<(), ConstructError> {
    registry.register(TaskFactory::new(TYPE_ITERATE, |_registry, definition| {
        let raw: IterateInput = crate::common::decode_input(&definition.input)?;
        Ok(Arc::new(Iterate {
            header: definition.header(),
            kind: raw.kind,
            value: raw.value,
        }) as Arc<dyn Task>)
    }))
}

impl Iterate {
    pub fn list(name: impl Into<String>, value: impl Into<Json>) -> Self {
        Self::new(name, IterateKind::List, value)
    }

    pub fn map(name: impl Into<String>, value: impl Into<Json>) -> Self {
        Self::new(name, IterateKind::Map, value)
    }

    pub fn range(name: impl Into<String>, value: impl Into<Json>) -> Self {
        Self::new(name, IterateKind::Range, value)
    }

    fn new(name: impl Into<String>, kind: IterateKind, value: impl Into<Json>) -> Self {
        Iterate {
            header: TaskHeader::new(name, TYPE_ITERATE),
            kind,
            value: value.into(),
        }
    }

    pub fn build(self) -> Arc<dyn Task> {
        Arc::new(self)
    }

    fn typed<T: serde::de::DeserializeOwned>(&self, input: &Input) -> Result<T, TaskError> {
        Expr::<T>::new(self.value.clone()).evaluate(input)
    }

    fn items(&self, input: &Input) -> Result<Vec<Output>, TaskError> {
        match self.kind {
            IterateKind::List => {
                let values: Vec<Json> = self.typed(input)?;
                Ok(values
                    .into_iter()
                    .map(|v| {
                        let mut item = Output::new();
                        item.insert("value", Value::from_json(v));
                        item
                    })
                    .collect())
            }
            IterateKind::Map => {
                // BTreeMap keeps the keys in ascending order.
                let values: BTreeMap<String, Json> = self.typed(input)?;
                Ok(values
                    .into_iter()
                    .map(|(k, v)| {
                        let mut item = Output::new();
                        item.insert("key", k);
                        item.insert("value", Value::from_json(v));
                        item
                    })
                    .collect())
            }
            IterateKind::Range => {
                let bounds: Vec<i64> = self.typed(input)?;
                let (start, stop, step) = match bounds.as_slice() {
                    [start, stop] => (*start, *stop, 1),
                    [start, stop, step] => (*start, *stop, *step),
                    _ => {
                        return Err(TaskError::failed(format!(
                            "bad iterate value length: want 2 or 3 but got {}",
                            bounds.len()
                        )))
                    }
                };
                if step <= 0 {
                    return Err(TaskError::failed("bad iterate range: step must be positive"));
                }
                Ok((start..stop)
                    .step_by(step as usize)
                    .map(|n| {
                        let mut item = Output::new();
                        item.insert("value", n);
                        item
                    })
                    .collect())
            }
        }
    }
}

#[async_trait]
impl Task for Iterate {
    fn header(&self) -> &TaskHeader {
        &self.header
    }

    async fn execute(&self, ctx: &Context, input: &Input) -> Result<Output, TaskError> {
        if self.value.is_null() {
            return Err(TaskError::failed("bad iterate value"));
        }
        let items = self.items(input)?;

        let iterator = IteratorHandle::new(ctx, move |sender| async move {
            for item in items {
                if !sender.send(item, None).await {
                    return;
                }
            }
            sender.end();
        });

        let mut output = Output::new();
        output.insert("iterator", Value::Iterator(iterator));
        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn collect(task: Arc<dyn Task>, input: &Input) -> Vec<Output> {
        let output = task.execute(&Context::new(), input).await.unwrap();
        let iterator = output.iterator().expect("iterator handle");
        let mut items = Vec::new();
        while let Some(result) = iterator.next().await {
            assert!(result.err.is_none());
            items.push(result.output);
        }
        items
    }

    #[test]
    fn test_list_preserves_sequence_order() {
        tokio_test::block_on(async {
            let task = Iterate::list("it", json!(["b", "a"])).build();
            let items = collect(task, &Input::default()).await;
            assert_eq!(items.len(), 2);
            assert_eq!(items[0].get("value"), Some(&Value::String("b".into())));
            assert_eq!(items[1].get("value"), Some(&Value::String("a".into())));
        });
    }

    #[test]
    fn test_map_yields_keys_in_ascending_order() {
        tokio_test::block_on(async {
            let task = Iterate::map("it", json!({"c": 3, "a": 1, "b": 2})).build();
            let items = collect(task, &Input::default()).await;
            let keys: Vec<_> = items
                .iter()
                .map(|item| item.get("key").and_then(Value::as_str).unwrap().to_string())
                .collect();
            assert_eq!(keys, vec!["a", "b", "c"]);
        });
    }

    #[test]
    fn test_range_is_half_open() {
        tokio_test::block_on(async {
            let task = Iterate::range("it", json!([3, 6])).build();
            let items = collect(task, &Input::default()).await;
            let values: Vec<_> = items
                .iter()
                .map(|item| item.get("value").and_then(Value::as_int).unwrap())
                .collect();
            assert_eq!(values, vec![3, 4, 5]);
        });
    }

    #[test]
    fn test_range_bounds_are_validated() {
        tokio_test::block_on(async {
            let task = Iterate::range("it", json!([1])).build();
            let err = task
                .execute(&Context::new(), &Input::default())
                .await
                .unwrap_err();
            assert!(err.to_string().contains("want 2 or 3"));

            let task = Iterate::range("it", json!([1, 5, 0])).build();
            let err = task
                .execute(&Context::new(), &Input::default())
                .await
                .unwrap_err();
            assert!(err.to_string().contains("step must be positive"));
        });
    }

    #[test]
    fn test_range_bounds_evaluate_templates() {
        tokio_test::block_on(async {
            let input = Input::default();
            input.add("config", {
                let mut output = Output::new();
                output.insert("stop", 5);
                output
            });
            let task = Iterate::range("it", json!([3, "${config.stop}"])).build();
            let items = collect(task, &input).await;
            assert_eq!(items.len(), 2);
        });
    }
}
