//! Bridge to the embedded Rhai engine: the `$` expression dialect and the
//! script bodies of code tasks.
//!
//! The engine is an external collaborator; what the engine module pins down
//! is the value-conversion contract. Environment maps cross into scripts as
//! object maps (readable and writable with attribute syntax, missing keys
//! yield unit), and opaque handles cross as typed dynamics that scripts can
//! probe with `isiterator`.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use rhai::serde::to_dynamic;
use rhai::{Array, Dynamic, Engine, EvalAltResult, ImmutableString, Map as ScriptMap, Scope};

use crate::actor::{ActorBehavior, ActorHandle};
use crate::error::TaskError;
use crate::iterator::IteratorHandle;
use crate::value::Value;

static ENGINE: LazyLock<Engine> = LazyLock::new(|| {
    let mut engine = Engine::new();
    engine.register_fn("getenv", |name: ImmutableString| -> String {
        std::env::var(name.as_str()).unwrap_or_default()
    });
    engine.register_fn(
        "jsonencode",
        |value: Dynamic| -> Result<String, Box<EvalAltResult>> {
            let value =
                from_dynamic_value(value).map_err(|e| -> Box<EvalAltResult> { e.to_string().into() })?;
            serde_json::to_string(&value.to_json_lossy())
                .map_err(|e| -> Box<EvalAltResult> { e.to_string().into() })
        },
    );
    engine.register_fn(
        "jsondecode",
        |text: ImmutableString| -> Result<Dynamic, Box<EvalAltResult>> {
            let json: serde_json::Value = serde_json::from_str(text.as_str())
                .map_err(|e| -> Box<EvalAltResult> { e.to_string().into() })?;
            to_dynamic(json)
        },
    );
    engine.register_fn("isiterator", |value: Dynamic| -> bool {
        value.is::<IteratorHandle>()
    });
    engine
});

/// Evaluates a single expression against the environment.
pub fn evaluate(source: &str, env: &BTreeMap<String, Value>) -> Result<Value, TaskError> {
    let mut scope = Scope::new();
    for (name, value) in env {
        scope.push_dynamic(name.as_str(), to_dynamic_value(value));
    }
    let result = ENGINE
        .eval_expression_with_scope::<Dynamic>(&mut scope, source)
        .map_err(|e| TaskError::Evaluation(e.to_string()))?;
    from_dynamic_value(result)
}

/// Runs a script that defines `fn main(env)` and returns what the function
/// returns. The environment is passed as a single map argument.
pub fn call(source: &str, env: &BTreeMap<String, Value>) -> Result<Value, TaskError> {
    let ast = ENGINE
        .compile(source)
        .map_err(|e| TaskError::Evaluation(e.to_string()))?;
    let mut env_map = ScriptMap::new();
    for (name, value) in env {
        env_map.insert(name.as_str().into(), to_dynamic_value(value));
    }
    let mut scope = Scope::new();
    let result = ENGINE
        .call_fn::<Dynamic>(&mut scope, &ast, "main", (Dynamic::from_map(env_map),))
        .map_err(|e| TaskError::Evaluation(e.to_string()))?;
    from_dynamic_value(result)
}

fn to_dynamic_value(value: &Value) -> Dynamic {
    match value {
        Value::Null => Dynamic::UNIT,
        Value::Bool(b) => (*b).into(),
        Value::Int(i) => (*i).into(),
        Value::Float(x) => (*x).into(),
        Value::String(s) => s.clone().into(),
        Value::Array(items) => Dynamic::from_array(items.iter().map(to_dynamic_value).collect()),
        Value::Map(entries) => {
            let mut map = ScriptMap::new();
            for (key, value) in entries {
                map.insert(key.as_str().into(), to_dynamic_value(value));
            }
            Dynamic::from_map(map)
        }
        Value::Iterator(handle) => Dynamic::from(handle.clone()),
        Value::Behavior(behavior) => Dynamic::from(behavior.clone()),
        Value::Actor(handle) => Dynamic::from(handle.clone()),
    }
}

fn from_dynamic_value(value: Dynamic) -> Result<Value, TaskError> {
    if value.is_unit() {
        return Ok(Value::Null);
    }
    if let Ok(b) = value.as_bool() {
        return Ok(Value::Bool(b));
    }
    if let Ok(i) = value.as_int() {
        return Ok(Value::Int(i));
    }
    if let Ok(x) = value.as_float() {
        return Ok(Value::Float(x));
    }
    if value.is::<IteratorHandle>() {
        return Ok(Value::Iterator(value.cast::<IteratorHandle>()));
    }
    if value.is::<ActorBehavior>() {
        return Ok(Value::Behavior(value.cast::<ActorBehavior>()));
    }
    if value.is::<ActorHandle>() {
        return Ok(Value::Actor(value.cast::<ActorHandle>()));
    }
    if value.is_string() {
        return value
            .into_string()
            .map(Value::String)
            .map_err(|e| TaskError::Evaluation(e.to_string()));
    }
    if value.is_array() {
        let items = value.cast::<Array>();
        return items
            .into_iter()
            .map(from_dynamic_value)
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array);
    }
    if value.is_map() {
        let entries = value.cast::<ScriptMap>();
        let mut map = BTreeMap::new();
        for (key, value) in entries {
            map.insert(key.to_string(), from_dynamic_value(value)?);
        }
        return Ok(Value::Map(map));
    }
    Err(TaskError::Evaluation(format!(
        "unsupported script value of type {}",
        value.type_name()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::Context;
    use crate::value::Output;

    fn env_with(name: &str, value: Value) -> BTreeMap<String, Value> {
        let mut env = BTreeMap::new();
        env.insert(name.to_string(), value);
        env
    }

    #[test]
    fn test_map_fields_read_with_attribute_syntax() {
        let mut inner = BTreeMap::new();
        inner.insert("n".to_string(), Value::Int(7));
        let env = env_with("task", Value::Map(inner));

        assert_eq!(evaluate("task.n + 1", &env).unwrap(), Value::Int(8));
        // Missing fields read as unit rather than failing.
        assert_eq!(evaluate("task.missing", &env).unwrap(), Value::Null);
    }

    #[test]
    fn test_json_helpers_round_trip() {
        let env = BTreeMap::new();
        assert_eq!(
            evaluate(r#"jsondecode("{\"a\": 1}").a"#, &env).unwrap(),
            Value::Int(1)
        );
        assert_eq!(
            evaluate(r#"jsonencode(#{"a": 1})"#, &env).unwrap(),
            Value::String(r#"{"a":1}"#.to_string())
        );
    }

    #[test]
    fn test_isiterator_distinguishes_handles() {
        tokio_test::block_on(async {
            let ctx = Context::new();
            let handle = IteratorHandle::new(&ctx, |sender| async move {
                sender.send(Output::new(), None).await;
                sender.end();
            });
            let mut env = env_with("stream", Value::Iterator(handle));
            env.insert("plain".to_string(), Value::Int(3));

            assert_eq!(evaluate("isiterator(stream)", &env).unwrap(), Value::Bool(true));
            assert_eq!(evaluate("isiterator(plain)", &env).unwrap(), Value::Bool(false));
        });
    }

    #[test]
    fn test_call_invokes_main_with_environment() {
        let mut inner = BTreeMap::new();
        inner.insert("values".to_string(), Value::Array(vec![Value::Int(1), Value::Int(2)]));
        let env = env_with("input", Value::Map(inner));

        let script = r#"
            fn main(env) {
                let total = 0;
                for v in env.input.values {
                    total += v;
                }
                #{"total": total}
            }
        "#;
        let result = call(script, &env).unwrap();
        let map = result.as_map().expect("map result");
        assert_eq!(map.get("total"), Some(&Value::Int(3)));
    }
}
