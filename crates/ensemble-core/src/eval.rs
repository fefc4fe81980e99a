//! Template evaluation.
//!
//! Task input fields may embed expression variables inside string leaves:
//!
//! - `${…}` — a script expression (the primary dialect)
//! - `#{…}` — a predicate expression over scalar environment leaves
//! - `@{…}` — a JSON-path lookup against the environment
//!
//! A template that consists of exactly one variable evaluates to the raw
//! value, preserving numbers, collections and handles. Anything else is
//! substituted textually.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::{Arc, LazyLock, RwLock};

use regex::{Captures, Regex};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};
use serde_json::Value as Json;

use crate::error::TaskError;
use crate::script;
use crate::value::{Output, Value};

// One level of nested braces is enough for the comprehension-style bodies
// scripts tend to use; deeper nesting would need a real parser.
const VAR_BODY: &str = r"(?:[^{}]+|[^{]*\{[^{}]*\}[^}]*)";

static VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?:\$|#|@)\{{{VAR_BODY}\}}")).expect("variable pattern")
});

static WHOLE_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"^(\$|#|@)\{{({VAR_BODY})\}}$")).expect("whole-variable pattern")
});

/// The mutable name→value environment templates are evaluated against.
#[derive(Debug, Default)]
pub struct Evaluator {
    data: RwLock<BTreeMap<String, Value>>,
}

impl Evaluator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds or overwrites a top-level name.
    pub fn add(&self, name: impl Into<String>, value: Value) {
        self.data.write().unwrap().insert(name.into(), value);
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.data.read().unwrap().get(name).cloned()
    }

    /// A snapshot of the full environment.
    pub fn env(&self) -> BTreeMap<String, Value> {
        self.data.read().unwrap().clone()
    }

    /// Evaluates a possibly-templated string.
    pub fn evaluate(&self, template: &str) -> Result<Value, TaskError> {
        let matches: Vec<(usize, usize)> = VAR_PATTERN
            .find_iter(template)
            .map(|m| (m.start(), m.end()))
            .collect();
        if matches.is_empty() {
            return Ok(Value::String(template.to_string()));
        }

        if matches.len() == 1 && matches[0] == (0, template.len()) {
            // The variable is the whole string: return the raw value.
            return self.evaluate_variable(template).map_err(|e| {
                TaskError::Evaluation(format!("failed to evaluate '{template}': {e}"))
            });
        }

        let mut errors: Vec<String> = Vec::new();
        let substituted = VAR_PATTERN.replace_all(template, |caps: &Captures| {
            let variable = &caps[0];
            match self.evaluate_variable(variable) {
                Ok(value) => value.to_string(),
                Err(e) => {
                    errors.push(format!("failed to evaluate '{variable}': {e}"));
                    variable.to_string()
                }
            }
        });
        if !errors.is_empty() {
            return Err(TaskError::Evaluation(errors.join("; ")));
        }
        Ok(Value::String(substituted.into_owned()))
    }

    fn evaluate_variable(&self, variable: &str) -> Result<Value, TaskError> {
        let caps = WHOLE_VAR_PATTERN
            .captures(variable)
            .ok_or_else(|| TaskError::Evaluation(format!("bad expression: {variable}")))?;
        let dialect = &caps[1];
        let body = caps[2].trim().to_string();
        let env = self.env();
        match dialect {
            "$" => script::evaluate(&body, &env),
            "#" => predicate::evaluate(&body, &env),
            "@" => json_path(&body, &env),
            _ => Err(TaskError::Evaluation(format!("bad expression: {variable}"))),
        }
    }
}

fn json_path(body: &str, env: &BTreeMap<String, Value>) -> Result<Value, TaskError> {
    let mut root = serde_json::Map::with_capacity(env.len());
    for (name, value) in env {
        root.insert(name.clone(), value.to_json_lossy());
    }
    let root = Json::Object(root);

    // A single asterisk addresses the root object.
    let path = if body == "*" {
        "$".to_string()
    } else {
        format!("$.{body}")
    };
    let query = serde_json_path::JsonPath::parse(&path)
        .map_err(|e| TaskError::Evaluation(e.to_string()))?;
    let nodes = query.query(&root).all();
    match nodes.len() {
        0 => Err(TaskError::Evaluation(format!("no value at path '{path}'"))),
        1 => Ok(Value::from_json(nodes[0].clone())),
        _ => Ok(Value::Array(
            nodes.into_iter().cloned().map(Value::from_json).collect(),
        )),
    }
}

mod predicate {
    //! The `#` dialect: boolean and numeric predicates over the scalar
    //! leaves of the environment, which are flattened into dotted
    //! identifiers. Collections and handles are not addressable here; the
    //! script dialect covers those.

    use std::collections::BTreeMap;

    use evalexpr::{
        eval_with_context, ContextWithMutableFunctions, ContextWithMutableVariables, Function,
        HashMapContext, Value as Predicate,
    };

    use crate::error::TaskError;
    use crate::value::Value;

    pub(super) fn evaluate(body: &str, env: &BTreeMap<String, Value>) -> Result<Value, TaskError> {
        let mut context = HashMapContext::new();
        for (name, value) in env {
            bind(&mut context, name, value)?;
        }
        context
            .set_function(
                "getenv".to_string(),
                Function::new(|argument| {
                    let name = argument.as_string()?;
                    Ok(Predicate::String(std::env::var(&name).unwrap_or_default()))
                }),
            )
            .map_err(|e| TaskError::Evaluation(e.to_string()))?;

        let result =
            eval_with_context(body, &context).map_err(|e| TaskError::Evaluation(e.to_string()))?;
        Ok(from_predicate(result))
    }

    fn bind(
        context: &mut HashMapContext,
        name: &str,
        value: &Value,
    ) -> Result<(), TaskError> {
        let scalar = match value {
            Value::Bool(b) => Some(Predicate::Boolean(*b)),
            Value::Int(i) => Some(Predicate::Int(*i)),
            Value::Float(x) => Some(Predicate::Float(*x)),
            Value::String(s) => Some(Predicate::String(s.clone())),
            Value::Map(entries) => {
                for (key, value) in entries {
                    bind(context, &format!("{name}.{key}"), value)?;
                }
                None
            }
            _ => None,
        };
        if let Some(scalar) = scalar {
            context
                .set_value(name.to_string(), scalar)
                .map_err(|e| TaskError::Evaluation(e.to_string()))?;
        }
        Ok(())
    }

    fn from_predicate(value: Predicate) -> Value {
        match value {
            Predicate::Boolean(b) => Value::Bool(b),
            Predicate::Int(i) => Value::Int(i),
            Predicate::Float(x) => Value::Float(x),
            Predicate::String(s) => Value::String(s),
            Predicate::Tuple(items) => {
                Value::Array(items.into_iter().map(from_predicate).collect())
            }
            Predicate::Empty => Value::Null,
        }
    }
}

/// Returns a copy of `value` in which every string leaf has been replaced by
/// the result of `f`. Map values and sequence elements recurse; map keys do
/// not. Scalars and opaque handles are leaves and pass through untouched.
pub fn evaluate_value<F>(value: &Value, f: &F) -> Result<Value, TaskError>
where
    F: Fn(&str) -> Result<Value, TaskError>,
{
    match value {
        Value::Map(entries) => {
            let mut evaluated = BTreeMap::new();
            for (key, value) in entries {
                evaluated.insert(key.clone(), evaluate_value(value, f)?);
            }
            Ok(Value::Map(evaluated))
        }
        Value::Array(items) => Ok(Value::Array(
            items
                .iter()
                .map(|item| evaluate_value(item, f))
                .collect::<Result<Vec<_>, _>>()?,
        )),
        Value::String(s) => f(s),
        other => Ok(other.clone()),
    }
}

/// A template-bearing input field of declared type `T`.
///
/// Holds the raw field value as decoded from the definition document; each
/// execution evaluates it against the current environment and decodes the
/// result into `T`.
#[derive(Clone, Debug)]
pub struct Expr<T> {
    expr: Json,
    marker: PhantomData<fn() -> T>,
}

impl<T> Expr<T> {
    pub fn new(expr: impl Into<Json>) -> Self {
        Expr {
            expr: expr.into(),
            marker: PhantomData,
        }
    }

    pub fn raw(&self) -> &Json {
        &self.expr
    }

    /// True when the field was absent from the definition.
    pub fn is_empty(&self) -> bool {
        self.expr.is_null()
    }

    /// Evaluates the template and returns the untyped result, preserving
    /// handles produced by single-variable passthrough.
    pub fn evaluate_value(&self, input: &Input) -> Result<Value, TaskError> {
        evaluate_value(&Value::from_json(self.expr.clone()), &|template| {
            input.evaluate(template)
        })
    }
}

impl<T: DeserializeOwned> Expr<T> {
    /// Evaluates the template and decodes the result into `T`.
    pub fn evaluate(&self, input: &Input) -> Result<T, TaskError> {
        let value = self.evaluate_value(input)?;
        serde_json::from_value(value.to_json()?).map_err(|e| TaskError::Decode(e.to_string()))
    }
}

impl<T> Default for Expr<T> {
    fn default() -> Self {
        Expr {
            expr: Json::Null,
            marker: PhantomData,
        }
    }
}

impl<'de, T> Deserialize<'de> for Expr<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(Expr::new(Json::deserialize(deserializer)?))
    }
}

/// The environment of one top-level execution: an evaluator seeded with the
/// caller's root map under `input`, shared by every nested execution.
#[derive(Clone, Debug)]
pub struct Input {
    evaluator: Arc<Evaluator>,
}

impl Input {
    pub fn new(root: serde_json::Map<String, Json>) -> Self {
        let evaluator = Evaluator::new();
        evaluator.add("input", Value::from_json(Json::Object(root)));
        Input {
            evaluator: Arc::new(evaluator),
        }
    }

    /// Binds a completed subtask's output under the subtask's name, making
    /// it visible to downstream templates.
    pub fn add(&self, name: impl Into<String>, output: Output) {
        self.evaluator.add(name, output.into_value());
    }

    pub fn get(&self, name: &str) -> Option<Value> {
        self.evaluator.get(name)
    }

    pub fn evaluate(&self, template: &str) -> Result<Value, TaskError> {
        self.evaluator.evaluate(template)
    }

    pub fn env(&self) -> BTreeMap<String, Value> {
        self.evaluator.env()
    }
}

impl Default for Input {
    fn default() -> Self {
        Input::new(serde_json::Map::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn evaluator_with(name: &str, value: Json) -> Evaluator {
        let evaluator = Evaluator::new();
        evaluator.add(name, Value::from_json(value));
        evaluator
    }

    #[test]
    fn test_plain_string_passes_through() {
        let evaluator = Evaluator::new();
        assert_eq!(
            evaluator.evaluate("no variables here").unwrap(),
            Value::String("no variables here".into())
        );
    }

    #[test]
    fn test_single_variable_returns_raw_value() {
        let evaluator = evaluator_with("say_name", json!({"name": "world", "count": 2}));
        assert_eq!(
            evaluator.evaluate("${say_name.count}").unwrap(),
            Value::Int(2)
        );
        assert_eq!(
            evaluator.evaluate("${say_name}").unwrap(),
            Value::from_json(json!({"name": "world", "count": 2}))
        );
    }

    #[test]
    fn test_embedded_variables_substitute_textually() {
        let evaluator = evaluator_with("say_name", json!({"name": "world", "count": 2}));
        assert_eq!(
            evaluator
                .evaluate("hello ${say_name.name} x${say_name.count}!")
                .unwrap(),
            Value::String("hello world x2!".into())
        );
    }

    #[test]
    fn test_substitution_errors_are_joined() {
        let evaluator = Evaluator::new();
        let err = evaluator
            .evaluate("a ${missing_fn()} b ${other_missing()} c")
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("${missing_fn()}"), "got: {message}");
        assert!(message.contains("; "), "got: {message}");
    }

    #[test]
    fn test_json_path_dialect() {
        let evaluator = evaluator_with("input", json!({"a": {"b": 2}}));
        assert_eq!(evaluator.evaluate("@{input.a.b}").unwrap(), Value::Int(2));

        let root = evaluator.evaluate("@{*}").unwrap();
        assert!(root.as_map().is_some());
    }

    #[test]
    fn test_predicate_dialect() {
        let evaluator = evaluator_with("input", json!({"n": 4}));
        assert_eq!(evaluator.evaluate("#{1 + 2}").unwrap(), Value::Int(3));
        assert_eq!(
            evaluator.evaluate("#{2 > 1 && 1 < 2}").unwrap(),
            Value::Bool(true)
        );

        std::env::set_var("ENSEMBLE_PREDICATE_TEST", "on");
        assert_eq!(
            evaluator
                .evaluate(r#"#{getenv("ENSEMBLE_PREDICATE_TEST")}"#)
                .unwrap(),
            Value::String("on".into())
        );
    }

    #[test]
    fn test_evaluate_value_preserves_shape_without_strings() {
        let original = Value::from_json(json!({"a": [1, 2.5, true], "b": {"c": null}}));
        let evaluated = evaluate_value(&original, &|_| panic!("no strings to evaluate")).unwrap();
        assert_eq!(evaluated, original);
    }

    #[test]
    fn test_evaluate_value_replaces_string_leaves() {
        let original = Value::from_json(json!({"greeting": "${w}", "nested": ["${w}"]}));
        let evaluated = evaluate_value(&original, &|s| {
            assert_eq!(s, "${w}");
            Ok(Value::String("world".into()))
        })
        .unwrap();
        assert_eq!(
            evaluated,
            Value::from_json(json!({"greeting": "world", "nested": ["world"]}))
        );
    }

    #[test]
    fn test_expr_decodes_into_declared_type() {
        let input = Input::new(serde_json::Map::new());
        input.add("range", {
            let mut output = Output::new();
            output.insert("stop", 6);
            output
        });

        let expr = Expr::<Vec<i64>>::new(json!([3, "${range.stop}"]));
        assert_eq!(expr.evaluate(&input).unwrap(), vec![3, 6]);
    }

    #[test]
    fn test_expr_keeps_map_shape() {
        let input = Input::new(serde_json::Map::new());
        input.add("say_name", {
            let mut output = Output::new();
            output.insert("name", "world");
            output
        });

        let expr = Expr::<serde_json::Map<String, Json>>::new(json!({
            "hello": "${say_name.name}",
        }));
        let evaluated = expr.evaluate(&input).unwrap();
        assert_eq!(evaluated.get("hello"), Some(&json!("world")));
    }
}
