//! The value model shared by task inputs and outputs.
//!
//! Outputs can carry live handles (iterators, actors, actor behaviors) nested
//! at arbitrary depth — an HTTP response whose `body` is a stream, an actor
//! behavior tucked under `actor.behavior` in the environment — so the engine
//! keeps its own value tree instead of reusing `serde_json::Value`.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value as Json;

use crate::actor::{ActorBehavior, ActorHandle};
use crate::iterator::IteratorHandle;

/// A single value flowing through the engine: plain JSON-like data, or an
/// opaque handle to a running iterator or actor.
#[derive(Clone, Debug, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
    /// A streaming output; see [`IteratorHandle`].
    Iterator(IteratorHandle),
    /// The task-side port of an actor; lives in the environment under
    /// `actor.behavior` while an asynchronous flow runs.
    Behavior(ActorBehavior),
    /// The host-side port of an actor, returned by an asynchronous serial.
    Actor(ActorHandle),
}

impl Value {
    /// Builds a value from decoded JSON. Numbers become `Int` when they fit
    /// in an `i64` and `Float` otherwise.
    pub fn from_json(json: Json) -> Value {
        match json {
            Json::Null => Value::Null,
            Json::Bool(b) => Value::Bool(b),
            Json::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(0.0)),
            },
            Json::String(s) => Value::String(s),
            Json::Array(items) => Value::Array(items.into_iter().map(Value::from_json).collect()),
            Json::Object(entries) => Value::Map(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    /// Renders the value as JSON. Handles are not plain data and yield a
    /// decode error.
    pub fn to_json(&self) -> Result<Json, crate::error::TaskError> {
        match self {
            Value::Null => Ok(Json::Null),
            Value::Bool(b) => Ok(Json::Bool(*b)),
            Value::Int(i) => Ok(Json::from(*i)),
            Value::Float(f) => Ok(serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or(Json::Null)),
            Value::String(s) => Ok(Json::String(s.clone())),
            Value::Array(items) => Ok(Json::Array(
                items
                    .iter()
                    .map(Value::to_json)
                    .collect::<Result<Vec<_>, _>>()?,
            )),
            Value::Map(entries) => {
                let mut object = serde_json::Map::with_capacity(entries.len());
                for (key, value) in entries {
                    object.insert(key.clone(), value.to_json()?);
                }
                Ok(Json::Object(object))
            }
            Value::Iterator(_) | Value::Behavior(_) | Value::Actor(_) => Err(
                crate::error::TaskError::Decode(format!("{self} cannot be decoded as plain data")),
            ),
        }
    }

    /// Renders the value as JSON, writing handles as their marker strings.
    /// Used for traces and `jsonencode`.
    pub fn to_json_lossy(&self) -> Json {
        match self {
            Value::Null => Json::Null,
            Value::Bool(b) => Json::Bool(*b),
            Value::Int(i) => Json::from(*i),
            Value::Float(f) => serde_json::Number::from_f64(*f)
                .map(Json::Number)
                .unwrap_or(Json::Null),
            Value::String(s) => Json::String(s.clone()),
            Value::Array(items) => Json::Array(items.iter().map(Value::to_json_lossy).collect()),
            Value::Map(entries) => Json::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json_lossy()))
                    .collect(),
            ),
            Value::Iterator(_) | Value::Behavior(_) | Value::Actor(_) => {
                Json::String(self.to_string())
            }
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Map(a), Value::Map(b)) => a == b,
            (Value::Iterator(a), Value::Iterator(b)) => a.same(b),
            (Value::Behavior(a), Value::Behavior(b)) => a.same(b),
            (Value::Actor(a), Value::Actor(b)) => a.same(b),
            _ => false,
        }
    }
}

/// The stringification used when a template variable is substituted into a
/// larger string: scalars render bare, collections render as JSON, handles
/// render as markers.
impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("null"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::String(s) => f.write_str(s),
            Value::Array(_) | Value::Map(_) => write!(f, "{}", self.to_json_lossy()),
            Value::Iterator(_) => f.write_str("<iterator>"),
            Value::Behavior(_) => f.write_str("<behavior>"),
            Value::Actor(_) => f.write_str("<actor>"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Value::Array(v)
    }
}

impl From<BTreeMap<String, Value>> for Value {
    fn from(v: BTreeMap<String, Value>) -> Self {
        Value::Map(v)
    }
}

impl From<IteratorHandle> for Value {
    fn from(v: IteratorHandle) -> Self {
        Value::Iterator(v)
    }
}

impl From<ActorBehavior> for Value {
    fn from(v: ActorBehavior) -> Self {
        Value::Behavior(v)
    }
}

impl From<ActorHandle> for Value {
    fn from(v: ActorHandle) -> Self {
        Value::Actor(v)
    }
}

impl From<Output> for Value {
    fn from(v: Output) -> Self {
        Value::Map(v.0)
    }
}

/// The mapping returned by a task.
///
/// Three keys are reserved: `terminated` (set by the terminate task, stops
/// the enclosing serial or loop), `iterator` (a streaming output, consumed by
/// loop) and `actor` (produced by an asynchronous serial). A task that
/// consumes a reserved key removes it before propagating the output.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Output(BTreeMap<String, Value>);

const KEY_TERMINATED: &str = "terminated";
const KEY_ITERATOR: &str = "iterator";
const KEY_ACTOR: &str = "actor";

impl Output {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds an output from a decoded JSON object.
    pub fn from_json_map(entries: serde_json::Map<String, Json>) -> Self {
        Output(
            entries
                .into_iter()
                .map(|(k, v)| (k, Value::from_json(v)))
                .collect(),
        )
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.0.remove(key)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    pub fn set_terminated(&mut self) {
        self.insert(KEY_TERMINATED, true);
    }

    pub fn clear_terminated(&mut self) {
        self.0.remove(KEY_TERMINATED);
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self.0.get(KEY_TERMINATED), Some(Value::Bool(true)))
    }

    /// The iterator handle carried under the reserved `iterator` key, if any.
    pub fn iterator(&self) -> Option<IteratorHandle> {
        match self.0.get(KEY_ITERATOR) {
            Some(Value::Iterator(handle)) => Some(handle.clone()),
            _ => None,
        }
    }

    /// The actor handle carried under the reserved `actor` key, if any.
    pub fn actor(&self) -> Option<ActorHandle> {
        match self.0.get(KEY_ACTOR) {
            Some(Value::Actor(handle)) => Some(handle.clone()),
            _ => None,
        }
    }

    pub fn into_value(self) -> Value {
        Value::Map(self.0)
    }

    pub fn to_json_lossy(&self) -> Json {
        Value::Map(self.0.clone()).to_json_lossy()
    }
}

impl From<BTreeMap<String, Value>> for Output {
    fn from(entries: BTreeMap<String, Value>) -> Self {
        Output(entries)
    }
}

impl FromIterator<(String, Value)> for Output {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Output(iter.into_iter().collect())
    }
}

impl IntoIterator for Output {
    type Item = (String, Value);
    type IntoIter = std::collections::btree_map::IntoIter<String, Value>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}
