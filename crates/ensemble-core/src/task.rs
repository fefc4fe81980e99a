//! The task interface and the factory registry that turns declarative
//! definitions into executable task trees.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value as Json;

use crate::context::Context;
use crate::error::{ConstructError, TaskError};
use crate::eval::Input;
use crate::value::Output;

type Document = serde_json::Map<String, Json>;

/// Header fields shared by every task kind.
#[derive(Clone, Debug, Default)]
pub struct TaskHeader {
    pub name: String,
    pub task_type: String,
    pub description: String,
    pub timeout: Option<Duration>,
}

impl TaskHeader {
    pub fn new(name: impl Into<String>, task_type: impl Into<String>) -> Self {
        TaskHeader {
            name: name.into(),
            task_type: task_type.into(),
            description: String::new(),
            timeout: None,
        }
    }
}

/// A unit of work with a typed input block.
#[async_trait]
pub trait Task: Send + Sync {
    fn header(&self) -> &TaskHeader;

    async fn execute(&self, ctx: &Context, input: &Input) -> Result<Output, TaskError>;
}

impl std::fmt::Debug for dyn Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("header", self.header())
            .finish()
    }
}

/// A raw task document, as decoded from JSON: common header fields plus the
/// kind-specific input block.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct TaskDefinition {
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub description: String,
    /// Accepts duration strings such as `"2s"` or `"500ms"`.
    #[serde(default, with = "humantime_serde")]
    pub timeout: Option<Duration>,
    #[serde(default)]
    pub input: Document,
}

impl TaskDefinition {
    pub fn header(&self) -> TaskHeader {
        TaskHeader {
            name: self.name.clone(),
            task_type: self.task_type.clone(),
            description: self.description.clone(),
            timeout: self.timeout,
        }
    }
}

type Constructor =
    dyn Fn(&Registry, TaskDefinition) -> Result<Arc<dyn Task>, ConstructError> + Send + Sync;

/// A registered task kind: its type name and the constructor that decodes a
/// definition into an executable task.
pub struct TaskFactory {
    task_type: String,
    constructor: Box<Constructor>,
}

impl TaskFactory {
    pub fn new<F>(task_type: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(&Registry, TaskDefinition) -> Result<Arc<dyn Task>, ConstructError>
            + Send
            + Sync
            + 'static,
    {
        TaskFactory {
            task_type: task_type.into(),
            constructor: Box::new(constructor),
        }
    }

    pub fn task_type(&self) -> &str {
        &self.task_type
    }
}

/// Resolves task names to definition documents; used by the call task for
/// late binding.
pub trait Loader: Send + Sync {
    fn load(&self, name: &str) -> Result<Document, ConstructError>;
}

/// An in-memory loader backed by a name→definition map.
#[derive(Clone, Debug, Default)]
pub struct MapLoader {
    definitions: HashMap<String, Document>,
}

impl MapLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, definition: Document) -> Self {
        self.definitions.insert(name.into(), definition);
        self
    }
}

impl Loader for MapLoader {
    fn load(&self, name: &str) -> Result<Document, ConstructError> {
        self.definitions
            .get(name)
            .cloned()
            .ok_or_else(|| ConstructError::UnknownTask(name.to_string()))
    }
}

/// Maps task-type names to factories, and loader names to loaders.
///
/// There is deliberately no process-wide instance; build one explicitly (or
/// through `ensemble_tasks::registry()`) so construction stays testable.
#[derive(Default)]
pub struct Registry {
    factories: HashMap<String, TaskFactory>,
    loaders: HashMap<String, Arc<dyn Loader>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a task factory. Registering the same type twice is an
    /// error; nothing is partially replaced.
    pub fn register(&mut self, factory: TaskFactory) -> Result<(), ConstructError> {
        if self.factories.contains_key(factory.task_type()) {
            return Err(ConstructError::DuplicateType(
                factory.task_type().to_string(),
            ));
        }
        self.factories.insert(factory.task_type.clone(), factory);
        Ok(())
    }

    pub fn register_loader(
        &mut self,
        name: impl Into<String>,
        loader: Arc<dyn Loader>,
    ) -> Result<(), ConstructError> {
        let name = name.into();
        if self.loaders.contains_key(&name) {
            return Err(ConstructError::DuplicateLoader(name));
        }
        self.loaders.insert(name, loader);
        Ok(())
    }

    pub fn loader(&self, name: &str) -> Result<Arc<dyn Loader>, ConstructError> {
        self.loaders
            .get(name)
            .cloned()
            .ok_or_else(|| ConstructError::UnknownLoader(name.to_string()))
    }

    /// Builds an executable task from a decoded definition, dispatching on
    /// its `type` field. Factories recursively construct any subtask fields
    /// through this registry.
    pub fn construct(&self, definition: TaskDefinition) -> Result<Arc<dyn Task>, ConstructError> {
        let factory = self
            .factories
            .get(&definition.task_type)
            .ok_or_else(|| ConstructError::UnknownType(definition.task_type.clone()))?;
        tracing::debug!(
            task = %definition.name,
            task_type = %definition.task_type,
            "constructing task"
        );
        (factory.constructor)(self, definition)
    }

    pub fn construct_value(&self, value: Json) -> Result<Arc<dyn Task>, ConstructError> {
        let definition: TaskDefinition = serde_json::from_value(value)?;
        self.construct(definition)
    }

    pub fn construct_from_json(&self, data: &str) -> Result<Arc<dyn Task>, ConstructError> {
        self.construct_value(serde_json::from_str(data)?)
    }
}
