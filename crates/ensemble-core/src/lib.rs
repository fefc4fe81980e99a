//! # Ensemble Core
//!
//! Core abstractions for the ensemble workflow engine.
//!
//! This crate contains:
//! - the value model shared by task inputs and outputs, including the
//!   reserved-key protocol for termination, iterators and actors
//! - the template evaluator with its three expression dialects
//! - the iterator (streaming) and actor (pausable workflow) channel types
//! - the `Task` trait, the factory registry and definition decoding
//! - hierarchical execution tracing
//!
//! This crate does NOT contain any concrete task kind; those live in
//! `ensemble-tasks` and register themselves into a [`Registry`].

pub mod actor;
pub mod context;
pub mod error;
pub mod eval;
pub mod iterator;
pub mod schema;
pub mod script;
pub mod task;
pub mod trace;
pub mod value;

pub use actor::{ActorBehavior, ActorHandle};
pub use context::Context;
pub use error::{ConstructError, TaskError};
pub use eval::{evaluate_value, Evaluator, Expr, Input};
pub use iterator::{IteratorHandle, IteratorSender, TaskResult};
pub use schema::Schema;
pub use task::{Loader, MapLoader, Registry, Task, TaskDefinition, TaskFactory, TaskHeader};
pub use trace::{trace_task, Event, Trace};
pub use value::{Output, Value};
