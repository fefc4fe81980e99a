//! Hierarchical execution tracing.
//!
//! A [`Trace`] records one completed [`Event`] per task executed in its
//! scope. Composite tasks open a child trace per execution and wrap their
//! subtasks so the events land automatically. When no trace is attached the
//! disabled variant no-ops everything and `wrap` passes tasks through
//! unchanged, so tracing costs nothing when off.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as Json;

use crate::context::Context;
use crate::error::TaskError;
use crate::eval::Input;
use crate::task::{Task, TaskHeader};
use crate::value::Output;

/// One completed task execution, with the events of its child trace nested
/// underneath.
#[derive(Clone, Debug, Serialize)]
pub struct Event {
    pub when: DateTime<Utc>,
    /// Elapsed since the previous event in the same trace, or since the
    /// trace started for the first event.
    #[serde(with = "humantime_serde")]
    pub elapsed: Duration,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Json>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<Event>,
}

impl Default for Event {
    fn default() -> Self {
        Event {
            when: Utc::now(),
            elapsed: Duration::ZERO,
            name: String::new(),
            output: None,
            error: None,
            events: Vec::new(),
        }
    }
}

pub struct TraceState {
    name: String,
    start: DateTime<Utc>,
    children: Mutex<HashMap<String, Trace>>,
    events: Mutex<Vec<Event>>,
}

/// A recording scope for task execution events.
#[derive(Clone, Default)]
pub enum Trace {
    /// No trace attached; all operations are no-ops.
    #[default]
    Disabled,
    Active(Arc<TraceState>),
}

impl Trace {
    pub fn new(name: impl Into<String>) -> Self {
        Trace::Active(Arc::new(TraceState {
            name: name.into(),
            start: Utc::now(),
            children: Mutex::new(HashMap::new()),
            events: Mutex::new(Vec::new()),
        }))
    }

    /// Creates a child trace and records the parent→child link under the
    /// child's name, so the child's events get attached to the matching
    /// event later.
    pub fn child(&self, name: &str) -> Trace {
        match self {
            Trace::Disabled => Trace::Disabled,
            Trace::Active(state) => {
                let child = Trace::new(name);
                state
                    .children
                    .lock()
                    .unwrap()
                    .insert(name.to_string(), child.clone());
                child
            }
        }
    }

    /// Wraps a task so that, after it executes, its result is added as an
    /// event to whichever trace rides the executing context.
    pub fn wrap(&self, task: Arc<dyn Task>) -> Arc<dyn Task> {
        match self {
            Trace::Disabled => task,
            Trace::Active(_) => Arc::new(TracedTask { inner: task }),
        }
    }

    /// Appends a completed event. If `name` matches a registered child
    /// trace, that child's events are attached as the nested events.
    pub fn add_event(&self, name: &str, output: Option<&Output>, error: Option<&TaskError>) {
        let Trace::Active(state) = self else {
            return;
        };
        let when = Utc::now();
        let nested = state
            .children
            .lock()
            .unwrap()
            .get(name)
            .map(Trace::events)
            .unwrap_or_default();
        let mut events = state.events.lock().unwrap();
        let since = match events.last() {
            Some(previous) => when - previous.when,
            None => when - state.start,
        };
        events.push(Event {
            when,
            elapsed: since.to_std().unwrap_or_default(),
            name: name.to_string(),
            output: output.map(Output::to_json_lossy),
            error: error.map(TaskError::to_string),
            events: nested,
        });
    }

    pub fn events(&self) -> Vec<Event> {
        match self {
            Trace::Disabled => Vec::new(),
            Trace::Active(state) => state.events.lock().unwrap().clone(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Trace::Disabled => "",
            Trace::Active(state) => &state.name,
        }
    }
}

impl fmt::Debug for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trace::Disabled => f.write_str("Trace::Disabled"),
            Trace::Active(state) => write!(f, "Trace::Active({:?})", state.name),
        }
    }
}

struct TracedTask {
    inner: Arc<dyn Task>,
}

#[async_trait]
impl Task for TracedTask {
    fn header(&self) -> &TaskHeader {
        self.inner.header()
    }

    async fn execute(&self, ctx: &Context, input: &Input) -> Result<Output, TaskError> {
        let result = self.inner.execute(ctx, input).await;
        ctx.trace().add_event(
            &self.inner.header().name,
            result.as_ref().ok(),
            result.as_ref().err(),
        );
        result
    }
}

/// Executes `task` under a fresh root trace attached to the context and
/// returns the single top-level event (errors included, as part of the
/// event).
pub async fn trace_task(ctx: &Context, task: Arc<dyn Task>, input: &Input) -> Event {
    let trace = Trace::new(task.header().name.clone());
    let ctx = ctx.with_trace(trace.clone());
    let wrapped = trace.wrap(task);
    let _ = wrapped.execute(&ctx, input).await;
    trace.events().into_iter().next().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StaticTask {
        header: TaskHeader,
        result: Result<Output, TaskError>,
    }

    impl StaticTask {
        fn new(name: &str, result: Result<Output, TaskError>) -> Arc<dyn Task> {
            Arc::new(StaticTask {
                header: TaskHeader {
                    name: name.to_string(),
                    task_type: "static".to_string(),
                    ..TaskHeader::default()
                },
                result,
            })
        }
    }

    #[async_trait]
    impl Task for StaticTask {
        fn header(&self) -> &TaskHeader {
            &self.header
        }

        async fn execute(&self, _ctx: &Context, _input: &Input) -> Result<Output, TaskError> {
            self.result.clone()
        }
    }

    #[test]
    fn test_events_record_output_and_error() {
        tokio_test::block_on(async {
            let trace = Trace::new("root");
            let ctx = Context::new().with_trace(trace.clone());
            let input = Input::default();

            let mut output = Output::new();
            output.insert("n", 1);
            let ok = trace.wrap(StaticTask::new("ok", Ok(output)));
            let failing = trace.wrap(StaticTask::new(
                "failing",
                Err(TaskError::failed("boom")),
            ));

            ok.execute(&ctx, &input).await.unwrap();
            failing.execute(&ctx, &input).await.unwrap_err();

            let events = trace.events();
            assert_eq!(events.len(), 2);
            assert_eq!(events[0].name, "ok");
            assert_eq!(events[0].output, Some(serde_json::json!({"n": 1})));
            assert_eq!(events[1].name, "failing");
            assert_eq!(events[1].error.as_deref(), Some("boom"));
        });
    }

    #[test]
    fn test_child_events_nest_under_matching_event() {
        tokio_test::block_on(async {
            let root = Trace::new("root");
            let child = root.child("composite");
            child.add_event("inner", None, None);
            root.add_event("composite", None, None);

            let events = root.events();
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].name, "composite");
            assert_eq!(events[0].events.len(), 1);
            assert_eq!(events[0].events[0].name, "inner");
        });
    }

    #[test]
    fn test_trace_task_returns_the_top_level_event() {
        tokio_test::block_on(async {
            let mut output = Output::new();
            output.insert("n", 1);
            let task = StaticTask::new("single", Ok(output));

            let event = trace_task(&Context::new(), task, &Input::default()).await;
            assert_eq!(event.name, "single");
            assert_eq!(event.output, Some(serde_json::json!({"n": 1})));
            assert!(event.error.is_none());
        });
    }

    #[test]
    fn test_disabled_trace_is_a_no_op() {
        let trace = Trace::Disabled;
        let child = trace.child("anything");
        child.add_event("ignored", None, None);
        assert!(trace.events().is_empty());
        assert!(child.events().is_empty());
    }
}
