//! Execution context: a cancellation token plus the trace attached to the
//! current scope. Cheap to clone; every nested execution receives a clone.

use tokio_util::sync::CancellationToken;

use crate::trace::Trace;

#[derive(Clone, Debug, Default)]
pub struct Context {
    cancellation: CancellationToken,
    trace: Trace,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    /// A context with the same cancellation scope but a different trace.
    pub fn with_trace(&self, trace: Trace) -> Self {
        Self {
            cancellation: self.cancellation.clone(),
            trace,
        }
    }

    /// A context whose cancellation scope is a child of this one: cancelling
    /// the child does not affect the parent, cancelling the parent cancels
    /// the child.
    pub fn child(&self) -> Self {
        Self {
            cancellation: self.cancellation.child_token(),
            trace: self.trace.clone(),
        }
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}
