//! A long-lived task that interacts with the outside world through an inbox
//! and an outbox.
//!
//! The host holds an [`ActorHandle`] and drives progress by reading from the
//! outbox and writing to the inbox. The workflow body holds the symmetric
//! [`ActorBehavior`]. Both sides select against the actor's cancellation
//! scope, so stopping the actor unblocks everyone.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use serde_json::Value as Json;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::context::Context;
use crate::error::TaskError;
use crate::iterator::TaskResult;
use crate::value::Output;

type InboxMessage = serde_json::Map<String, Json>;

struct BehaviorState {
    cancellation: CancellationToken,
    inbox: Mutex<mpsc::Receiver<InboxMessage>>,
    outbox: mpsc::Sender<TaskResult>,
}

/// The task-side port of an actor, held only by the workflow body.
#[derive(Clone)]
pub struct ActorBehavior {
    state: Arc<BehaviorState>,
}

impl ActorBehavior {
    /// Sends a result to the host. Returns immediately when the actor has
    /// been cancelled.
    pub async fn send(&self, output: Output, err: Option<TaskError>) {
        tokio::select! {
            _ = self.state.outbox.send(TaskResult { name: String::new(), output, err }) => {}
            _ = self.state.cancellation.cancelled() => {}
        }
    }

    /// Receives the next message from the host, or `None` when the actor has
    /// been cancelled.
    pub async fn receive(&self) -> Option<InboxMessage> {
        let mut inbox = self.state.inbox.lock().await;
        tokio::select! {
            message = inbox.recv() => message,
            _ = self.state.cancellation.cancelled() => None,
        }
    }

    pub(crate) fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl fmt::Debug for ActorBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<behavior>")
    }
}

struct ActorState {
    cancellation: CancellationToken,
    inbox: mpsc::Sender<InboxMessage>,
    outbox: Mutex<mpsc::Receiver<TaskResult>>,
}

/// The host-side port of an actor.
#[derive(Clone)]
pub struct ActorHandle {
    state: Arc<ActorState>,
}

impl ActorHandle {
    /// Spawns `body` on its own tokio task, wired to a fresh inbox/outbox
    /// pair. The body receives a context scoped to the actor's cancellation
    /// and the behavior through which it talks to the host.
    pub fn new<F, Fut>(ctx: &Context, body: F) -> Self
    where
        F: FnOnce(Context, ActorBehavior) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (inbox_tx, inbox_rx) = mpsc::channel(1);
        let (outbox_tx, outbox_rx) = mpsc::channel(1);
        let scope = ctx.child();
        let behavior = ActorBehavior {
            state: Arc::new(BehaviorState {
                cancellation: scope.cancellation().clone(),
                inbox: Mutex::new(inbox_rx),
                outbox: outbox_tx,
            }),
        };
        let cancellation = scope.cancellation().clone();
        tokio::spawn(body(scope, behavior));
        ActorHandle {
            state: Arc::new(ActorState {
                cancellation,
                inbox: inbox_tx,
                outbox: Mutex::new(outbox_rx),
            }),
        }
    }

    /// Delivers a message to the actor's inbox. Returns `false` when the
    /// actor is gone.
    pub async fn send(&self, message: InboxMessage) -> bool {
        self.state.inbox.send(message).await.is_ok()
    }

    /// The next message from the actor's outbox, or `None` once the actor
    /// has finished and dropped its behavior.
    pub async fn receive(&self) -> Option<TaskResult> {
        self.state.outbox.lock().await.recv().await
    }

    /// Cancels the actor's execution scope.
    pub fn stop(&self) {
        self.state.cancellation.cancel();
    }

    pub(crate) fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl fmt::Debug for ActorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<actor>")
    }
}
