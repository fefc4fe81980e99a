//! A cancellable, breakable lazy stream of task results.
//!
//! The producer side holds an [`IteratorSender`] and runs on its own tokio
//! task, started eagerly when the handle is created. The consumer side holds
//! an [`IteratorHandle`] and either reads until the stream is exhausted or
//! calls [`IteratorHandle::stop`]; both keep the producer from leaking.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

use crate::context::Context;
use crate::error::TaskError;
use crate::value::Output;

/// One step of a stream, or one message out of an actor.
#[derive(Clone, Debug, Default)]
pub struct TaskResult {
    pub name: String,
    pub output: Output,
    pub err: Option<TaskError>,
}

impl TaskResult {
    pub fn new(output: Output) -> Self {
        TaskResult {
            name: String::new(),
            output,
            err: None,
        }
    }

    pub fn error(err: TaskError) -> Self {
        TaskResult {
            name: String::new(),
            output: Output::new(),
            err: Some(err),
        }
    }
}

/// Producer-side helper for feeding an iterator.
pub struct IteratorSender {
    ctx: Context,
    results: mpsc::Sender<TaskResult>,
    stop: Mutex<mpsc::Receiver<()>>,
}

impl IteratorSender {
    /// Sends one result to the consumer. Returns `false` — meaning the
    /// producer should stop — when the context is cancelled, the consumer
    /// signalled a break, or the consumer is gone.
    pub async fn send(&self, output: Output, err: Option<TaskError>) -> bool {
        let mut stop = self.stop.lock().await;
        tokio::select! {
            sent = self.results.send(TaskResult { name: String::new(), output, err }) => sent.is_ok(),
            _ = self.ctx.cancelled() => false,
            _ = stop.recv() => false,
        }
    }

    /// Ends the iteration by closing the result channel. Dropping the sender
    /// has the same effect, so a producer that returns early still terminates
    /// its consumer.
    pub fn end(self) {}
}

struct IteratorState {
    results: Mutex<mpsc::Receiver<TaskResult>>,
    stop: mpsc::Sender<()>,
}

/// Consumer-side handle to a running stream.
#[derive(Clone)]
pub struct IteratorHandle {
    state: Arc<IteratorState>,
}

impl IteratorHandle {
    /// Starts `producer` on its own tokio task and returns the consuming
    /// handle. The producer must keep sending through its sender and stop as
    /// soon as a send returns `false`.
    pub fn new<F, Fut>(ctx: &Context, producer: F) -> Self
    where
        F: FnOnce(IteratorSender) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (results_tx, results_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let sender = IteratorSender {
            ctx: ctx.clone(),
            results: results_tx,
            stop: Mutex::new(stop_rx),
        };
        tokio::spawn(producer(sender));
        IteratorHandle {
            state: Arc::new(IteratorState {
                results: Mutex::new(results_rx),
                stop: stop_tx,
            }),
        }
    }

    /// The next result, or `None` once the producer has ended the stream.
    pub async fn next(&self) -> Option<TaskResult> {
        self.state.results.lock().await.recv().await
    }

    /// Signals the producer to stop. Non-blocking; the signal channel has
    /// capacity one, so repeated calls are harmless.
    pub fn stop(&self) {
        let _ = self.state.stop.try_send(());
    }

    pub(crate) fn same(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.state, &other.state)
    }
}

impl fmt::Debug for IteratorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<iterator>")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use crate::value::Value;

    fn number_output(n: i64) -> Output {
        let mut output = Output::new();
        output.insert("value", Value::Int(n));
        output
    }

    #[test]
    fn test_iterator_delivers_results_in_order() {
        tokio_test::block_on(async {
            let ctx = Context::new();
            let iterator = IteratorHandle::new(&ctx, |sender| async move {
                for n in 0..3 {
                    if !sender.send(number_output(n), None).await {
                        return;
                    }
                }
                sender.end();
            });

            let mut seen = Vec::new();
            while let Some(result) = iterator.next().await {
                assert!(result.err.is_none());
                seen.push(result.output.get("value").and_then(Value::as_int).unwrap());
            }
            assert_eq!(seen, vec![0, 1, 2]);
        });
    }

    #[test]
    fn test_stop_terminates_the_producer() {
        tokio_test::block_on(async {
            let ctx = Context::new();
            let finished = Arc::new(AtomicBool::new(false));
            let flag = finished.clone();
            let iterator = IteratorHandle::new(&ctx, move |sender| async move {
                for n in 0.. {
                    if !sender.send(number_output(n), None).await {
                        break;
                    }
                }
                flag.store(true, Ordering::SeqCst);
            });

            assert!(iterator.next().await.is_some());
            iterator.stop();

            for _ in 0..100 {
                if finished.load(Ordering::SeqCst) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("producer kept running after stop");
        });
    }

    #[test]
    fn test_cancellation_terminates_the_producer() {
        tokio_test::block_on(async {
            let ctx = Context::new();
            let finished = Arc::new(AtomicBool::new(false));
            let flag = finished.clone();
            let producer_ctx = ctx.clone();
            let _iterator = IteratorHandle::new(&producer_ctx, move |sender| async move {
                for n in 0.. {
                    if !sender.send(number_output(n), None).await {
                        break;
                    }
                }
                flag.store(true, Ordering::SeqCst);
            });

            ctx.cancel();

            for _ in 0..100 {
                if finished.load(Ordering::SeqCst) {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            panic!("producer kept running after cancellation");
        });
    }
}
