//! Stream capability returned by subscription procedures.
//!
//! A subscription procedure yields an [`Observable`]. Subscribing hands it an
//! [`Observer`] and returns a [`CancelHandle`]; the source then pushes items
//! on its own schedule until it completes, fails, or is cancelled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures_util::{Stream, StreamExt};
use serde_json::Value;
use tracing::trace;

use crate::procedure::ProcedureError;

/// One notification from a stream source.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A value.
    Item(Value),
    /// Terminal failure.
    Error(ProcedureError),
    /// Terminal success.
    Complete,
}

impl StreamEvent {
    /// Returns true for `Error` and `Complete`.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Item(_))
    }
}

/// Receives notifications from a stream source.
///
/// Cloning is cheap; every clone feeds the same sink.
#[derive(Clone)]
pub struct Observer {
    sink: Arc<dyn Fn(StreamEvent) + Send + Sync>,
}

impl Observer {
    /// Creates an observer forwarding every event to `sink`.
    pub fn new(sink: impl Fn(StreamEvent) + Send + Sync + 'static) -> Self {
        Self {
            sink: Arc::new(sink),
        }
    }

    /// Emits a value.
    pub fn next(&self, value: Value) {
        (self.sink)(StreamEvent::Item(value));
    }

    /// Emits a terminal error.
    pub fn error(&self, error: ProcedureError) {
        (self.sink)(StreamEvent::Error(error));
    }

    /// Emits terminal completion.
    pub fn complete(&self) {
        (self.sink)(StreamEvent::Complete);
    }

    /// Emits a raw event.
    pub fn emit(&self, event: StreamEvent) {
        (self.sink)(event);
    }
}

impl std::fmt::Debug for Observer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observer").finish_non_exhaustive()
    }
}

/// A source that can be subscribed to exactly once.
pub trait Observable: Send + 'static {
    /// Starts the source. Events may be emitted before this returns.
    fn subscribe(self: Box<Self>, observer: Observer) -> CancelHandle;
}

type CancelFn = Box<dyn FnOnce() + Send>;

struct CancelInner {
    cancelled: AtomicBool,
    action: Mutex<Option<CancelFn>>,
}

/// Idempotent, non-blocking cancellation of a running source.
///
/// The action runs at most once no matter how many clones call
/// [`CancelHandle::cancel`], and from whichever thread gets there first.
#[derive(Clone)]
pub struct CancelHandle {
    inner: Arc<CancelInner>,
}

impl CancelHandle {
    /// Wraps a cancellation action.
    pub fn new(action: impl FnOnce() + Send + 'static) -> Self {
        Self {
            inner: Arc::new(CancelInner {
                cancelled: AtomicBool::new(false),
                action: Mutex::new(Some(Box::new(action))),
            }),
        }
    }

    /// Runs the cancellation action if it has not run yet.
    pub fn cancel(&self) {
        if self.inner.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        let action = self
            .inner
            .action
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(action) = action {
            action();
        }
    }

    /// Returns true once `cancel` has been called.
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancelHandle")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Adapts an async stream into an [`Observable`].
///
/// Subscribing spawns a tokio task that forwards every item; the first `Err`
/// terminates the stream with an error, exhaustion completes it. Cancelling
/// aborts the task at its next await point.
pub fn from_stream<S>(stream: S) -> Box<dyn Observable>
where
    S: Stream<Item = Result<Value, ProcedureError>> + Send + 'static,
{
    Box::new(StreamObservable { stream })
}

struct StreamObservable<S> {
    stream: S,
}

impl<S> Observable for StreamObservable<S>
where
    S: Stream<Item = Result<Value, ProcedureError>> + Send + 'static,
{
    fn subscribe(self: Box<Self>, observer: Observer) -> CancelHandle {
        let stream = self.stream;
        let task = tokio::spawn(async move {
            let mut stream = std::pin::pin!(stream);
            while let Some(item) = stream.next().await {
                match item {
                    Ok(value) => observer.next(value),
                    Err(error) => {
                        observer.error(error);
                        return;
                    }
                }
            }
            observer.complete();
        });
        CancelHandle::new(move || {
            trace!("Aborting stream task");
            task.abort();
        })
    }
}


#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use futures_util::stream;
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;

    #[test]
    fn cancel_runs_once_across_clones() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let handle = CancelHandle::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let clone = handle.clone();

        assert!(!handle.is_cancelled());
        handle.cancel();
        clone.cancel();
        handle.cancel();

        assert!(clone.is_cancelled());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn terminal_events() {
        assert!(!StreamEvent::Item(json!(1)).is_terminal());
        assert!(StreamEvent::Complete.is_terminal());
        assert!(StreamEvent::Error(ProcedureError::internal("x")).is_terminal());
    }

    #[tokio::test]
    async fn from_stream_forwards_items_then_completes() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let observable = from_stream(stream::iter(vec![Ok(json!(1)), Ok(json!(2))]));
        let _handle = observable.subscribe(Observer::new(move |event| {
            let _ = tx.send(event);
        }));

        assert_eq!(rx.recv().await, Some(StreamEvent::Item(json!(1))));
        assert_eq!(rx.recv().await, Some(StreamEvent::Item(json!(2))));
        assert_eq!(rx.recv().await, Some(StreamEvent::Complete));
    }

    #[tokio::test]
    async fn from_stream_stops_at_first_error() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let observable = from_stream(stream::iter(vec![
            Ok(json!("a")),
            Err(ProcedureError::bad_request("bad")),
            Ok(json!("never")),
        ]));
        let _handle = observable.subscribe(Observer::new(move |event| {
            let _ = tx.send(event);
        }));

        assert_eq!(rx.recv().await, Some(StreamEvent::Item(json!("a"))));
        assert!(matches!(rx.recv().await, Some(StreamEvent::Error(_))));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn from_stream_cancel_aborts_task() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let observable = from_stream(stream::pending());
        let handle = observable.subscribe(Observer::new(move |event| {
            let _ = tx.send(event);
        }));

        handle.cancel();
        // The observer (and its sender) is dropped with the aborted task.
        let closed = tokio::time::timeout(Duration::from_secs(1), rx.recv()).await;
        assert_eq!(closed.unwrap(), None);
    }
}
