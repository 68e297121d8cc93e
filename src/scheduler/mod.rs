//! Scheduling capabilities used by the pool core.
//!
//! The pool, holders and transactions are written once against [`Scheduler`].
//! Two instantiations exist:
//!
//! - [`Cooperative`]: tasks on a tokio runtime. Waiting suspends the task.
//! - [`Threaded`]: OS threads. Waiting blocks the calling thread; the blocking
//!   facade drives the async core with a current-thread runtime per thread.

mod cooperative;
mod threaded;

pub use cooperative::Cooperative;
pub use threaded::Threaded;

use crate::error::GelResult;
use std::future::Future;
use std::time::Duration;

/// Bounded LIFO queue of free items.
pub trait WaitQueue<T: Send + 'static>: Send + Sync + 'static {
    fn with_capacity(capacity: usize) -> Self;

    /// Push without waiting. Returns the item back if the queue is full.
    fn push(&self, item: T) -> Result<(), T>;

    /// Pop the most recently pushed item, waiting up to `timeout`.
    /// Returns `None` when the timeout elapses first.
    fn pop(&self, timeout: Option<Duration>) -> impl Future<Output = Option<T>> + Send + '_;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn capacity(&self) -> usize;

    fn set_capacity(&self, capacity: usize);
}

/// Level-triggered flag that can be awaited.
pub trait ReleaseEvent: Send + Sync + 'static {
    /// Create an event in the set state.
    fn new_set() -> Self;

    fn set(&self);

    fn clear(&self);

    fn is_set(&self) -> bool;

    /// Wait until the event is set. Returns `false` on timeout.
    fn wait(&self, timeout: Option<Duration>) -> impl Future<Output = bool> + Send + '_;
}

/// Queue, event and task primitives for one scheduling model.
pub trait Scheduler: Send + Sync + 'static {
    type Queue<T: Send + 'static>: WaitQueue<T>;
    type Event: ReleaseEvent;

    const NAME: &'static str;

    fn sleep(duration: Duration) -> impl Future<Output = ()> + Send;

    /// Run `fut` until it completes or `duration` elapses, whichever is
    /// first. Returns `None` on timeout; `fut` is dropped unfinished.
    fn timeout<F>(duration: Duration, fut: F) -> impl Future<Output = Option<F::Output>> + Send
    where
        F: Future + Send,
        F::Output: Send;

    /// Run `fut` without making the caller wait for its result.
    fn detach<F>(fut: F) -> impl Future<Output = ()> + Send
    where
        F: Future<Output = ()> + Send + 'static;

    /// Run `fut` to completion even if the returned future is dropped.
    fn shield<F>(fut: F) -> impl Future<Output = GelResult<()>> + Send
    where
        F: Future<Output = GelResult<()>> + Send + 'static;
}
