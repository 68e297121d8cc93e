use super::{ReleaseEvent, Scheduler, WaitQueue};
use crate::error::{GelError, GelResult};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Semaphore, watch};

/// Scheduler for tasks on a tokio runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct Cooperative;

impl Scheduler for Cooperative {
    type Queue<T: Send + 'static> = TaskQueue<T>;
    type Event = TaskEvent;

    const NAME: &'static str = "tokio";

    fn sleep(duration: Duration) -> impl Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn timeout<F>(duration: Duration, fut: F) -> impl Future<Output = Option<F::Output>> + Send
    where
        F: Future + Send,
        F::Output: Send,
    {
        async move { tokio::time::timeout(duration, fut).await.ok() }
    }

    fn detach<F>(fut: F) -> impl Future<Output = ()> + Send
    where
        F: Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(fut);
        std::future::ready(())
    }

    fn shield<F>(fut: F) -> impl Future<Output = GelResult<()>> + Send
    where
        F: Future<Output = GelResult<()>> + Send + 'static,
    {
        // Spawned before the first poll so dropping the returned future
        // cannot prevent the work from running.
        let handle = tokio::spawn(fut);
        async move {
            match handle.await {
                Ok(result) => result,
                Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
                Err(e) => Err(GelError::internal(format!("shielded task failed: {}", e))),
            }
        }
    }
}

/// LIFO stack guarded by a mutex; the semaphore counts stacked items.
pub struct TaskQueue<T> {
    items: Mutex<Vec<T>>,
    available: Semaphore,
    capacity: AtomicUsize,
}

impl<T: Send + 'static> WaitQueue<T> for TaskQueue<T> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Mutex::new(Vec::with_capacity(capacity)),
            available: Semaphore::new(0),
            capacity: AtomicUsize::new(capacity),
        }
    }

    fn push(&self, item: T) -> Result<(), T> {
        {
            let mut items = self.items.lock();
            if items.len() >= self.capacity.load(Ordering::Acquire) {
                return Err(item);
            }
            items.push(item);
        }
        self.available.add_permits(1);
        Ok(())
    }

    fn pop(&self, timeout: Option<Duration>) -> impl Future<Output = Option<T>> + Send + '_ {
        async move {
            let permit = match timeout {
                Some(timeout) => tokio::time::timeout(timeout, self.available.acquire())
                    .await
                    .ok()?
                    .ok()?,
                None => self.available.acquire().await.ok()?,
            };
            // One permit per stacked item, so the pop below always succeeds.
            permit.forget();
            self.items.lock().pop()
        }
    }

    fn len(&self) -> usize {
        self.items.lock().len()
    }

    fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Acquire)
    }

    fn set_capacity(&self, capacity: usize) {
        self.capacity.store(capacity, Ordering::Release);
    }
}

/// Release flag backed by a watch channel.
pub struct TaskEvent {
    state: watch::Sender<bool>,
}

impl ReleaseEvent for TaskEvent {
    fn new_set() -> Self {
        Self {
            state: watch::Sender::new(true),
        }
    }

    fn set(&self) {
        self.state.send_replace(true);
    }

    fn clear(&self) {
        self.state.send_replace(false);
    }

    fn is_set(&self) -> bool {
        *self.state.borrow()
    }

    fn wait(&self, timeout: Option<Duration>) -> impl Future<Output = bool> + Send + '_ {
        let mut rx = self.state.subscribe();
        async move {
            let released = rx.wait_for(|set| *set);
            match timeout {
                Some(timeout) => matches!(tokio::time::timeout(timeout, released).await, Ok(Ok(_))),
                None => released.await.is_ok(),
            }
        }
    }
}
