use super::{ReleaseEvent, Scheduler, WaitQueue};
use crate::error::GelResult;
use parking_lot::{Condvar, Mutex};
use std::future::Future;
use std::task::Poll;
use std::time::{Duration, Instant};

/// Scheduler for OS threads. Every wait blocks the calling thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct Threaded;

impl Scheduler for Threaded {
    type Queue<T: Send + 'static> = ThreadQueue<T>;
    type Event = ThreadEvent;

    const NAME: &'static str = "threads";

    fn sleep(duration: Duration) -> impl Future<Output = ()> + Send {
        async move {
            std::thread::sleep(duration);
            // lets an enclosing `timeout` look at its deadline
            tokio::task::yield_now().await;
        }
    }

    /// The deadline is checked each time `fut` is polled. Blocking waits
    /// inside `fut` are not interrupted, so they should carry their own
    /// timeout.
    fn timeout<F>(duration: Duration, fut: F) -> impl Future<Output = Option<F::Output>> + Send
    where
        F: Future + Send,
        F::Output: Send,
    {
        let deadline = Instant::now() + duration;
        let mut fut = Box::pin(fut);
        std::future::poll_fn(move |cx| {
            if Instant::now() >= deadline {
                return Poll::Ready(None);
            }
            fut.as_mut().poll(cx).map(Some)
        })
    }

    fn detach<F>(fut: F) -> impl Future<Output = ()> + Send
    where
        F: Future<Output = ()> + Send + 'static,
    {
        fut
    }

    fn shield<F>(fut: F) -> impl Future<Output = GelResult<()>> + Send
    where
        F: Future<Output = GelResult<()>> + Send + 'static,
    {
        // A blocked thread cannot be cancelled, so running inline is enough.
        fut
    }
}

struct QueueState<T> {
    items: Vec<T>,
    capacity: usize,
}

/// LIFO stack guarded by a mutex and condition variable.
pub struct ThreadQueue<T> {
    state: Mutex<QueueState<T>>,
    available: Condvar,
}

impl<T: Send + 'static> WaitQueue<T> for ThreadQueue<T> {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(QueueState {
                items: Vec::with_capacity(capacity),
                capacity,
            }),
            available: Condvar::new(),
        }
    }

    fn push(&self, item: T) -> Result<(), T> {
        let mut state = self.state.lock();
        if state.items.len() >= state.capacity {
            return Err(item);
        }
        state.items.push(item);
        drop(state);
        self.available.notify_one();
        Ok(())
    }

    fn pop(&self, timeout: Option<Duration>) -> impl Future<Output = Option<T>> + Send + '_ {
        async move {
            let deadline = timeout.map(|t| Instant::now() + t);
            let mut state = self.state.lock();
            loop {
                if let Some(item) = state.items.pop() {
                    return Some(item);
                }
                match deadline {
                    Some(deadline) => {
                        if self.available.wait_until(&mut state, deadline).timed_out() {
                            return state.items.pop();
                        }
                    }
                    None => self.available.wait(&mut state),
                }
            }
        }
    }

    fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    fn set_capacity(&self, capacity: usize) {
        self.state.lock().capacity = capacity;
    }
}

/// Release flag backed by a mutex and condition variable.
pub struct ThreadEvent {
    set: Mutex<bool>,
    changed: Condvar,
}

impl ReleaseEvent for ThreadEvent {
    fn new_set() -> Self {
        Self {
            set: Mutex::new(true),
            changed: Condvar::new(),
        }
    }

    fn set(&self) {
        *self.set.lock() = true;
        self.changed.notify_all();
    }

    fn clear(&self) {
        *self.set.lock() = false;
    }

    fn is_set(&self) -> bool {
        *self.set.lock()
    }

    fn wait(&self, timeout: Option<Duration>) -> impl Future<Output = bool> + Send + '_ {
        async move {
            let deadline = timeout.map(|t| Instant::now() + t);
            let mut set = self.set.lock();
            while !*set {
                match deadline {
                    Some(deadline) => {
                        if self.changed.wait_until(&mut set, deadline).timed_out() {
                            return *set;
                        }
                    }
                    None => self.changed.wait(&mut set),
                }
            }
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn block_on<F: Future>(fut: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(fut)
    }

    #[test]
    fn test_queue_is_lifo() {
        let queue: ThreadQueue<u32> = ThreadQueue::with_capacity(2);
        queue.push(1).unwrap();
        queue.push(2).unwrap();
        assert_eq!(block_on(queue.pop(None)), Some(2));
        assert_eq!(block_on(queue.pop(None)), Some(1));
    }

    #[test]
    fn test_queue_pop_times_out() {
        let queue: ThreadQueue<u32> = ThreadQueue::with_capacity(1);
        let started = Instant::now();
        assert_eq!(block_on(queue.pop(Some(Duration::from_millis(20)))), None);
        assert!(started.elapsed() >= Duration::from_millis(20));
    }

    #[test]
    fn test_queue_wakes_blocked_thread() {
        let queue: Arc<ThreadQueue<u32>> = Arc::new(ThreadQueue::with_capacity(1));
        let waiter = {
            let queue = queue.clone();
            thread::spawn(move || block_on(queue.pop(Some(Duration::from_secs(5)))))
        };
        thread::sleep(Duration::from_millis(10));
        queue.push(9).unwrap();
        assert_eq!(waiter.join().unwrap(), Some(9));
    }

    #[test]
    fn test_event_wait_across_threads() {
        let event = Arc::new(ThreadEvent::new_set());
        event.clear();
        assert!(!block_on(event.wait(Some(Duration::from_millis(10)))));

        let setter = {
            let event = event.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(10));
                event.set();
            })
        };
        assert!(block_on(event.wait(Some(Duration::from_secs(5)))));
        setter.join().unwrap();
    }

    #[test]
    fn test_timeout_checks_deadline_between_sleeps() {
        assert_eq!(block_on(Threaded::timeout(Duration::from_secs(1), async { 5 })), Some(5));

        let started = Instant::now();
        let looping = async {
            for _ in 0..1000 {
                Threaded::sleep(Duration::from_millis(5)).await;
            }
        };
        assert_eq!(block_on(Threaded::timeout(Duration::from_millis(30), looping)), None);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
