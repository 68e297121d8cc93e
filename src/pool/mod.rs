//! Connection pool.
//!
//! This module provides the pool and its connection holders:
//! - A fixed set of holders behind a LIFO queue of free holders
//! - Lazy connect with a cached working target after the first success
//! - Generation-based expiry of idle connections
//! - Graceful close with terminate fallback
//!
//! The pool is generic over a [`Scheduler`], so the same code backs the
//! tokio client and the thread-based [`blocking`](crate::blocking) client.

mod holder;

pub use holder::PooledConnection;

use crate::cache::QueryCacheHandle;
use crate::config::{ConnectArgs, ConnectTarget, PoolConfig};
use crate::connection::{Connection, ConnectionFactory, connect};
use crate::error::{GelError, GelResult};
use crate::options::{ClientOptions, RetryOptions, TransactionOptions, WarningHandling};
use crate::resolve::{ConfigResolver, StaticResolver};
use crate::scheduler::{Cooperative, Scheduler, WaitQueue};
use crate::transaction::{RetryController, Transaction};
use holder::Holder;
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A close still waiting for connections after this long is logged.
const CLOSE_WARNING_AFTER: Duration = Duration::from_secs(60);

/// Pool running on tokio tasks.
pub type AsyncPool<F> = Pool<Cooperative, F>;

/// Snapshot of pool usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub max_concurrency: usize,
    pub holders: usize,
    pub free: usize,
    pub connected: usize,
    pub generation: u64,
}

pub(crate) struct PoolInner<S: Scheduler, F: ConnectionFactory> {
    pub(crate) id: Uuid,
    pub(crate) cache: QueryCacheHandle,
    factory: F,
    resolver: Box<dyn ConfigResolver>,
    connect_args: Mutex<ConnectArgs>,
    working_target: Mutex<Option<ConnectTarget>>,
    first_connect_lock: tokio::sync::Mutex<()>,
    holders: Mutex<Vec<Arc<Holder<S, F>>>>,
    queue: S::Queue<Arc<Holder<S, F>>>,
    generation: AtomicU64,
    user_max_concurrency: Option<usize>,
    max_concurrency: AtomicUsize,
    closing: AtomicBool,
    closed: AtomicBool,
}

impl<S: Scheduler, F: ConnectionFactory> PoolInner<S, F> {
    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn holders_snapshot(&self) -> Vec<Arc<Holder<S, F>>> {
        self.holders.lock().clone()
    }

    /// Put a free holder back on the queue, waking one waiter.
    pub(crate) fn requeue(&self, holder: Arc<Holder<S, F>>) {
        if let Err(holder) = self.queue.push(holder) {
            error!(
                pool = %self.id,
                holder = holder.index(),
                "Free queue is full; holder lost"
            );
        }
    }

    /// Create and connect a new connection.
    ///
    /// The first successful connect caches the working target; later
    /// connects skip resolution.
    pub(crate) async fn new_connection(&self, single_attempt: bool) -> GelResult<F::Connection> {
        let cached = self.working_target.lock().clone();
        if let Some(target) = cached {
            return self.connect_target(target, single_attempt).await;
        }

        let _first = self.first_connect_lock.lock().await;
        let cached = self.working_target.lock().clone();
        if let Some(target) = cached {
            return self.connect_target(target, single_attempt).await;
        }

        let args = self.connect_args.lock().clone();
        let mut target = self.resolver.resolve(&args)?;
        let con = self.connect_target(target.clone(), single_attempt).await?;

        if let Some(addr) = con.connected_addr() {
            target.addresses = vec![addr];
        }
        info!(pool = %self.id, addresses = ?target.addresses, "First connection established");
        *self.working_target.lock() = Some(target);

        if self.user_max_concurrency.is_none() {
            if let Some(suggested) = con.settings().suggested_pool_concurrency {
                if suggested > 0 && suggested != self.max_concurrency.load(Ordering::Acquire) {
                    self.resize(suggested);
                }
            }
        }
        Ok(con)
    }

    async fn connect_target(&self, target: ConnectTarget, single_attempt: bool) -> GelResult<F::Connection> {
        let con = self.factory.create(target);
        connect::<S, _>(&con, single_attempt).await?;
        Ok(con)
    }

    fn resize(&self, max_concurrency: usize) {
        let mut holders = self.holders.lock();
        let current = holders.len();
        if max_concurrency > current {
            self.queue.set_capacity(max_concurrency);
            for index in current..max_concurrency {
                let holder = Arc::new(Holder::new(index));
                holders.push(holder.clone());
                self.requeue(holder);
            }
            self.max_concurrency.store(max_concurrency, Ordering::Release);
            info!(pool = %self.id, from = current, to = max_concurrency, "Pool resized");
        } else if max_concurrency < current {
            // TODO: shrink the pool by retiring free holders above the new size
            warn!(
                pool = %self.id,
                current,
                requested = max_concurrency,
                "Shrinking the pool is not supported; keeping current size"
            );
        }
    }

    async fn wait_all_released(&self, timeout: Option<Duration>) -> GelResult<()> {
        let started = Instant::now();
        let deadline = timeout.map(|t| started + t);
        let warn_at = started + CLOSE_WARNING_AFTER;
        let mut warned = false;

        for holder in self.holders_snapshot() {
            loop {
                let wait_until = if warned {
                    deadline
                } else {
                    Some(deadline.map_or(warn_at, |d| d.min(warn_at)))
                };
                let wait = wait_until.map(|t| t.saturating_duration_since(Instant::now()));
                if holder.wait_until_released(wait).await {
                    break;
                }
                let now = Instant::now();
                if let (Some(deadline), Some(timeout)) = (deadline, timeout) {
                    if now >= deadline {
                        return Err(GelError::interface(format!(
                            "client is not fully closed in {} seconds; terminating now.",
                            timeout.as_secs_f64()
                        )));
                    }
                }
                if !warned && now >= warn_at {
                    warned = true;
                    warn!(
                        pool = %self.id,
                        holder = holder.index(),
                        "Pool close is taking more than 60 seconds; are all connections released?"
                    );
                }
            }
        }
        Ok(())
    }

    async fn close_holders(&self, timeout: Option<Duration>) -> GelResult<()> {
        self.wait_all_released(timeout).await?;
        for holder in self.holders_snapshot() {
            holder.close().await?;
        }
        Ok(())
    }

    fn terminate_holders(&self) {
        for holder in self.holders_snapshot() {
            holder.terminate();
        }
    }

    fn finish_close(&self, terminate: bool) {
        if terminate {
            self.terminate_holders();
        }
        self.closed.store(true, Ordering::Release);
        self.closing.store(false, Ordering::Release);
    }
}

/// Terminates the pool if a close is abandoned midway.
struct CloseGuard<'a, S: Scheduler, F: ConnectionFactory> {
    pool: &'a PoolInner<S, F>,
    armed: bool,
}

impl<S: Scheduler, F: ConnectionFactory> Drop for CloseGuard<'_, S, F> {
    fn drop(&mut self) {
        if self.armed {
            warn!(pool = %self.pool.id, "Pool close cancelled; terminating connections");
            self.pool.finish_close(true);
        }
    }
}

/// Returns a popped holder to the queue unless the acquire completed.
struct RequeueGuard<'a, S: Scheduler, F: ConnectionFactory> {
    pool: &'a PoolInner<S, F>,
    holder: Option<Arc<Holder<S, F>>>,
}

impl<S: Scheduler, F: ConnectionFactory> RequeueGuard<'_, S, F> {
    fn disarm(mut self) -> Option<Arc<Holder<S, F>>> {
        self.holder.take()
    }
}

impl<S: Scheduler, F: ConnectionFactory> Drop for RequeueGuard<'_, S, F> {
    fn drop(&mut self) {
        if let Some(holder) = self.holder.take() {
            debug!(pool = %self.pool.id, holder = holder.index(), "Acquire failed; requeueing holder");
            self.pool.requeue(holder);
        }
    }
}

/// A bounded pool of lazily connected connections.
///
/// Cloning is cheap: clones share the same connections. The `with_*`
/// methods return a clone with different options.
pub struct Pool<S: Scheduler, F: ConnectionFactory> {
    pub(crate) inner: Arc<PoolInner<S, F>>,
    pub(crate) options: Arc<ClientOptions>,
}

impl<S: Scheduler, F: ConnectionFactory> Clone for Pool<S, F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            options: self.options.clone(),
        }
    }
}

impl<S: Scheduler, F: ConnectionFactory> std::fmt::Debug for Pool<S, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.inner.id)
            .field("scheduler", &S::NAME)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

impl<S: Scheduler, F: ConnectionFactory> Pool<S, F> {
    /// Create a pool. No connection is opened until the first acquire.
    pub fn new(
        factory: F,
        resolver: impl ConfigResolver,
        connect_args: ConnectArgs,
        config: PoolConfig,
    ) -> GelResult<Self> {
        config.validate().map_err(GelError::configuration)?;
        let max_concurrency = config.max_concurrency_or_default();

        let inner = Arc::new(PoolInner {
            id: Uuid::new_v4(),
            cache: QueryCacheHandle::new(),
            factory,
            resolver: Box::new(resolver),
            connect_args: Mutex::new(connect_args),
            working_target: Mutex::new(None),
            first_connect_lock: tokio::sync::Mutex::new(()),
            holders: Mutex::new(Vec::with_capacity(max_concurrency)),
            queue: S::Queue::with_capacity(max_concurrency),
            generation: AtomicU64::new(0),
            user_max_concurrency: config.max_concurrency,
            max_concurrency: AtomicUsize::new(0),
            closing: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });
        inner.resize(max_concurrency);
        debug!(pool = %inner.id, scheduler = S::NAME, max_concurrency, "Pool created");

        Ok(Self {
            inner,
            options: Arc::new(ClientOptions::default()),
        })
    }

    /// Create a pool that always connects to `target`.
    pub fn with_target(factory: F, target: ConnectTarget, config: PoolConfig) -> GelResult<Self> {
        Self::new(
            factory,
            StaticResolver::new(target),
            ConnectArgs::default(),
            config,
        )
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    fn with_options(&self, update: impl FnOnce(&mut ClientOptions)) -> Self {
        let mut options = (*self.options).clone();
        update(&mut options);
        Self {
            inner: self.inner.clone(),
            options: Arc::new(options),
        }
    }

    pub fn with_retry_options(&self, retry: RetryOptions) -> Self {
        self.with_options(|o| o.retry = retry)
    }

    pub fn with_transaction_options(&self, transaction: TransactionOptions) -> Self {
        self.with_options(|o| o.transaction = transaction)
    }

    pub fn with_warning_handling(&self, warnings: WarningHandling) -> Self {
        self.with_options(|o| o.warnings = warnings)
    }

    /// Borrow a connection, waiting for a free slot.
    pub async fn acquire(&self) -> GelResult<PooledConnection<S, F>> {
        self.acquire_with(None, false).await
    }

    /// Borrow a connection within `timeout`, including any connect it needs.
    pub async fn acquire_timeout(&self, timeout: Duration) -> GelResult<PooledConnection<S, F>> {
        self.acquire_with(Some(timeout), false).await
    }

    pub(crate) async fn acquire_with(
        &self,
        timeout: Option<Duration>,
        single_attempt: bool,
    ) -> GelResult<PooledConnection<S, F>> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(GelError::interface("pool is closed"));
        }
        if inner.closing.load(Ordering::Acquire) {
            return Err(GelError::interface("pool is closing"));
        }

        let timed_out = || {
            GelError::timeout(
                "pool acquire",
                timeout.map_or(0, |t| t.as_millis() as u64),
            )
        };
        // The deadline covers both the wait for a holder and its connect.
        let acquire = async {
            let holder = inner.queue.pop(timeout).await.ok_or_else(timed_out)?;
            let guard = RequeueGuard {
                pool: inner,
                holder: Some(holder.clone()),
            };
            let con = holder.acquire(inner, single_attempt, timeout).await?;
            guard.disarm();
            Ok::<_, GelError>((holder, con))
        };
        let (holder, con) = match timeout {
            Some(t) => S::timeout(t, acquire).await.ok_or_else(timed_out)??,
            None => acquire.await?,
        };

        debug!(pool = %inner.id, holder = holder.index(), "Connection acquired");
        Ok(PooledConnection::new(
            inner.clone(),
            holder,
            con,
            self.options.clone(),
        ))
    }

    /// Return a connection to the pool.
    ///
    /// Completes even if the calling task is cancelled.
    pub async fn release(&self, mut con: PooledConnection<S, F>) -> GelResult<()> {
        let Some(holder) = con.holder.take() else {
            return Ok(());
        };

        if !Arc::ptr_eq(&con.pool, &self.inner) {
            let description = format!("<PooledConnection holder={} pool={}>", holder.index(), con.pool.id);
            // hand it back to the pool it came from
            S::shield(holder.release(con.pool.clone())).await?;
            return Err(GelError::interface(format!(
                "release() received invalid connection: {} is not a member of this pool",
                description
            )));
        }

        debug!(pool = %self.inner.id, holder = holder.index(), "Releasing connection");
        S::shield(holder.release(self.inner.clone())).await
    }

    /// Mark every open connection as stale.
    ///
    /// Idle connections are replaced on their next acquire; connections in
    /// use are closed when released.
    pub fn expire_connections(&self) {
        let generation = self.inner.generation.fetch_add(1, Ordering::AcqRel) + 1;
        info!(pool = %self.inner.id, generation, "Connections expired");
    }

    /// Grow the pool to `max_concurrency` holders.
    pub fn resize(&self, max_concurrency: usize) {
        self.inner.resize(max_concurrency);
    }

    /// Make sure at least one holder has an open connection.
    pub async fn ensure_connected(&self) -> GelResult<()> {
        let holders = self.inner.holders_snapshot();
        if holders.iter().any(|h| h.is_connected()) {
            return Ok(());
        }
        let first = holders
            .first()
            .ok_or_else(|| GelError::internal("pool has no connection holders"))?;
        first.clear_connection();
        first.connect(&self.inner, false).await?;
        Ok(())
    }

    /// Wait for all connections to be released, then close them.
    ///
    /// Any failure, timeout or cancellation terminates all connections.
    pub async fn close(&self, timeout: Option<Duration>) -> GelResult<()> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Ok(());
        }
        inner.closing.store(true, Ordering::Release);

        let mut guard = CloseGuard {
            pool: inner,
            armed: true,
        };
        let result = inner.close_holders(timeout).await;
        guard.armed = false;

        if let Err(e) = &result {
            warn!(pool = %inner.id, error = %e, "Pool close failed; terminating connections");
        }
        inner.finish_close(result.is_err());
        info!(pool = %inner.id, "Pool closed");
        result
    }

    /// Abort every connection and close the pool immediately.
    pub fn terminate(&self) {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return;
        }
        inner.finish_close(true);
        info!(pool = %inner.id, "Pool terminated");
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Replace the connect arguments.
    ///
    /// The working target and caches are reset; open connections stay until
    /// they are expired or closed.
    pub fn set_connect_args(&self, args: ConnectArgs) {
        *self.inner.connect_args.lock() = args;
        *self.inner.working_target.lock() = None;
        self.inner.cache.clear();
        debug!(pool = %self.inner.id, "Connect arguments replaced");
    }

    pub fn max_concurrency(&self) -> usize {
        self.inner.max_concurrency.load(Ordering::Acquire)
    }

    /// Number of holders waiting in the free queue.
    pub fn free_size(&self) -> usize {
        self.inner.queue.len()
    }

    pub fn stats(&self) -> PoolStats {
        let holders = self.inner.holders_snapshot();
        PoolStats {
            max_concurrency: self.max_concurrency(),
            holders: holders.len(),
            free: self.free_size(),
            connected: holders.iter().filter(|h| h.is_connected()).count(),
            generation: self.inner.generation(),
        }
    }

    /// Run a query on a pooled connection. Read-only queries and
    /// transaction conflicts are retried.
    pub async fn query(&self, query: &str, args: &[serde_json::Value]) -> GelResult<Vec<serde_json::Value>> {
        let con = self.acquire().await?;
        let result = con.query(query, args).await;
        self.finish(con, result).await
    }

    pub async fn query_single(
        &self,
        query: &str,
        args: &[serde_json::Value],
    ) -> GelResult<Option<serde_json::Value>> {
        let con = self.acquire().await?;
        let result = con.query_single(query, args).await;
        self.finish(con, result).await
    }

    pub async fn query_json(&self, query: &str, args: &[serde_json::Value]) -> GelResult<String> {
        let con = self.acquire().await?;
        let result = con.query_json(query, args).await;
        self.finish(con, result).await
    }

    pub async fn execute(&self, query: &str, args: &[serde_json::Value]) -> GelResult<()> {
        let con = self.acquire().await?;
        let result = con.execute(query, args).await;
        self.finish(con, result).await
    }

    /// Release `con`; the operation's error wins over a release error.
    async fn finish<T>(&self, con: PooledConnection<S, F>, result: GelResult<T>) -> GelResult<T> {
        let released = self.release(con).await;
        let value = result?;
        released?;
        Ok(value)
    }

    /// Start a retrying transaction loop.
    pub fn retry(&self) -> RetryController<S, F> {
        RetryController::new(self.clone())
    }

    /// Run `body` in a transaction, retrying it on transient conflicts.
    ///
    /// Returns the value of the first attempt that commits.
    pub async fn transaction<T, B, Fut>(&self, body: B) -> GelResult<T>
    where
        B: FnMut(Transaction<S, F>) -> Fut,
        Fut: Future<Output = GelResult<T>>,
    {
        self.retry().run(body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Address;
    use crate::sim::{SimFactory, SimServer};

    fn pool(server: &SimServer, max_concurrency: Option<usize>) -> AsyncPool<SimFactory> {
        Pool::with_target(
            SimFactory::new(server.clone()),
            ConnectTarget::new(vec![Address::tcp("sim", 5656)]),
            PoolConfig { max_concurrency },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_new_pool_is_lazy() {
        let server = SimServer::new();
        let pool = pool(&server, Some(3));
        let stats = pool.stats();
        assert_eq!(stats.holders, 3);
        assert_eq!(stats.free, 3);
        assert_eq!(stats.connected, 0);
        assert_eq!(server.connects(), 0);
    }

    #[tokio::test]
    async fn test_zero_concurrency_rejected() {
        let server = SimServer::new();
        let result = Pool::<Cooperative, _>::with_target(
            SimFactory::new(server),
            ConnectTarget::new(vec![Address::tcp("sim", 5656)]),
            PoolConfig::with_max_concurrency(0),
        );
        assert!(matches!(result, Err(GelError::Configuration { .. })));
    }

    #[tokio::test]
    async fn test_acquire_release_reuses_connection() {
        let server = SimServer::new();
        let pool = pool(&server, Some(1));

        let con = pool.acquire().await.unwrap();
        assert_eq!(pool.free_size(), 0);
        pool.release(con).await.unwrap();
        assert_eq!(pool.free_size(), 1);

        let con = pool.acquire().await.unwrap();
        pool.release(con).await.unwrap();
        assert_eq!(server.connects(), 1);
    }

    #[tokio::test]
    async fn test_working_target_cached_after_first_connect() {
        let server = SimServer::new();
        let pool = pool(&server, Some(2));
        let a = pool.acquire().await.unwrap();
        let b = pool.acquire().await.unwrap();
        let cached = pool.inner.working_target.lock().clone().unwrap();
        assert_eq!(cached.addresses, vec![Address::tcp("sim", 5656)]);
        pool.release(a).await.unwrap();
        pool.release(b).await.unwrap();
        assert_eq!(server.connects(), 2);
    }

    #[tokio::test]
    async fn test_set_connect_args_resets_working_target() {
        let server = SimServer::new();
        let pool = pool(&server, Some(1));
        pool.query("get a", &[]).await.unwrap();
        assert!(pool.inner.working_target.lock().is_some());
        assert!(!pool.inner.cache.queries.is_empty());

        pool.set_connect_args(ConnectArgs::host_port("elsewhere", 5656));
        assert!(pool.inner.working_target.lock().is_none());
        assert!(pool.inner.cache.queries.is_empty());
    }

    #[tokio::test]
    async fn test_shrink_is_ignored() {
        let server = SimServer::new();
        let pool = pool(&server, Some(3));
        pool.resize(1);
        assert_eq!(pool.stats().holders, 3);
        assert_eq!(pool.max_concurrency(), 3);
    }

    #[tokio::test]
    async fn test_with_options_shares_pool() {
        let server = SimServer::new();
        let pool = pool(&server, Some(1));
        let strict = pool.with_warning_handling(WarningHandling::Raise);
        assert!(Arc::ptr_eq(&pool.inner, &strict.inner));
        assert_eq!(strict.options().warnings, WarningHandling::Raise);
        assert_eq!(pool.options().warnings, WarningHandling::Log);
    }
}
