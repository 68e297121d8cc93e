//! Connection holders and the pooled connection wrapper.

use super::PoolInner;
use crate::connection::{Connection, ConnectionFactory, ExecuteContext, QueryContext, retry_operation};
use crate::error::{GelError, GelResult};
use crate::options::ClientOptions;
use crate::scheduler::{ReleaseEvent, Scheduler};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{debug, warn};

struct HolderState<C> {
    con: Option<Arc<C>>,
    generation: u64,
    timeout: Option<Duration>,
}

/// Owns the lifecycle of one connection slot of a pool.
///
/// A holder is either in the pool's free queue or lent out, never both.
/// `free` guards that transition; `released` lets `close()` wait for it.
pub(crate) struct Holder<S: Scheduler, F: ConnectionFactory> {
    index: usize,
    state: Mutex<HolderState<F::Connection>>,
    free: AtomicBool,
    released: S::Event,
}

impl<S: Scheduler, F: ConnectionFactory> Holder<S, F> {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            state: Mutex::new(HolderState {
                con: None,
                generation: 0,
                timeout: None,
            }),
            free: AtomicBool::new(true),
            released: S::Event::new_set(),
        }
    }

    pub(crate) fn index(&self) -> usize {
        self.index
    }

    pub(crate) fn is_free(&self) -> bool {
        self.free.load(Ordering::Acquire)
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.state
            .lock()
            .con
            .as_ref()
            .is_some_and(|con| !con.is_closed())
    }

    pub(crate) fn clear_connection(&self) {
        self.state.lock().con = None;
    }

    /// Open a new connection for this slot, stamped with the pool's generation.
    pub(crate) async fn connect(
        &self,
        pool: &PoolInner<S, F>,
        single_attempt: bool,
    ) -> GelResult<Arc<F::Connection>> {
        let occupied = self.state.lock().con.is_some();
        if occupied {
            return Err(GelError::internal(
                "ConnectionHolder.connect() called while another connection already exists",
            ));
        }

        let con = Arc::new(pool.new_connection(single_attempt).await?);
        let mut state = self.state.lock();
        state.con = Some(con.clone());
        state.generation = pool.generation();
        debug!(holder = self.index, generation = state.generation, "Holder connected");
        Ok(con)
    }

    /// Hand out this slot's connection, connecting or replacing it as needed.
    pub(crate) async fn acquire(
        &self,
        pool: &PoolInner<S, F>,
        single_attempt: bool,
        timeout: Option<Duration>,
    ) -> GelResult<Arc<F::Connection>> {
        let current = {
            let state = self.state.lock();
            state.con.clone().map(|con| (con, state.generation))
        };

        let con = match current {
            Some((con, generation)) if !con.is_closed() && generation == pool.generation() => con,
            Some((stale, generation)) if !stale.is_closed() => {
                debug!(
                    holder = self.index,
                    generation,
                    current = pool.generation(),
                    "Replacing expired connection"
                );
                self.clear_connection();
                S::detach(async move {
                    if let Err(e) = stale.close().await {
                        debug!(error = %e, "Closing expired connection failed");
                        stale.terminate();
                    }
                })
                .await;
                self.connect(pool, single_attempt).await?
            }
            _ => {
                self.clear_connection();
                self.connect(pool, single_attempt).await?
            }
        };

        self.state.lock().timeout = timeout;
        self.free.store(false, Ordering::Release);
        self.released.clear();
        Ok(con)
    }

    /// Give the slot back to the pool.
    ///
    /// A closed connection is dropped from the slot; an expired one is closed
    /// instead of recycled. Releasing a free holder does nothing.
    pub(crate) async fn release(self: Arc<Self>, pool: Arc<PoolInner<S, F>>) -> GelResult<()> {
        if self.is_free() {
            return Ok(());
        }

        let (con, generation, timeout) = {
            let mut state = self.state.lock();
            (state.con.clone(), state.generation, state.timeout.take())
        };

        let con = match con {
            Some(con) if !con.is_closed() => con,
            _ => {
                self.release_on_close(&pool);
                return Ok(());
            }
        };

        if generation != pool.generation() {
            debug!(holder = self.index, generation, "Closing expired connection on release");
            let closed = match timeout {
                Some(t) => S::timeout(t, con.close())
                    .await
                    .unwrap_or_else(|| Err(GelError::timeout("connection close", t.as_millis() as u64))),
                None => con.close().await,
            };
            if let Err(e) = closed {
                debug!(holder = self.index, error = %e, "Graceful close failed; terminating");
                con.terminate();
            }
            self.release_on_close(&pool);
            return Ok(());
        }

        self.mark_free(&pool);
        Ok(())
    }

    /// Drop the connection from the slot and return the slot to the queue.
    pub(crate) fn release_on_close(self: &Arc<Self>, pool: &PoolInner<S, F>) {
        self.clear_connection();
        self.mark_free(pool);
    }

    fn mark_free(self: &Arc<Self>, pool: &PoolInner<S, F>) {
        if self
            .free
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.released.set();
        pool.requeue(self.clone());
    }

    pub(crate) async fn wait_until_released(&self, timeout: Option<Duration>) -> bool {
        self.released.wait(timeout).await
    }

    pub(crate) async fn close(&self) -> GelResult<()> {
        let con = self.state.lock().con.clone();
        match con {
            Some(con) => con.close().await,
            None => Ok(()),
        }
    }

    pub(crate) fn terminate(&self) {
        let con = self.state.lock().con.clone();
        if let Some(con) = con {
            con.terminate();
        }
    }
}

/// A connection lent out by a pool.
///
/// Return it with [`Pool::release`](super::Pool::release). Dropping it
/// unreleased terminates the connection and frees its slot.
pub struct PooledConnection<S: Scheduler, F: ConnectionFactory> {
    pub(crate) pool: Arc<PoolInner<S, F>>,
    pub(crate) holder: Option<Arc<Holder<S, F>>>,
    con: Arc<F::Connection>,
    options: Arc<ClientOptions>,
}

impl<S: Scheduler, F: ConnectionFactory> PooledConnection<S, F> {
    pub(crate) fn new(
        pool: Arc<PoolInner<S, F>>,
        holder: Arc<Holder<S, F>>,
        con: Arc<F::Connection>,
        options: Arc<ClientOptions>,
    ) -> Self {
        Self {
            pool,
            holder: Some(holder),
            con,
            options,
        }
    }

    /// The underlying connection.
    pub fn connection(&self) -> &F::Connection {
        &self.con
    }

    pub(crate) fn shared(&self) -> Arc<F::Connection> {
        self.con.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.con.is_closed()
    }

    pub fn holder_index(&self) -> Option<usize> {
        self.holder.as_ref().map(|h| h.index())
    }

    /// Abort the connection and give the slot back to the pool.
    pub fn terminate(mut self) {
        self.con.terminate();
        if let Some(holder) = self.holder.take() {
            holder.release_on_close(&self.pool);
        }
    }

    pub async fn query(&self, query: &str, args: &[serde_json::Value]) -> GelResult<Vec<serde_json::Value>> {
        let ctx = QueryContext::new(query, self.pool.cache.clone()).with_args(args.to_vec());
        Ok(self.run_query(&ctx).await?.into_rows())
    }

    pub async fn query_single(
        &self,
        query: &str,
        args: &[serde_json::Value],
    ) -> GelResult<Option<serde_json::Value>> {
        let ctx = QueryContext::new(query, self.pool.cache.clone())
            .with_args(args.to_vec())
            .single();
        self.run_query(&ctx).await?.into_single()
    }

    pub async fn query_json(&self, query: &str, args: &[serde_json::Value]) -> GelResult<String> {
        let ctx = QueryContext::new(query, self.pool.cache.clone())
            .with_args(args.to_vec())
            .output(crate::cache::OutputFormat::Json);
        let response = self.run_query(&ctx).await?;
        serde_json::to_string(&response.data)
            .map_err(|e| GelError::internal(format!("cannot encode result: {}", e)))
    }

    pub async fn execute(&self, query: &str, args: &[serde_json::Value]) -> GelResult<()> {
        let mut ctx = ExecuteContext::new(query, self.pool.cache.clone());
        ctx.args = args.to_vec();
        let ctx = &ctx;
        let con = self.con.as_ref();
        let warnings = retry_operation::<S, _, _, _, _, _>(
            con,
            Some(&self.options.retry),
            move || ctx.capabilities().is_some_and(|c| c.is_read_only()),
            move || con.execute(ctx),
        )
        .await?;
        self.options.warnings.handle(warnings)
    }

    async fn run_query(&self, ctx: &QueryContext) -> GelResult<crate::connection::QueryResponse> {
        let con = self.con.as_ref();
        let mut response = retry_operation::<S, _, _, _, _, _>(
            con,
            Some(&self.options.retry),
            move || ctx.capabilities().is_some_and(|c| c.is_read_only()),
            move || con.raw_query(ctx),
        )
        .await?;
        let warnings = std::mem::take(&mut response.warnings);
        self.options.warnings.handle(warnings)?;
        Ok(response)
    }
}

impl<S: Scheduler, F: ConnectionFactory> std::fmt::Debug for PooledConnection<S, F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pool", &self.pool.id)
            .field("holder", &self.holder_index())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl<S: Scheduler, F: ConnectionFactory> Drop for PooledConnection<S, F> {
    fn drop(&mut self) {
        let Some(holder) = self.holder.take() else {
            return;
        };
        warn!(
            pool = %self.pool.id,
            holder = holder.index(),
            "Pooled connection dropped without release; terminating it"
        );
        self.con.terminate();
        holder.release_on_close(&self.pool);
    }
}
