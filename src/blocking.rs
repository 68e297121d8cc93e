//! Blocking client for OS threads.
//!
//! [`Client`] wraps a [`Pool`] instantiated with the [`Threaded`] scheduler.
//! Each calling thread lazily creates its own current-thread tokio runtime and
//! blocks on the shared async core, so waits for a free connection, backoff
//! sleeps and connects all block only the calling thread.
//!
//! ```ignore
//! let client = Client::with_target(factory, target, PoolConfig::default())?;
//! let value = client.transaction(|tx| {
//!     tx.query_single("incr counter", &[])
//! })?;
//! ```

use crate::config::{ConnectArgs, ConnectTarget, PoolConfig};
use crate::connection::ConnectionFactory;
use crate::error::{GelError, GelResult};
use crate::options::{ClientOptions, RetryOptions, TransactionOptions, WarningHandling};
use crate::pool::{Pool, PoolStats, PooledConnection};
use crate::resolve::ConfigResolver;
use crate::scheduler::Threaded;
use crate::transaction::{RetryController, Transaction, TransactionState};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::cell::OnceCell;
use std::future::Future;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};

thread_local! {
    static RUNTIME: OnceCell<Runtime> = const { OnceCell::new() };
}

/// Drive `fut` to completion on this thread's runtime.
fn block_on<Fut: Future>(fut: Fut) -> GelResult<Fut::Output> {
    RUNTIME.with(|cell| {
        if cell.get().is_none() {
            let runtime = Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|e| GelError::internal(format!("cannot start runtime: {}", e)))?;
            let _ = cell.set(runtime);
        }
        let runtime = cell
            .get()
            .ok_or_else(|| GelError::internal("thread runtime is not initialized"))?;
        Ok(runtime.block_on(fut))
    })
}

fn run<T>(fut: impl Future<Output = GelResult<T>>) -> GelResult<T> {
    block_on(fut)?
}

/// Thread-safe blocking client. Clones share the same pool.
pub struct Client<F: ConnectionFactory> {
    pool: Pool<Threaded, F>,
}

impl<F: ConnectionFactory> Clone for Client<F> {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
        }
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for Client<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client").field("pool", &self.pool).finish()
    }
}

impl<F: ConnectionFactory> Client<F> {
    pub fn new(
        factory: F,
        resolver: impl ConfigResolver,
        connect_args: ConnectArgs,
        config: PoolConfig,
    ) -> GelResult<Self> {
        Ok(Self {
            pool: Pool::new(factory, resolver, connect_args, config)?,
        })
    }

    pub fn with_target(factory: F, target: ConnectTarget, config: PoolConfig) -> GelResult<Self> {
        Ok(Self {
            pool: Pool::with_target(factory, target, config)?,
        })
    }

    /// The underlying pool.
    pub fn pool(&self) -> &Pool<Threaded, F> {
        &self.pool
    }

    pub fn options(&self) -> &ClientOptions {
        self.pool.options()
    }

    pub fn with_retry_options(&self, retry: RetryOptions) -> Self {
        Self {
            pool: self.pool.with_retry_options(retry),
        }
    }

    pub fn with_transaction_options(&self, transaction: TransactionOptions) -> Self {
        Self {
            pool: self.pool.with_transaction_options(transaction),
        }
    }

    pub fn with_warning_handling(&self, warnings: WarningHandling) -> Self {
        Self {
            pool: self.pool.with_warning_handling(warnings),
        }
    }

    /// Borrow a connection, blocking until a slot is free.
    pub fn acquire(&self) -> GelResult<BlockingConnection<F>> {
        let con = run(self.pool.acquire())?;
        Ok(BlockingConnection { con })
    }

    pub fn acquire_timeout(&self, timeout: Duration) -> GelResult<BlockingConnection<F>> {
        let con = run(self.pool.acquire_timeout(timeout))?;
        Ok(BlockingConnection { con })
    }

    pub fn release(&self, con: BlockingConnection<F>) -> GelResult<()> {
        run(self.pool.release(con.con))
    }

    pub fn query(&self, query: &str, args: &[Value]) -> GelResult<Vec<Value>> {
        run(self.pool.query(query, args))
    }

    pub fn query_single(&self, query: &str, args: &[Value]) -> GelResult<Option<Value>> {
        run(self.pool.query_single(query, args))
    }

    pub fn query_json(&self, query: &str, args: &[Value]) -> GelResult<String> {
        run(self.pool.query_json(query, args))
    }

    pub fn execute(&self, query: &str, args: &[Value]) -> GelResult<()> {
        run(self.pool.execute(query, args))
    }

    /// Start a retrying transaction loop.
    pub fn retry(&self) -> BlockingRetry<F> {
        BlockingRetry {
            controller: self.pool.retry(),
            failed: None,
        }
    }

    /// Run `body` in a transaction, retrying it on transient conflicts.
    pub fn transaction<T, B>(&self, mut body: B) -> GelResult<T>
    where
        B: FnMut(&BlockingTransaction<F>) -> GelResult<T>,
    {
        let mut retry = self.retry();
        for tx in retry.by_ref() {
            tx.enter()?;
            let outcome = body(&tx);
            if !tx.exit(outcome.as_ref().err())? {
                return outcome;
            }
        }
        Err(retry
            .last_error()
            .unwrap_or_else(|| GelError::internal("retry loop finished without a result")))
    }

    pub fn expire_connections(&self) {
        self.pool.expire_connections();
    }

    pub fn resize(&self, max_concurrency: usize) {
        self.pool.resize(max_concurrency);
    }

    pub fn ensure_connected(&self) -> GelResult<()> {
        run(self.pool.ensure_connected())
    }

    pub fn close(&self, timeout: Option<Duration>) -> GelResult<()> {
        run(self.pool.close(timeout))
    }

    pub fn terminate(&self) {
        self.pool.terminate();
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }

    pub fn set_connect_args(&self, args: ConnectArgs) {
        self.pool.set_connect_args(args);
    }

    pub fn max_concurrency(&self) -> usize {
        self.pool.max_concurrency()
    }

    pub fn free_size(&self) -> usize {
        self.pool.free_size()
    }

    pub fn stats(&self) -> PoolStats {
        self.pool.stats()
    }
}

/// A connection borrowed from a [`Client`].
#[derive(Debug)]
pub struct BlockingConnection<F: ConnectionFactory> {
    con: PooledConnection<Threaded, F>,
}

impl<F: ConnectionFactory> BlockingConnection<F> {
    pub fn connection(&self) -> &F::Connection {
        self.con.connection()
    }

    pub fn is_closed(&self) -> bool {
        self.con.is_closed()
    }

    pub fn holder_index(&self) -> Option<usize> {
        self.con.holder_index()
    }

    pub fn terminate(self) {
        self.con.terminate();
    }

    pub fn query(&self, query: &str, args: &[Value]) -> GelResult<Vec<Value>> {
        run(self.con.query(query, args))
    }

    pub fn query_single(&self, query: &str, args: &[Value]) -> GelResult<Option<Value>> {
        run(self.con.query_single(query, args))
    }

    pub fn execute(&self, query: &str, args: &[Value]) -> GelResult<()> {
        run(self.con.execute(query, args))
    }
}

/// Iterator over the attempts of a retrying transaction.
///
/// Each item must be entered and exited; iteration ends once an attempt
/// finishes without scheduling a retry.
pub struct BlockingRetry<F: ConnectionFactory> {
    controller: RetryController<Threaded, F>,
    failed: Option<GelError>,
}

impl<F: ConnectionFactory> BlockingRetry<F> {
    /// Error behind the last retry decision, or a runtime failure.
    pub fn last_error(&self) -> Option<GelError> {
        self.failed.clone().or_else(|| self.controller.last_error())
    }

    pub fn iterations(&self) -> u32 {
        self.controller.iterations()
    }
}

impl<F: ConnectionFactory> Iterator for BlockingRetry<F> {
    type Item = BlockingTransaction<F>;

    fn next(&mut self) -> Option<Self::Item> {
        match block_on(self.controller.next()) {
            Ok(tx) => tx.map(|tx| BlockingTransaction { tx }),
            Err(e) => {
                self.failed = Some(e);
                None
            }
        }
    }
}

/// One attempt of a blocking retrying transaction.
#[derive(Debug)]
pub struct BlockingTransaction<F: ConnectionFactory> {
    tx: Transaction<Threaded, F>,
}

impl<F: ConnectionFactory> Clone for BlockingTransaction<F> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<F: ConnectionFactory> BlockingTransaction<F> {
    pub fn iteration(&self) -> u32 {
        self.tx.iteration()
    }

    pub fn state(&self) -> TransactionState {
        self.tx.state()
    }

    pub fn enter(&self) -> GelResult<()> {
        self.tx.enter()
    }

    /// See [`Transaction::exit`].
    pub fn exit(&self, outcome: Option<&GelError>) -> GelResult<bool> {
        run(self.tx.exit(outcome))
    }

    pub fn query(&self, query: &str, args: &[Value]) -> GelResult<Vec<Value>> {
        run(self.tx.query(query, args))
    }

    pub fn query_single(&self, query: &str, args: &[Value]) -> GelResult<Option<Value>> {
        run(self.tx.query_single(query, args))
    }

    pub fn query_single_as<T: DeserializeOwned>(&self, query: &str, args: &[Value]) -> GelResult<Option<T>> {
        run(self.tx.query_single_as(query, args))
    }

    pub fn query_json(&self, query: &str, args: &[Value]) -> GelResult<String> {
        run(self.tx.query_json(query, args))
    }

    pub fn execute(&self, query: &str, args: &[Value]) -> GelResult<()> {
        run(self.tx.execute(query, args))
    }
}
