//! Retrying transactions.
//!
//! A [`RetryController`] yields one [`Transaction`] per attempt. Each attempt
//! is a scoped block: [`Transaction::enter`], queries, then
//! [`Transaction::exit`] with the body's outcome. `exit` commits or rolls back,
//! returns the connection to the pool and reports whether another attempt was
//! scheduled.
//!
//! ```ignore
//! let mut retry = pool.retry();
//! while let Some(tx) = retry.next().await {
//!     tx.enter()?;
//!     let outcome = tx.query("incr counter", &[]).await;
//!     if !tx.exit(outcome.as_ref().err()).await? {
//!         return outcome;
//!     }
//! }
//! ```

use crate::cache::OutputFormat;
use crate::connection::{Connection, ConnectionFactory, ExecuteContext, QueryContext, QueryResponse};
use crate::error::{GelError, GelResult, Tag};
use crate::options::TransactionOptions;
use crate::pool::{Pool, PooledConnection};
use crate::scheduler::Scheduler;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    New,
    Started,
    Committed,
    RolledBack,
    Failed,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::New => "new",
            Self::Started => "started",
            Self::Committed => "committed",
            Self::RolledBack => "rolledback",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Default)]
struct RetryState {
    /// Number of iterations handed out so far.
    iteration: u32,
    done: bool,
    next_backoff: Option<Duration>,
    last_error: Option<GelError>,
}

/// Produces one [`Transaction`] per attempt until an attempt succeeds or
/// the retry budget is spent.
pub struct RetryController<S: Scheduler, F: ConnectionFactory> {
    pool: Pool<S, F>,
    state: Arc<Mutex<RetryState>>,
}

impl<S: Scheduler, F: ConnectionFactory> RetryController<S, F> {
    pub(crate) fn new(pool: Pool<S, F>) -> Self {
        Self {
            pool,
            state: Arc::new(Mutex::new(RetryState::default())),
        }
    }

    /// Next attempt, after sleeping the scheduled backoff.
    ///
    /// Returns `None` once the previous attempt finished without scheduling
    /// a retry.
    pub async fn next(&mut self) -> Option<Transaction<S, F>> {
        let (index, backoff) = {
            let mut state = self.state.lock();
            if state.done {
                return None;
            }
            state.done = true;
            let index = state.iteration;
            state.iteration += 1;
            (index, state.next_backoff.take())
        };
        if let Some(backoff) = backoff {
            S::sleep(backoff).await;
        }
        Some(Transaction::new(self.pool.clone(), self.state.clone(), index))
    }

    /// Number of iterations handed out so far.
    pub fn iterations(&self) -> u32 {
        self.state.lock().iteration
    }

    /// Error that triggered the most recent retry decision.
    pub fn last_error(&self) -> Option<GelError> {
        self.state.lock().last_error.clone()
    }

    /// Drive the whole loop, returning the value of the attempt that commits.
    pub async fn run<T, B, Fut>(mut self, mut body: B) -> GelResult<T>
    where
        B: FnMut(Transaction<S, F>) -> Fut,
        Fut: Future<Output = GelResult<T>>,
    {
        while let Some(tx) = self.next().await {
            tx.enter()?;
            match body(tx.clone()).await {
                Ok(value) => {
                    if !tx.exit(None).await? {
                        return Ok(value);
                    }
                }
                Err(e) => {
                    if !tx.exit(Some(&e)).await? {
                        return Err(e);
                    }
                }
            }
        }
        Err(self
            .last_error()
            .unwrap_or_else(|| GelError::internal("retry loop finished without a result")))
    }
}

impl<S: Scheduler, F: ConnectionFactory> fmt::Debug for RetryController<S, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RetryController")
            .field("iteration", &state.iteration)
            .field("done", &state.done)
            .field("next_backoff", &state.next_backoff)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
struct Flags {
    state: TransactionState,
    started: bool,
    managed: bool,
}

struct TxInner<S: Scheduler, F: ConnectionFactory> {
    pool: Pool<S, F>,
    retry: Arc<Mutex<RetryState>>,
    options: TransactionOptions,
    index: u32,
    flags: Mutex<Flags>,
    connection: Mutex<Option<PooledConnection<S, F>>>,
    locked: AtomicBool,
}

/// One attempt of a retrying transaction.
///
/// Clones refer to the same attempt. Only one query may run at a time.
pub struct Transaction<S: Scheduler, F: ConnectionFactory> {
    inner: Arc<TxInner<S, F>>,
}

/// Alias used when a transaction is viewed as one iteration of a retry loop.
pub type Iteration<S, F> = Transaction<S, F>;

impl<S: Scheduler, F: ConnectionFactory> Clone for Transaction<S, F> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: Scheduler, F: ConnectionFactory> fmt::Debug for Transaction<S, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("state", &self.state())
            .field("iteration", &self.inner.index)
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

/// Clears the in-flight flag when an operation ends.
struct Exclusive<'a>(&'a AtomicBool);

impl Drop for Exclusive<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl<S: Scheduler, F: ConnectionFactory> Transaction<S, F> {
    fn new(pool: Pool<S, F>, retry: Arc<Mutex<RetryState>>, index: u32) -> Self {
        let options = pool.options.transaction;
        Self {
            inner: Arc::new(TxInner {
                pool,
                retry,
                options,
                index,
                flags: Mutex::new(Flags {
                    state: TransactionState::New,
                    started: false,
                    managed: false,
                }),
                connection: Mutex::new(None),
                locked: AtomicBool::new(false),
            }),
        }
    }

    /// Zero-based index of this attempt.
    pub fn iteration(&self) -> u32 {
        self.inner.index
    }

    pub fn state(&self) -> TransactionState {
        self.inner.flags.lock().state
    }

    pub fn is_active(&self) -> bool {
        self.state() == TransactionState::Started
    }

    /// Open the scope of this attempt.
    pub fn enter(&self) -> GelResult<()> {
        let mut flags = self.inner.flags.lock();
        if flags.managed {
            return Err(GelError::interface(
                "cannot enter context: already in a `transaction` block",
            ));
        }
        flags.managed = true;
        Ok(())
    }

    /// Close the scope with the body's outcome (`None` on success).
    ///
    /// Commits on success and rolls back on failure, then releases the
    /// connection. Returns `true` when another attempt has been scheduled;
    /// the caller should then move on to the next iteration instead of
    /// returning.
    pub async fn exit(&self, outcome: Option<&GelError>) -> GelResult<bool> {
        let _exclusive = self.exclusive()?;
        let started = {
            let mut flags = self.inner.flags.lock();
            flags.managed = false;
            flags.started
        };
        if !started {
            return Ok(false);
        }

        let commit = outcome.is_none();
        let finished = self.finish(commit).await;
        self.release_connection().await?;

        let mut commit_retry = false;
        if let Err(err) = finished {
            if !err.is_edgedb_error() {
                return Err(err);
            }
            if commit {
                // The commit may or may not have landed; only a transaction
                // error is known to be safe to retry.
                if err.is_transaction_error()
                    && err.has_tag(Tag::ShouldRetry)
                    && self.schedule_retry(&err)
                {
                    commit_retry = true;
                } else {
                    return Err(err);
                }
            } else {
                debug!(
                    iteration = self.inner.index,
                    error = %err,
                    "Rollback failed; keeping the original error"
                );
            }
        }

        match outcome {
            Some(ex) if ex.is_edgedb_error() && ex.has_tag(Tag::ShouldRetry) => {
                Ok(self.schedule_retry(ex))
            }
            _ => Ok(commit_retry),
        }
    }

    pub async fn query(&self, query: &str, args: &[serde_json::Value]) -> GelResult<Vec<serde_json::Value>> {
        let ctx = self.context(query, args);
        Ok(self.run_query(ctx).await?.into_rows())
    }

    pub async fn query_single(
        &self,
        query: &str,
        args: &[serde_json::Value],
    ) -> GelResult<Option<serde_json::Value>> {
        let ctx = self.context(query, args).single();
        self.run_query(ctx).await?.into_single()
    }

    /// Run a query and return its result encoded as JSON text.
    pub async fn query_json(&self, query: &str, args: &[serde_json::Value]) -> GelResult<String> {
        let ctx = self.context(query, args).output(OutputFormat::Json);
        let response = self.run_query(ctx).await?;
        serde_json::to_string(&response.data)
            .map_err(|e| GelError::internal(format!("cannot encode result: {}", e)))
    }

    /// Run a single-result query and deserialize the value.
    pub async fn query_single_as<T: DeserializeOwned>(
        &self,
        query: &str,
        args: &[serde_json::Value],
    ) -> GelResult<Option<T>> {
        match self.query_single(query, args).await? {
            Some(value) => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| GelError::internal(format!("cannot decode result: {}", e))),
            None => Ok(None),
        }
    }

    pub async fn execute(&self, query: &str, args: &[serde_json::Value]) -> GelResult<()> {
        let _exclusive = self.exclusive()?;
        let con = self.ensure_transaction().await?;
        let mut ctx = ExecuteContext::new(query, self.inner.pool.inner.cache.clone());
        ctx.args = args.to_vec();
        let warnings = con.execute(&ctx).await?;
        self.inner.pool.options.warnings.handle(warnings)
    }

    fn context(&self, query: &str, args: &[serde_json::Value]) -> QueryContext {
        QueryContext::new(query, self.inner.pool.inner.cache.clone()).with_args(args.to_vec())
    }

    async fn run_query(&self, ctx: QueryContext) -> GelResult<QueryResponse> {
        let _exclusive = self.exclusive()?;
        let con = self.ensure_transaction().await?;
        let mut response = con.raw_query(&ctx).await?;
        let warnings = std::mem::take(&mut response.warnings);
        self.inner.pool.options.warnings.handle(warnings)?;
        Ok(response)
    }

    fn exclusive(&self) -> GelResult<Exclusive<'_>> {
        if self.inner.locked.swap(true, Ordering::AcqRel) {
            return Err(GelError::interface(
                "concurrent queries within the same transaction are not allowed",
            ));
        }
        Ok(Exclusive(&self.inner.locked))
    }

    /// Start the transaction on first use and return its connection.
    async fn ensure_transaction(&self) -> GelResult<Arc<F::Connection>> {
        let already_started = {
            let mut flags = self.inner.flags.lock();
            if !flags.managed {
                return Err(GelError::interface(
                    "Only managed retriable transactions are supported. \
                     Use `Pool::transaction()` or call `enter()` on the iteration first",
                ));
            }
            std::mem::replace(&mut flags.started, true)
        };
        if already_started {
            self.check_state("execute query")?;
            return self.current_connection();
        }

        let query = self.make_start_query()?;
        let con = self
            .inner
            .pool
            .acquire_with(None, self.inner.index != 0)
            .await?;
        let shared = con.shared();
        *self.inner.connection.lock() = Some(con);

        match shared.privileged_execute(&query).await {
            Ok(()) => {
                self.set_state(TransactionState::Started);
                debug!(iteration = self.inner.index, "Transaction started");
                Ok(shared)
            }
            Err(e) => {
                self.set_state(TransactionState::Failed);
                Err(e)
            }
        }
    }

    /// Send COMMIT or ROLLBACK and record the resulting state.
    async fn finish(&self, commit: bool) -> GelResult<()> {
        let (query, next) = if commit {
            (self.make_commit_query()?, TransactionState::Committed)
        } else {
            (self.make_rollback_query()?, TransactionState::RolledBack)
        };
        let con = self.current_connection()?;

        match con.privileged_execute(query).await {
            Ok(()) => {
                self.set_state(next);
                debug!(iteration = self.inner.index, state = %next, "Transaction finished");
                Ok(())
            }
            Err(e) => {
                self.set_state(TransactionState::Failed);
                if commit {
                    if let Err(rollback) = con.privileged_execute("ROLLBACK;").await {
                        debug!(error = %rollback, "Rollback after failed commit failed");
                    }
                }
                Err(e)
            }
        }
    }

    async fn release_connection(&self) -> GelResult<()> {
        let con = self.inner.connection.lock().take();
        match con {
            Some(con) => self.inner.pool.release(con).await,
            None => Ok(()),
        }
    }

    fn current_connection(&self) -> GelResult<Arc<F::Connection>> {
        self.inner
            .connection
            .lock()
            .as_ref()
            .map(|con| con.shared())
            .ok_or_else(|| GelError::internal("transaction has no connection"))
    }

    /// Record `err` and schedule another attempt if the budget allows.
    fn schedule_retry(&self, err: &GelError) -> bool {
        let rule = self.inner.pool.options.retry.rule_for(err);
        let mut state = self.inner.retry.lock();
        state.last_error = Some(err.clone());
        if state.iteration >= rule.attempts {
            debug!(
                iteration = self.inner.index,
                attempts = rule.attempts,
                error = %err,
                "Retry budget exhausted"
            );
            return false;
        }
        let backoff = rule.backoff(state.iteration);
        state.done = false;
        state.next_backoff = Some(backoff);
        debug!(
            iteration = self.inner.index,
            backoff_ms = backoff.as_millis() as u64,
            error = %err,
            "Transaction will be retried"
        );
        true
    }

    fn set_state(&self, state: TransactionState) {
        self.inner.flags.lock().state = state;
    }

    fn check_state_base(&self, op: &str) -> GelResult<()> {
        let message = match self.state() {
            TransactionState::Committed => "the transaction is already committed",
            TransactionState::RolledBack => "the transaction is already rolled back",
            TransactionState::Failed => "the transaction is in error state",
            _ => return Ok(()),
        };
        Err(GelError::interface(format!("cannot {}; {}", op, message)))
    }

    fn check_state(&self, op: &str) -> GelResult<()> {
        match self.state() {
            TransactionState::Started => Ok(()),
            TransactionState::New => Err(GelError::interface(format!(
                "cannot {}; the transaction is not yet started",
                op
            ))),
            _ => self.check_state_base(op),
        }
    }

    fn make_start_query(&self) -> GelResult<String> {
        self.check_state_base("start")?;
        if self.state() == TransactionState::Started {
            return Err(GelError::interface(
                "cannot start; the transaction is already started",
            ));
        }
        Ok(self.inner.options.start_transaction_query())
    }

    fn make_commit_query(&self) -> GelResult<&'static str> {
        self.check_state("commit")?;
        Ok("COMMIT;")
    }

    fn make_rollback_query(&self) -> GelResult<&'static str> {
        self.check_state("rollback")?;
        Ok("ROLLBACK;")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Address, ConnectTarget, PoolConfig};
    use crate::options::RetryOptions;
    use crate::pool::AsyncPool;
    use crate::sim::{SimFactory, SimServer};

    fn pool(server: &SimServer) -> AsyncPool<SimFactory> {
        Pool::with_target(
            SimFactory::new(server.clone()),
            ConnectTarget::new(vec![Address::tcp("sim", 5656)]),
            PoolConfig::with_max_concurrency(1),
        )
        .unwrap()
        .with_retry_options(RetryOptions::with_backoff(3, Arc::new(|_| Duration::from_millis(1))))
    }

    #[tokio::test]
    async fn test_state_messages() {
        let server = SimServer::new();
        let mut retry = pool(&server).retry();
        let tx = retry.next().await.unwrap();

        let err = tx.make_commit_query().unwrap_err();
        assert!(err.to_string().contains("cannot commit; the transaction is not yet started"));

        tx.set_state(TransactionState::Committed);
        let err = tx.make_rollback_query().unwrap_err();
        assert!(err.to_string().contains("cannot rollback; the transaction is already committed"));

        tx.set_state(TransactionState::Started);
        let err = tx.make_start_query().unwrap_err();
        assert!(err.to_string().contains("cannot start; the transaction is already started"));

        tx.set_state(TransactionState::Failed);
        let err = tx.make_commit_query().unwrap_err();
        assert!(err.to_string().contains("in error state"));
    }

    #[tokio::test]
    async fn test_query_outside_scope_is_rejected() {
        let server = SimServer::new();
        let mut retry = pool(&server).retry();
        let tx = retry.next().await.unwrap();
        let err = tx.query("get a", &[]).await.unwrap_err();
        assert!(err.is_interface_error());
        assert!(err.to_string().contains("Only managed retriable transactions"));
        assert_eq!(server.connects(), 0);
    }

    #[tokio::test]
    async fn test_unstarted_exit_does_not_retry() {
        let server = SimServer::new();
        let mut retry = pool(&server).retry();
        let tx = retry.next().await.unwrap();
        tx.enter().unwrap();
        let conflict = GelError::serialization("conflict");
        assert!(!tx.exit(Some(&conflict)).await.unwrap());
        assert!(retry.next().await.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_query_is_rejected() {
        let server = SimServer::new();
        let mut retry = pool(&server).retry();
        let tx = retry.next().await.unwrap();
        tx.enter().unwrap();

        let guard = tx.exclusive().unwrap();
        let err = tx.query("get a", &[]).await.unwrap_err();
        assert!(err.to_string().contains("concurrent queries within the same transaction"));
        drop(guard);

        assert!(tx.query("get a", &[]).await.is_ok());
        assert!(!tx.exit(None).await.unwrap());
        assert_eq!(tx.state(), TransactionState::Committed);
    }

    #[tokio::test]
    async fn test_query_after_commit_fails() {
        let server = SimServer::new();
        let mut retry = pool(&server).retry();
        let tx = retry.next().await.unwrap();
        tx.enter().unwrap();
        tx.execute("set a 1", &[]).await.unwrap();
        tx.exit(None).await.unwrap();

        tx.enter().unwrap();
        let err = tx.query("get a", &[]).await.unwrap_err();
        assert!(err.to_string().contains("already committed"));
    }

    #[tokio::test]
    async fn test_start_failure_marks_failed() {
        let server = SimServer::new();
        let pool = pool(&server);
        let mut retry = pool.retry();
        let tx = retry.next().await.unwrap();
        tx.enter().unwrap();

        server.fail_next_privileged(GelError::server(crate::error::codes::QUERY_ERROR, "boom"));
        assert!(tx.query("get a", &[]).await.is_err());
        assert_eq!(tx.state(), TransactionState::Failed);

        let err = GelError::server(crate::error::codes::QUERY_ERROR, "boom");
        assert!(!tx.exit(Some(&err)).await.unwrap());
        assert_eq!(pool.free_size(), 1);
    }
}
