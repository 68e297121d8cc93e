//! Connection interface consumed by the pool.
//!
//! The wire protocol lives behind [`Connection`]. This module adds the
//! multi-address connect loop and the retry wrapper for non-transactional
//! queries on top of it.

use crate::cache::{Capabilities, OutputFormat, QueryCacheHandle, QueryKey};
use crate::config::{Address, ConnectTarget};
use crate::error::{ConnectionFailure, GelError, GelResult, Tag};
use crate::options::RetryOptions;
use crate::scheduler::Scheduler;
use rand::Rng;
use std::future::Future;
use std::time::{Duration, Instant};
use tracing::debug;

/// A query to run on a connection.
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub query: String,
    pub args: Vec<serde_json::Value>,
    pub output: OutputFormat,
    pub expect_one: bool,
    pub cache: QueryCacheHandle,
}

impl QueryContext {
    pub fn new(query: impl Into<String>, cache: QueryCacheHandle) -> Self {
        Self {
            query: query.into(),
            args: Vec::new(),
            output: OutputFormat::Native,
            expect_one: false,
            cache,
        }
    }

    pub fn with_args(mut self, args: Vec<serde_json::Value>) -> Self {
        self.args = args;
        self
    }

    pub fn output(mut self, output: OutputFormat) -> Self {
        self.output = output;
        self
    }

    pub fn single(mut self) -> Self {
        self.expect_one = true;
        self
    }

    pub fn key(&self) -> QueryKey {
        QueryKey::new(self.query.clone(), self.output, self.expect_one)
    }

    /// Capabilities recorded for this query, if it was parsed before.
    pub fn capabilities(&self) -> Option<Capabilities> {
        self.cache.queries.capabilities(&self.key())
    }
}

/// A statement to run for its side effects.
#[derive(Debug, Clone)]
pub struct ExecuteContext {
    pub query: String,
    pub args: Vec<serde_json::Value>,
    pub cache: QueryCacheHandle,
}

impl ExecuteContext {
    pub fn new(query: impl Into<String>, cache: QueryCacheHandle) -> Self {
        Self {
            query: query.into(),
            args: Vec::new(),
            cache,
        }
    }

    pub fn key(&self) -> QueryKey {
        QueryKey::new(self.query.clone(), OutputFormat::None, false)
    }

    pub fn capabilities(&self) -> Option<Capabilities> {
        self.cache.queries.capabilities(&self.key())
    }
}

/// Result of a query: decoded data plus any server warnings.
#[derive(Debug, Clone, Default)]
pub struct QueryResponse {
    pub data: serde_json::Value,
    pub warnings: Vec<GelError>,
}

impl QueryResponse {
    /// Result rows. A scalar counts as one row and null as none.
    pub fn into_rows(self) -> Vec<serde_json::Value> {
        match self.data {
            serde_json::Value::Array(rows) => rows,
            serde_json::Value::Null => Vec::new(),
            other => vec![other],
        }
    }

    /// At most one result.
    pub fn into_single(self) -> GelResult<Option<serde_json::Value>> {
        let mut rows = self.into_rows();
        match rows.len() {
            0 => Ok(None),
            1 => Ok(rows.pop()),
            n => Err(GelError::server(
                crate::error::codes::RESULT_CARDINALITY_MISMATCH,
                format!("query returned {} elements, expected at most one", n),
            )),
        }
    }
}

/// Settings reported by the server after connecting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerSettings {
    pub suggested_pool_concurrency: Option<usize>,
}

/// One physical session with the server.
///
/// All methods take `&self` so a pool can terminate a connection that is
/// currently lent out.
pub trait Connection: Send + Sync + 'static {
    fn target(&self) -> &ConnectTarget;

    /// Open a session to a single address.
    fn connect_addr(
        &self,
        addr: &Address,
        timeout: Duration,
    ) -> impl Future<Output = GelResult<()>> + Send;

    fn is_closed(&self) -> bool;

    /// Close gracefully.
    fn close(&self) -> impl Future<Output = GelResult<()>> + Send;

    /// Abort the session immediately.
    fn terminate(&self);

    fn connected_addr(&self) -> Option<Address>;

    fn settings(&self) -> ServerSettings;

    fn raw_query(&self, ctx: &QueryContext)
    -> impl Future<Output = GelResult<QueryResponse>> + Send;

    /// Run a statement. Returns server warnings.
    fn execute(&self, ctx: &ExecuteContext) -> impl Future<Output = GelResult<Vec<GelError>>> + Send;

    /// Run a statement with all capabilities allowed (transaction control).
    fn privileged_execute(&self, query: &str) -> impl Future<Output = GelResult<()>> + Send;
}

/// Builds unconnected connections for a resolved target.
pub trait ConnectionFactory: Send + Sync + 'static {
    type Connection: Connection;

    fn create(&self, target: ConnectTarget) -> Self::Connection;
}

/// Connect `con` to the first reachable address of its target.
///
/// Temporary failures and timeouts are retried until the target's
/// `wait_until_available` elapses, pausing 10 to 210 ms between passes over
/// the address list. With `single_attempt` only one pass is made.
pub async fn connect<S, C>(con: &C, single_attempt: bool) -> GelResult<()>
where
    S: Scheduler,
    C: Connection,
{
    let target = con.target();
    if target.addresses.is_empty() {
        return Err(GelError::configuration("no addresses to connect to"));
    }
    let config = target.config;
    let start = Instant::now();
    let max_time = start + config.wait_until_available;
    let mut iteration: u32 = 1;

    loop {
        let mut last_failure = None;
        for addr in &target.addresses {
            let attempt =
                S::timeout(config.connect_timeout, con.connect_addr(addr, config.connect_timeout)).await;
            let err = match attempt {
                Some(Ok(())) => {
                    debug!(address = %addr, attempts = iteration, "Connected");
                    return Ok(());
                }
                Some(Err(e)) => e,
                None => GelError::connection(
                    ConnectionFailure::Timeout,
                    format!(
                        "connecting to {} failed in {} sec",
                        addr,
                        config.connect_timeout.as_secs_f64()
                    ),
                ),
            };
            if !err.has_tag(Tag::ShouldReconnect) {
                return Err(render_no_connection(err, addr, iteration, start.elapsed()));
            }
            debug!(address = %addr, attempt = iteration, error = %err, "Connect attempt failed");
            last_failure = Some((addr, err));
        }

        if single_attempt || Instant::now() >= max_time {
            return Err(match last_failure {
                Some((_, err @ GelError::ClientConnection { kind: ConnectionFailure::Timeout, .. })) => err,
                Some((addr, err)) => render_no_connection(err, addr, iteration, start.elapsed()),
                None => GelError::internal("connect loop finished without an attempt"),
            });
        }

        iteration += 1;
        let pause = Duration::from_millis(10 + rand::thread_rng().gen_range(0..200));
        S::sleep(pause).await;
    }
}

fn render_no_connection(err: GelError, addr: &Address, attempts: u32, elapsed: Duration) -> GelError {
    let GelError::ClientConnection { kind, message } = err else {
        return err;
    };
    let hint = match addr {
        Address::Tcp { host, port } => format!(
            "Is the server running on host '{}' and accepting \n\tTCP/IP connections on port {}?",
            host, port
        ),
        Address::Unix(path) => format!(
            "Is the server running locally and accepting \n\tconnections on Unix domain socket '{}'?",
            path.display()
        ),
    };
    GelError::connection(
        kind,
        format!(
            "{}\n\tAfter {} attempts in {:.1} sec\n\t{}",
            message,
            attempts,
            elapsed.as_secs_f64(),
            hint
        ),
    )
}

/// Run `op`, retrying failures tagged SHOULD_RETRY when the query is
/// read-only or the failure is a transaction conflict.
///
/// A connection found closed after a failure is reconnected with a single
/// attempt before the next try.
pub async fn retry_operation<S, C, T, R, F, Fut>(
    con: &C,
    retry: Option<&RetryOptions>,
    read_only: R,
    mut op: F,
) -> GelResult<T>
where
    S: Scheduler,
    C: Connection,
    R: Fn() -> bool,
    F: FnMut() -> Fut,
    Fut: Future<Output = GelResult<T>>,
{
    let mut reconnect = false;
    let mut attempt: u32 = 0;
    loop {
        attempt += 1;
        let result = async {
            if reconnect {
                connect::<S, C>(con, true).await?;
            }
            op().await
        }
        .await;

        let err = match result {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };
        let Some(retry) = retry else {
            return Err(err);
        };
        if !err.is_edgedb_error() || !err.has_tag(Tag::ShouldRetry) {
            return Err(err);
        }
        if !read_only() && !err.is_transaction_conflict() {
            return Err(err);
        }
        let rule = retry.rule_for(&err);
        if attempt >= rule.attempts {
            return Err(err);
        }
        let backoff = rule.backoff(attempt);
        debug!(
            attempt,
            backoff_ms = backoff.as_millis() as u64,
            error = %err,
            "Retrying query"
        );
        S::sleep(backoff).await;
        reconnect = con.is_closed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_tcp_hint() {
        let err = GelError::connection(ConnectionFailure::Failed, "connection refused");
        let rendered = render_no_connection(
            err,
            &Address::tcp("db.local", 5656),
            3,
            Duration::from_millis(1500),
        );
        let text = rendered.to_string();
        assert!(text.contains("After 3 attempts in 1.5 sec"));
        assert!(text.contains("host 'db.local'"));
        assert!(text.contains("port 5656"));
    }

    #[test]
    fn test_render_leaves_server_errors_alone() {
        let err = GelError::serialization("conflict");
        let rendered = render_no_connection(
            err,
            &Address::tcp("db.local", 5656),
            1,
            Duration::ZERO,
        );
        assert!(!rendered.to_string().contains("After"));
    }

    #[test]
    fn test_query_context_key() {
        let cache = QueryCacheHandle::new();
        let ctx = QueryContext::new("get a", cache)
            .output(OutputFormat::Json)
            .single();
        let key = ctx.key();
        assert_eq!(key.query, "get a");
        assert_eq!(key.output, OutputFormat::Json);
        assert!(key.expect_one);
        assert_eq!(ctx.capabilities(), None);
    }
}
