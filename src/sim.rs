//! In-memory backend.
//!
//! [`SimServer`] is a counter store with optimistic transactions that speaks a
//! three-command language:
//!
//! - `get <key>`: current value, or nothing if the key was never written
//! - `incr <key>`: add one (a missing key counts as zero) and return the result
//! - `set <key> <int>`: overwrite the value
//!
//! Transaction control arrives through `privileged_execute`. A commit fails
//! with a serialization error when any key touched by the transaction was
//! committed by someone else after the transaction first touched it.
//!
//! The server also injects failures (refused connects, failing queries,
//! dropped connections, warnings) so pool and retry behaviour can be
//! exercised without a real server.

use crate::cache::{Capabilities, QueryCacheHandle, QueryInfo, QueryKey, TypeDescriptor};
use crate::config::{Address, ConnectTarget};
use crate::connection::{
    Connection, ConnectionFactory, ExecuteContext, QueryContext, QueryResponse, ServerSettings,
};
use crate::error::{ConnectionFailure, GelError, GelResult, codes};
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, trace};
use uuid::Uuid;

/// Type id reported for every result.
pub const INT64_TYPE_ID: Uuid = Uuid::from_u128(0x105);

#[derive(Debug, Default)]
struct Store {
    /// key -> (value, version of the commit that wrote it)
    values: HashMap<String, (i64, u64)>,
    version: u64,
}

impl Store {
    fn value(&self, key: &str) -> Option<i64> {
        self.values.get(key).map(|(v, _)| *v)
    }

    fn version_of(&self, key: &str) -> u64 {
        self.values.get(key).map_or(0, |(_, ver)| *ver)
    }

    fn write(&mut self, writes: HashMap<String, i64>) {
        self.version += 1;
        for (key, value) in writes {
            self.values.insert(key, (value, self.version));
        }
    }
}

struct ServerState {
    store: Mutex<Store>,
    refuse_connects: AtomicUsize,
    unreachable: Mutex<HashSet<Address>>,
    fail_next_query: Mutex<Option<GelError>>,
    fail_next_privileged: Mutex<Option<GelError>>,
    warnings: Mutex<Vec<String>>,
    suggested_concurrency: Mutex<Option<usize>>,
    paused: watch::Sender<bool>,
    /// Bumped by `drop_connections`; older sessions are dead.
    epoch: AtomicU64,
    connects: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    queries: AtomicUsize,
}

/// Handle to an in-memory server. Clones share the same state.
#[derive(Clone)]
pub struct SimServer {
    state: Arc<ServerState>,
}

impl Default for SimServer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SimServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimServer")
            .field("connects", &self.connects())
            .field("commits", &self.commits())
            .field("rollbacks", &self.rollbacks())
            .finish_non_exhaustive()
    }
}

impl SimServer {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            state: Arc::new(ServerState {
                store: Mutex::new(Store::default()),
                refuse_connects: AtomicUsize::new(0),
                unreachable: Mutex::new(HashSet::new()),
                fail_next_query: Mutex::new(None),
                fail_next_privileged: Mutex::new(None),
                warnings: Mutex::new(Vec::new()),
                suggested_concurrency: Mutex::new(None),
                paused,
                epoch: AtomicU64::new(0),
                connects: AtomicUsize::new(0),
                commits: AtomicUsize::new(0),
                rollbacks: AtomicUsize::new(0),
                queries: AtomicUsize::new(0),
            }),
        }
    }

    /// Committed value of `key`.
    pub fn value(&self, key: &str) -> Option<i64> {
        self.state.store.lock().value(key)
    }

    /// Refuse the next `n` connect attempts with a temporary failure.
    pub fn refuse_connects(&self, n: usize) {
        self.state.refuse_connects.store(n, Ordering::Release);
    }

    /// Refuse every connect to `addr` with a temporary failure.
    pub fn set_unreachable(&self, addr: Address) {
        self.state.unreachable.lock().insert(addr);
    }

    /// Fail the next query or statement with `err`.
    pub fn fail_next_query(&self, err: GelError) {
        *self.state.fail_next_query.lock() = Some(err);
    }

    /// Fail the next transaction control statement with `err`.
    pub fn fail_next_privileged(&self, err: GelError) {
        *self.state.fail_next_privileged.lock() = Some(err);
    }

    /// Attach a warning to the next query response.
    pub fn emit_warning(&self, message: impl Into<String>) {
        self.state.warnings.lock().push(message.into());
    }

    /// Pool size reported to clients after connecting.
    pub fn suggest_concurrency(&self, n: usize) {
        *self.state.suggested_concurrency.lock() = Some(n);
    }

    /// Kill every open session, as a server restart would.
    pub fn drop_connections(&self) {
        let epoch = self.state.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        debug!(epoch, "Simulated server dropped all connections");
    }

    /// Hold every query until [`resume`](Self::resume) is called.
    pub fn pause(&self) {
        self.state.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.state.paused.send_replace(false);
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::Acquire)
    }

    pub fn commits(&self) -> usize {
        self.state.commits.load(Ordering::Acquire)
    }

    pub fn rollbacks(&self) -> usize {
        self.state.rollbacks.load(Ordering::Acquire)
    }

    /// Queries and statements received, including failed ones.
    pub fn queries(&self) -> usize {
        self.state.queries.load(Ordering::Acquire)
    }

    fn epoch(&self) -> u64 {
        self.state.epoch.load(Ordering::Acquire)
    }

    async fn wait_resumed(&self) {
        let mut rx = self.state.paused.subscribe();
        let _ = rx.wait_for(|paused| !*paused).await;
    }
}

/// Builds [`SimConnection`]s for one [`SimServer`].
#[derive(Debug, Clone)]
pub struct SimFactory {
    server: SimServer,
}

impl SimFactory {
    pub fn new(server: SimServer) -> Self {
        Self { server }
    }
}

impl ConnectionFactory for SimFactory {
    type Connection = SimConnection;

    fn create(&self, target: ConnectTarget) -> SimConnection {
        SimConnection::new(self.server.clone(), target)
    }
}

#[derive(Debug, Default)]
struct OpenTransaction {
    /// Version of each key when the transaction first touched it.
    seen: HashMap<String, u64>,
    writes: HashMap<String, i64>,
}

#[derive(Debug, Default)]
struct Session {
    addr: Option<Address>,
    epoch: u64,
    transaction: Option<OpenTransaction>,
}

enum Command<'a> {
    Get(&'a str),
    Incr(&'a str),
    Set(&'a str, i64),
}

impl<'a> Command<'a> {
    fn parse(query: &'a str) -> GelResult<Self> {
        let parts: Vec<&str> = query.split_whitespace().collect();
        match parts.as_slice() {
            ["get", key] => Ok(Command::Get(*key)),
            ["incr", key] => Ok(Command::Incr(*key)),
            ["set", key, value] => value
                .parse()
                .map(|v| Command::Set(*key, v))
                .map_err(|_| GelError::server(codes::QUERY_ERROR, format!("invalid integer: {}", value))),
            _ => Err(GelError::server(
                codes::QUERY_ERROR,
                format!("unexpected command: {}", query),
            )),
        }
    }

    fn capabilities(&self) -> Capabilities {
        match self {
            Command::Get(_) => Capabilities::NONE,
            Command::Incr(_) | Command::Set(..) => Capabilities::MODIFICATIONS,
        }
    }
}

/// One session with a [`SimServer`].
pub struct SimConnection {
    server: SimServer,
    target: ConnectTarget,
    session: Mutex<Session>,
    closed: AtomicBool,
}

impl std::fmt::Debug for SimConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let addr = self.session.lock().addr.clone();
        f.debug_struct("SimConnection")
            .field("addr", &addr)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl SimConnection {
    fn new(server: SimServer, target: ConnectTarget) -> Self {
        Self {
            server,
            target,
            session: Mutex::new(Session::default()),
            closed: AtomicBool::new(true),
        }
    }

    fn shut_down(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.session.lock().transaction = None;
        }
    }

    fn ensure_open(&self) -> GelResult<()> {
        if self.is_closed() {
            return Err(GelError::connection(
                ConnectionFailure::Closed,
                "connection is closed",
            ));
        }
        Ok(())
    }

    /// Common path of `raw_query` and `execute`.
    async fn run(&self, query: &str, key: QueryKey, cache: &QueryCacheHandle) -> GelResult<QueryResponse> {
        self.ensure_open()?;
        self.server.wait_resumed().await;
        self.ensure_open()?;
        self.server.state.queries.fetch_add(1, Ordering::AcqRel);

        let command = Command::parse(query)?;
        cache.queries.insert(
            key,
            QueryInfo {
                capabilities: command.capabilities(),
                output_type: Some(INT64_TYPE_ID),
            },
        );
        cache.codecs.get_or_insert(TypeDescriptor {
            id: INT64_TYPE_ID,
            name: "std::int64".to_string(),
        });

        let injected = self.server.state.fail_next_query.lock().take();
        if let Some(err) = injected {
            trace!(query, error = %err, "Injected query failure");
            return Err(err);
        }

        let data = self.apply(command);
        let warnings = std::mem::take(&mut *self.server.state.warnings.lock())
            .into_iter()
            .map(|w| GelError::server(codes::WARNING_MESSAGE, w))
            .collect();
        Ok(QueryResponse { data, warnings })
    }

    fn apply(&self, command: Command<'_>) -> Value {
        let mut session = self.session.lock();
        let mut store = self.server.state.store.lock();

        match session.transaction.as_mut() {
            Some(tx) => {
                let key = match &command {
                    Command::Get(key) | Command::Incr(key) | Command::Set(key, _) => *key,
                };
                tx.seen
                    .entry(key.to_string())
                    .or_insert_with(|| store.version_of(key));
                let current = tx.writes.get(key).copied().or_else(|| store.value(key));
                match command {
                    Command::Get(_) => current.map_or(Value::Null, Value::from),
                    Command::Incr(_) => {
                        let next = current.unwrap_or(0) + 1;
                        tx.writes.insert(key.to_string(), next);
                        Value::from(next)
                    }
                    Command::Set(_, value) => {
                        tx.writes.insert(key.to_string(), value);
                        Value::Null
                    }
                }
            }
            None => match command {
                Command::Get(key) => store.value(key).map_or(Value::Null, Value::from),
                Command::Incr(key) => {
                    let next = store.value(key).unwrap_or(0) + 1;
                    store.write(HashMap::from([(key.to_string(), next)]));
                    Value::from(next)
                }
                Command::Set(key, value) => {
                    store.write(HashMap::from([(key.to_string(), value)]));
                    Value::Null
                }
            },
        }
    }

    fn start(&self) -> GelResult<()> {
        let mut session = self.session.lock();
        if session.transaction.is_some() {
            return Err(GelError::server(
                codes::TRANSACTION_ERROR,
                "already in transaction",
            ));
        }
        session.transaction = Some(OpenTransaction::default());
        Ok(())
    }

    fn commit(&self) -> GelResult<()> {
        let Some(tx) = self.session.lock().transaction.take() else {
            return Err(GelError::server(
                codes::TRANSACTION_ERROR,
                "not in a transaction",
            ));
        };
        let mut store = self.server.state.store.lock();
        let conflict = tx
            .seen
            .iter()
            .any(|(key, version)| store.version_of(key) != *version);
        if conflict {
            return Err(GelError::serialization(
                "could not serialize access due to concurrent update",
            ));
        }
        if !tx.writes.is_empty() {
            store.write(tx.writes);
        }
        self.server.state.commits.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn rollback(&self) {
        if self.session.lock().transaction.take().is_some() {
            self.server.state.rollbacks.fetch_add(1, Ordering::AcqRel);
        }
    }
}

impl Connection for SimConnection {
    fn target(&self) -> &ConnectTarget {
        &self.target
    }

    async fn connect_addr(&self, addr: &Address, _timeout: Duration) -> GelResult<()> {
        let state = &self.server.state;
        let refused = state
            .refuse_connects
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if refused || state.unreachable.lock().contains(addr) {
            return Err(GelError::connection(
                ConnectionFailure::FailedTemporarily,
                format!("connection refused by {}", addr),
            ));
        }

        *self.session.lock() = Session {
            addr: Some(addr.clone()),
            epoch: self.server.epoch(),
            transaction: None,
        };
        self.closed.store(false, Ordering::Release);
        state.connects.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.session.lock().epoch != self.server.epoch()
    }

    async fn close(&self) -> GelResult<()> {
        self.shut_down();
        Ok(())
    }

    fn terminate(&self) {
        self.shut_down();
    }

    fn connected_addr(&self) -> Option<Address> {
        self.session.lock().addr.clone()
    }

    fn settings(&self) -> ServerSettings {
        ServerSettings {
            suggested_pool_concurrency: *self.server.state.suggested_concurrency.lock(),
        }
    }

    async fn raw_query(&self, ctx: &QueryContext) -> GelResult<QueryResponse> {
        self.run(&ctx.query, ctx.key(), &ctx.cache).await
    }

    async fn execute(&self, ctx: &ExecuteContext) -> GelResult<Vec<GelError>> {
        let response = self.run(&ctx.query, ctx.key(), &ctx.cache).await?;
        Ok(response.warnings)
    }

    async fn privileged_execute(&self, query: &str) -> GelResult<()> {
        self.ensure_open()?;
        let injected = self.server.state.fail_next_privileged.lock().take();
        if let Some(err) = injected {
            return Err(err);
        }
        if query.starts_with("START TRANSACTION") {
            self.start()
        } else if query.starts_with("COMMIT") {
            self.commit()
        } else if query.starts_with("ROLLBACK") {
            self.rollback();
            Ok(())
        } else {
            Err(GelError::server(
                codes::QUERY_ERROR,
                format!("unexpected statement: {}", query),
            ))
        }
    }
}
