//! Configuration types.
//!
//! Connection arguments and client/pool settings consumed by the pool, plus the
//! command line configuration of the `gel-pool` stress tool (CLI arguments and
//! environment variables).

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 5656;
pub const DEFAULT_USER: &str = "edgedb";
pub const DEFAULT_BRANCH: &str = "__default__";
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_WAIT_UNTIL_AVAILABLE_SECS: u64 = 30;

/// Pool size used until the server suggests one.
pub const DEFAULT_MAX_CONCURRENCY: usize = 1;

// Stress tool defaults
pub const DEFAULT_WORKERS: usize = 8;
pub const DEFAULT_TRANSACTIONS_PER_WORKER: usize = 50;
pub const DEFAULT_KEYS: usize = 1;

/// Where a server can be reached.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Address {
    Tcp { host: String, port: u16 },
    Unix(PathBuf),
}

impl Address {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Address::Tcp {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Tcp { host, port } => write!(f, "{}:{}", host, port),
            Address::Unix(path) => write!(f, "{}", path.display()),
        }
    }
}

/// Client-side timing configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClientConfig {
    /// Time limit for a single connect attempt.
    pub connect_timeout: Duration,
    /// How long the connect loop keeps retrying temporary failures.
    pub wait_until_available: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            wait_until_available: Duration::from_secs(DEFAULT_WAIT_UNTIL_AVAILABLE_SECS),
        }
    }
}

/// Session parameters resolved from the connect arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedParams {
    pub user: String,
    #[serde(skip_serializing)]
    pub password: Option<String>,
    pub branch: String,
}

impl Default for ResolvedParams {
    fn default() -> Self {
        Self {
            user: DEFAULT_USER.to_string(),
            password: None,
            branch: DEFAULT_BRANCH.to_string(),
        }
    }
}

/// Everything a connection needs to reach and authenticate with a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub addresses: Vec<Address>,
    pub params: ResolvedParams,
    pub config: ClientConfig,
}

impl ConnectTarget {
    pub fn new(addresses: Vec<Address>) -> Self {
        Self {
            addresses,
            params: ResolvedParams::default(),
            config: ClientConfig::default(),
        }
    }
}

/// User-supplied connection arguments, before resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectArgs {
    pub dsn: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub credentials_file: Option<PathBuf>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: Option<String>,
    pub branch: Option<String>,
    /// Seconds.
    pub wait_until_available: Option<u64>,
    /// Seconds.
    pub connect_timeout: Option<u64>,
}

impl ConnectArgs {
    pub fn dsn(dsn: impl Into<String>) -> Self {
        Self {
            dsn: Some(dsn.into()),
            ..Self::default()
        }
    }

    pub fn host_port(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: Some(host.into()),
            port: Some(port),
            ..Self::default()
        }
    }
}

/// Pool sizing options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Fixed pool size. When unset, the server's suggestion is used after
    /// the first connect.
    pub max_concurrency: Option<usize>,
}

impl PoolConfig {
    pub fn with_max_concurrency(max_concurrency: usize) -> Self {
        Self {
            max_concurrency: Some(max_concurrency),
        }
    }

    /// Get max_concurrency with default value.
    pub fn max_concurrency_or_default(&self) -> usize {
        self.max_concurrency.unwrap_or(DEFAULT_MAX_CONCURRENCY)
    }

    /// Validate pool options and return an error message if invalid.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrency == Some(0) {
            return Err("max_concurrency is expected to be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Scheduling model used by the stress tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum SchedulingModel {
    /// Tasks on a tokio runtime
    #[default]
    Tokio,
    /// One OS thread per worker
    Threads,
}

impl fmt::Display for SchedulingModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tokio => write!(f, "tokio"),
            Self::Threads => write!(f, "threads"),
        }
    }
}

/// Configuration for the `gel-pool` stress tool.
///
/// The tool runs concurrent counter-increment transactions against the
/// in-memory backend and reports how many iterations the retry loop needed.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "gel-pool",
    about = "Exercise the connection pool and retrying transactions against an in-memory backend",
    version,
    author
)]
pub struct Config {
    /// Number of concurrent workers
    #[arg(short, long, default_value_t = DEFAULT_WORKERS, env = "GEL_POOL_WORKERS")]
    pub workers: usize,

    /// Transactions run by each worker
    #[arg(
        short,
        long,
        default_value_t = DEFAULT_TRANSACTIONS_PER_WORKER,
        env = "GEL_POOL_TRANSACTIONS"
    )]
    pub transactions: usize,

    /// Pool size. When omitted the backend's suggestion is used.
    #[arg(short = 'c', long, env = "GEL_POOL_MAX_CONCURRENCY")]
    pub max_concurrency: Option<usize>,

    /// Pool size suggested by the backend on first connect
    #[arg(long, env = "GEL_POOL_SUGGESTED_CONCURRENCY")]
    pub suggested_concurrency: Option<usize>,

    /// Attempts per transaction before a conflict is reported
    #[arg(long, default_value_t = crate::options::DEFAULT_RETRY_ATTEMPTS, env = "GEL_POOL_ATTEMPTS")]
    pub attempts: u32,

    /// Number of distinct counters; fewer counters means more conflicts
    #[arg(long, default_value_t = DEFAULT_KEYS, env = "GEL_POOL_KEYS")]
    pub keys: usize,

    /// Refuse this many connection attempts before accepting
    #[arg(long, default_value_t = 0, env = "GEL_POOL_REFUSE_CONNECTS")]
    pub refuse_connects: u32,

    /// Scheduling model (tokio or threads)
    #[arg(short, long, value_enum, default_value = "tokio", env = "GEL_POOL_MODEL")]
    pub model: SchedulingModel,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "GEL_POOL_LOG_LEVEL")]
    pub log_level: String,

    /// Enable JSON logging format
    #[arg(long, env = "GEL_POOL_JSON_LOGS")]
    pub json_logs: bool,
}

impl Config {
    /// Create a default configuration (useful for testing).
    pub fn default_config() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            transactions: DEFAULT_TRANSACTIONS_PER_WORKER,
            max_concurrency: None,
            suggested_concurrency: None,
            attempts: crate::options::DEFAULT_RETRY_ATTEMPTS,
            keys: DEFAULT_KEYS,
            refuse_connects: 0,
            model: SchedulingModel::Tokio,
            log_level: "info".to_string(),
            json_logs: false,
        }
    }

    /// Validate the tool configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.workers == 0 {
            return Err("workers must be greater than 0".to_string());
        }
        if self.keys == 0 {
            return Err("keys must be greater than 0".to_string());
        }
        if self.attempts == 0 {
            return Err("attempts must be greater than 0".to_string());
        }
        PoolConfig {
            max_concurrency: self.max_concurrency,
        }
        .validate()
    }

    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_concurrency: self.max_concurrency,
        }
    }
}
