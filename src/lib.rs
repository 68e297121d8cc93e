//! Gel client pool runtime.
//!
//! This library provides the connection pool and retrying transaction loop of
//! a Gel (EdgeDB) client, written once against a scheduling abstraction and
//! offered both as a tokio API ([`AsyncPool`]) and a blocking API
//! ([`blocking::Client`]).

pub mod blocking;
pub mod cache;
pub mod config;
pub mod connection;
pub mod error;
pub mod options;
pub mod pool;
pub mod resolve;
pub mod scheduler;
pub mod sim;
pub mod transaction;

pub use config::{Config, ConnectArgs, ConnectTarget, PoolConfig};
pub use error::{GelError, GelResult};
pub use options::{IsolationLevel, RetryOptions, TransactionOptions, WarningHandling};
pub use pool::{AsyncPool, Pool, PoolStats, PooledConnection};
pub use transaction::{Iteration, RetryController, Transaction, TransactionState};
