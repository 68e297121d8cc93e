//! Retry, transaction and warning options.
//!
//! Options are immutable values; the `with_*` methods return modified copies
//! so a pool handle can be cheaply re-configured per call site.

use crate::error::{GelError, GelResult};
use rand::Rng;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Default number of attempts for a retrying transaction.
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;

/// Backoff function: maps an iteration index to a sleep duration.
pub type BackoffFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Exponential backoff with up to 100ms of jitter: `2^n * 100ms + U(0, 100ms)`.
pub fn default_backoff(attempt: u32) -> Duration {
    let base_ms = 1u64
        .checked_shl(attempt)
        .unwrap_or(u64::MAX)
        .saturating_mul(100);
    let jitter_ms = rand::thread_rng().gen_range(0..100);
    Duration::from_millis(base_ms.saturating_add(jitter_ms))
}

/// Condition with its own retry rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RetryCondition {
    TransactionConflict,
    NetworkError,
}

/// Number of attempts and the backoff between them.
#[derive(Clone)]
pub struct RetryRule {
    pub attempts: u32,
    backoff: BackoffFn,
}

impl RetryRule {
    pub fn new(attempts: u32, backoff: BackoffFn) -> Self {
        Self { attempts, backoff }
    }

    /// Delay before the iteration following `iteration`.
    pub fn backoff(&self, iteration: u32) -> Duration {
        (self.backoff)(iteration)
    }
}

impl fmt::Debug for RetryRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryRule")
            .field("attempts", &self.attempts)
            .finish_non_exhaustive()
    }
}

/// Rules for retrying transactions and read-only queries.
#[derive(Clone, Debug)]
pub struct RetryOptions {
    default: RetryRule,
    overrides: HashMap<RetryCondition, RetryRule>,
}

impl RetryOptions {
    /// Retry up to `attempts` times with the default backoff.
    pub fn new(attempts: u32) -> Self {
        Self::with_backoff(attempts, Arc::new(default_backoff))
    }

    pub fn with_backoff(attempts: u32, backoff: BackoffFn) -> Self {
        Self {
            default: RetryRule::new(attempts, backoff),
            overrides: HashMap::new(),
        }
    }

    /// Override the rule for one condition. Unset fields inherit the default rule.
    pub fn with_rule(
        &self,
        condition: RetryCondition,
        attempts: Option<u32>,
        backoff: Option<BackoffFn>,
    ) -> Self {
        let rule = RetryRule::new(
            attempts.unwrap_or(self.default.attempts),
            backoff.unwrap_or_else(|| self.default.backoff.clone()),
        );
        let mut overrides = self.overrides.clone();
        overrides.insert(condition, rule);
        Self {
            default: self.default.clone(),
            overrides,
        }
    }

    pub fn default_rule(&self) -> &RetryRule {
        &self.default
    }

    /// Pick the rule that governs retrying `err`.
    pub fn rule_for(&self, err: &GelError) -> &RetryRule {
        let condition = if err.is_transaction_conflict() {
            Some(RetryCondition::TransactionConflict)
        } else if err.is_client_error() {
            Some(RetryCondition::NetworkError)
        } else {
            None
        };
        condition
            .and_then(|c| self.overrides.get(&c))
            .unwrap_or(&self.default)
    }
}

impl Default for RetryOptions {
    fn default() -> Self {
        Self::new(DEFAULT_RETRY_ATTEMPTS)
    }
}

/// Transaction isolation level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    #[default]
    Serializable,
    RepeatableRead,
}

impl IsolationLevel {
    pub fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::Serializable => "SERIALIZABLE",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
        }
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Options used to render the START TRANSACTION statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransactionOptions {
    pub isolation: IsolationLevel,
    pub readonly: bool,
    pub deferrable: bool,
}

impl TransactionOptions {
    pub fn new(isolation: IsolationLevel, readonly: bool, deferrable: bool) -> Self {
        Self {
            isolation,
            readonly,
            deferrable,
        }
    }

    pub fn isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn readonly(mut self, readonly: bool) -> Self {
        self.readonly = readonly;
        self
    }

    pub fn deferrable(mut self, deferrable: bool) -> Self {
        self.deferrable = deferrable;
        self
    }

    pub fn start_transaction_query(&self) -> String {
        let mode = if self.readonly {
            "READ ONLY"
        } else {
            "READ WRITE"
        };
        let defer = if self.deferrable {
            "DEFERRABLE"
        } else {
            "NOT DEFERRABLE"
        };
        format!(
            "START TRANSACTION ISOLATION {}, {}, {};",
            self.isolation, mode, defer
        )
    }
}

/// What to do with warnings attached to a query response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WarningHandling {
    #[default]
    Log,
    /// Turn the first warning into an error.
    Raise,
    Ignore,
}

impl WarningHandling {
    pub fn handle(&self, warnings: Vec<GelError>) -> GelResult<()> {
        match self {
            WarningHandling::Log => {
                for w in &warnings {
                    warn!(warning = %w, "Server warning");
                }
                Ok(())
            }
            WarningHandling::Raise => match warnings.into_iter().next() {
                Some(first) => Err(first),
                None => Ok(()),
            },
            WarningHandling::Ignore => Ok(()),
        }
    }
}

/// Options carried by a pool handle.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    pub retry: RetryOptions,
    pub transaction: TransactionOptions,
    pub warnings: WarningHandling,
}
