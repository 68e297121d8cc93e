//! Error types for the pool and transaction runtime.
//!
//! Errors mirror the numeric codes of the server's error hierarchy and expose
//! its capability tags. Every retry and reconnect decision in this crate is
//! made against [`GelError::has_tag`], never against concrete variants.

use std::io;
use std::sync::Arc;
use thiserror::Error;

/// Numeric error codes used by the runtime.
pub mod codes {
    pub const TRANSACTION_ERROR: u32 = 0x05_03_00_00;
    pub const TRANSACTION_CONFLICT: u32 = 0x05_03_01_00;
    pub const TRANSACTION_SERIALIZATION: u32 = 0x05_03_01_01;
    pub const TRANSACTION_DEADLOCK: u32 = 0x05_03_01_02;
    pub const BACKEND_UNAVAILABLE: u32 = 0x08_00_00_01;
    pub const QUERY_ERROR: u32 = 0x04_00_00_00;
    pub const RESULT_CARDINALITY_MISMATCH: u32 = 0x05_01_00_01;
    pub const INTEGRITY_ERROR: u32 = 0x05_02_00_00;
    pub const WARNING_MESSAGE: u32 = 0xF0_01_00_00;

    pub const CLIENT_ERROR: u32 = 0xFF_00_00_00;
    pub const CLIENT_CONNECTION_FAILED: u32 = 0xFF_01_01_00;
    pub const CLIENT_CONNECTION_FAILED_TEMPORARILY: u32 = 0xFF_01_01_01;
    pub const CLIENT_CONNECTION_TIMEOUT: u32 = 0xFF_01_02_00;
    pub const CLIENT_CONNECTION_CLOSED: u32 = 0xFF_01_03_00;
    pub const INTERFACE_ERROR: u32 = 0xFF_02_00_00;
    pub const INTERNAL_CLIENT_ERROR: u32 = 0xFF_04_00_00;
}

/// Capability marker attached to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    /// The failed operation may be retried as a whole.
    ShouldRetry,
    /// The connection must be re-established before retrying.
    ShouldReconnect,
}

impl Tag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tag::ShouldRetry => "SHOULD_RETRY",
            Tag::ShouldReconnect => "SHOULD_RECONNECT",
        }
    }
}

const RETRY: &[Tag] = &[Tag::ShouldRetry];
const RECONNECT_AND_RETRY: &[Tag] = &[Tag::ShouldReconnect, Tag::ShouldRetry];

/// Kind of client-side connection failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionFailure {
    /// Refused, reset, aborted, socket not found, name resolution failure.
    FailedTemporarily,
    /// Anything else; not retried by the connect loop.
    Failed,
    /// A single connect attempt exceeded the connect timeout.
    Timeout,
    /// The connection was closed while in use.
    Closed,
}

impl ConnectionFailure {
    fn code(&self) -> u32 {
        match self {
            Self::FailedTemporarily => codes::CLIENT_CONNECTION_FAILED_TEMPORARILY,
            Self::Failed => codes::CLIENT_CONNECTION_FAILED,
            Self::Timeout => codes::CLIENT_CONNECTION_TIMEOUT,
            Self::Closed => codes::CLIENT_CONNECTION_CLOSED,
        }
    }
}

#[derive(Error, Debug, Clone)]
pub enum GelError {
    /// An error reported by the server, identified by its code.
    #[error("{message} (code: {code:#010x})")]
    Server { code: u32, message: String },

    #[error("Connection failed: {message}")]
    ClientConnection {
        kind: ConnectionFailure,
        message: String,
    },

    /// Misuse of the client API. Never retried.
    #[error("Interface error: {message}")]
    Interface { message: String },

    #[error("Internal client error: {message}")]
    InternalClient { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Waiting for a free pool slot took too long.
    #[error("Timeout: {operation} exceeded {elapsed_ms}ms")]
    Timeout { operation: String, elapsed_ms: u64 },

    /// Application error raised from inside a transaction body.
    #[error("{0}")]
    Other(Arc<dyn std::error::Error + Send + Sync>),
}

impl GelError {
    /// Create a server error with the given code.
    pub fn server(code: u32, message: impl Into<String>) -> Self {
        Self::Server {
            code,
            message: message.into(),
        }
    }

    /// Create a serialization failure, the usual transaction conflict.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::server(codes::TRANSACTION_SERIALIZATION, message)
    }

    /// Create a client connection error of the given kind.
    pub fn connection(kind: ConnectionFailure, message: impl Into<String>) -> Self {
        Self::ClientConnection {
            kind,
            message: message.into(),
        }
    }

    /// Create an interface (API misuse) error.
    pub fn interface(message: impl Into<String>) -> Self {
        Self::Interface {
            message: message.into(),
        }
    }

    /// Create an internal client error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::InternalClient {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(operation: impl Into<String>, elapsed_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_ms,
        }
    }

    /// Wrap an application error.
    pub fn other(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Other(Arc::new(err))
    }

    /// Classify an OS-level connect error as temporary or permanent.
    pub fn from_io(err: &io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotFound => ConnectionFailure::FailedTemporarily,
            io::ErrorKind::TimedOut => ConnectionFailure::Timeout,
            _ => ConnectionFailure::Failed,
        };
        Self::connection(kind, err.to_string())
    }

    /// Numeric code, if the error belongs to the server's error hierarchy.
    pub fn code(&self) -> Option<u32> {
        match self {
            Self::Server { code, .. } => Some(*code),
            Self::ClientConnection { kind, .. } => Some(kind.code()),
            Self::Interface { .. } => Some(codes::INTERFACE_ERROR),
            Self::InternalClient { .. } => Some(codes::INTERNAL_CLIENT_ERROR),
            Self::Configuration { .. } => Some(codes::CLIENT_ERROR),
            Self::Timeout { .. } | Self::Other(_) => None,
        }
    }

    /// Capability tags carried by this error.
    pub fn tags(&self) -> &'static [Tag] {
        match self {
            Self::Server { code, .. } => match *code {
                codes::TRANSACTION_CONFLICT
                | codes::TRANSACTION_SERIALIZATION
                | codes::TRANSACTION_DEADLOCK
                | codes::BACKEND_UNAVAILABLE => RETRY,
                _ => &[],
            },
            Self::ClientConnection { kind, .. } => match kind {
                ConnectionFailure::Failed => &[],
                _ => RECONNECT_AND_RETRY,
            },
            _ => &[],
        }
    }

    pub fn has_tag(&self, tag: Tag) -> bool {
        self.tags().contains(&tag)
    }

    /// True for errors that belong to the server's error hierarchy.
    pub fn is_edgedb_error(&self) -> bool {
        self.code().is_some()
    }

    pub fn is_transaction_error(&self) -> bool {
        self.code()
            .is_some_and(|c| c & 0xFF_FF_00_00 == codes::TRANSACTION_ERROR)
    }

    pub fn is_transaction_conflict(&self) -> bool {
        self.code()
            .is_some_and(|c| c & 0xFF_FF_FF_00 == codes::TRANSACTION_CONFLICT)
    }

    /// True for errors raised by the client rather than the server.
    pub fn is_client_error(&self) -> bool {
        self.code()
            .is_some_and(|c| c & 0xFF_00_00_00 == codes::CLIENT_ERROR)
    }

    pub fn is_interface_error(&self) -> bool {
        matches!(self, Self::Interface { .. })
    }

    /// Get a suggestion for this error, if one applies.
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::ClientConnection { kind, .. } => Some(match kind {
                ConnectionFailure::Timeout => "Increase connect_timeout or check server load",
                _ => "Check that the server is running and reachable",
            }),
            Self::Timeout { .. } => {
                Some("Increase max_concurrency or release connections sooner")
            }
            Self::Configuration { .. } => {
                Some("Pass only one of dsn, credentials_file or host/port")
            }
            _ if self.is_transaction_conflict() => {
                Some("Run the work inside Pool::transaction() so conflicts are retried")
            }
            _ => None,
        }
    }
}

/// Result type alias for pool and transaction operations.
pub type GelResult<T> = Result<T, GelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GelError::interface("cannot enter context: already in a `transaction` block");
        assert!(err.to_string().contains("already in a `transaction` block"));

        let err = GelError::serialization("could not serialize access");
        assert!(err.to_string().contains("0x05030101"));
    }

    #[test]
    fn test_conflict_family_is_retryable() {
        for code in [
            codes::TRANSACTION_CONFLICT,
            codes::TRANSACTION_SERIALIZATION,
            codes::TRANSACTION_DEADLOCK,
        ] {
            let err = GelError::server(code, "conflict");
            assert!(err.has_tag(Tag::ShouldRetry));
            assert!(!err.has_tag(Tag::ShouldReconnect));
            assert!(err.is_transaction_conflict());
            assert!(err.is_transaction_error());
        }
    }

    #[test]
    fn test_backend_unavailable_is_retryable_but_not_a_conflict() {
        let err = GelError::server(codes::BACKEND_UNAVAILABLE, "backend down");
        assert!(err.has_tag(Tag::ShouldRetry));
        assert!(!err.is_transaction_conflict());
        assert!(!err.is_client_error());
    }

    #[test]
    fn test_interface_error_is_never_retried() {
        let err = GelError::interface("pool is closing");
        assert!(err.tags().is_empty());
        assert!(err.is_client_error());
        assert_eq!(err.code(), Some(codes::INTERFACE_ERROR));
    }

    #[test]
    fn test_connection_error_tags() {
        let temp = GelError::connection(ConnectionFailure::FailedTemporarily, "refused");
        assert!(temp.has_tag(Tag::ShouldReconnect));
        assert!(temp.has_tag(Tag::ShouldRetry));

        let perm = GelError::connection(ConnectionFailure::Failed, "bad certificate");
        assert!(perm.tags().is_empty());
        assert!(perm.is_client_error());
    }

    #[test]
    fn test_from_io_classification() {
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert!(matches!(
            GelError::from_io(&refused),
            GelError::ClientConnection {
                kind: ConnectionFailure::FailedTemporarily,
                ..
            }
        ));

        let denied = io::Error::from(io::ErrorKind::PermissionDenied);
        assert!(matches!(
            GelError::from_io(&denied),
            GelError::ClientConnection {
                kind: ConnectionFailure::Failed,
                ..
            }
        ));
    }

    #[test]
    fn test_timeout_and_other_have_no_code() {
        assert_eq!(GelError::timeout("pool acquire", 10).code(), None);
        let other = GelError::other(io::Error::other("boom"));
        assert!(!other.is_edgedb_error());
        assert!(other.tags().is_empty());
    }

    #[test]
    fn test_error_suggestion() {
        assert!(GelError::timeout("pool acquire", 10).suggestion().is_some());
        assert!(GelError::serialization("x").suggestion().is_some());
        assert!(GelError::interface("x").suggestion().is_none());
    }
}
