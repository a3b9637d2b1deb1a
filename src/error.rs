//! Error types for the resql client.

use thiserror::Error;

use crate::protocol::wire::ResponseCode;

/// Main error type for all client operations.
#[derive(Debug, Error)]
pub enum Error {
    /// API misuse detected locally (e.g. `execute` without a queued
    /// statement, `bind` before `put`). Never touches the network.
    #[error("misuse: {0}")]
    Misuse(String),

    /// The server executed the batch and reported a statement error.
    /// The message is surfaced verbatim.
    #[error("sql error: {0}")]
    Sql(String),

    /// The server belongs to a different cluster than the one configured.
    /// Fatal: never retried.
    #[error("cluster name mismatch")]
    ClusterNameMismatch,

    /// The server's session state diverged from this client's history.
    /// The client cannot tell whether unacknowledged writes committed, so
    /// it refuses to continue on this identity. Fatal: never retried.
    #[error("client session does not exist on the server")]
    SessionLost,

    /// The overall call deadline elapsed. Carries the last response code
    /// observed during connect attempts, for diagnostics.
    #[error("operation timed out (last response code: {})", last_rc.map(|rc| rc.to_string()).unwrap_or_else(|| "none".to_string()))]
    Timeout { last_rc: Option<ResponseCode> },

    /// I/O error on the socket. Retryable: absorbed by the reconnect loop
    /// unless the deadline expires.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer closed the connection. Retryable.
    #[error("connection closed")]
    ConnectionClosed,

    /// Truncated or malformed frame. Retryable: the connection is dropped
    /// and the request retried against the next endpoint.
    #[error("corrupt frame: {0}")]
    Corrupt(String),

    /// The server rejected the handshake with a non-fatal response code
    /// (e.g. not leader). Retryable against the next endpoint.
    #[error("handshake rejected: {0}")]
    Handshake(ResponseCode),

    /// An endpoint URL could not be parsed.
    #[error("invalid url: {0}")]
    InvalidUrl(String),
}

impl Error {
    /// Whether this error must abort the connect/request loop immediately
    /// instead of rotating to the next endpoint.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::ClusterNameMismatch
                | Error::SessionLost
                | Error::Misuse(_)
                | Error::Sql(_)
                | Error::InvalidUrl(_)
        )
    }
}

/// Result type alias using the client error.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(Error::ClusterNameMismatch.is_fatal());
        assert!(Error::SessionLost.is_fatal());
        assert!(Error::Misuse("x".into()).is_fatal());
        assert!(!Error::ConnectionClosed.is_fatal());
        assert!(!Error::Corrupt("short".into()).is_fatal());
        assert!(!Error::Handshake(ResponseCode::NotLeader).is_fatal());
    }

    #[test]
    fn test_timeout_display_carries_last_rc() {
        let err = Error::Timeout {
            last_rc: Some(ResponseCode::NotLeader),
        };
        assert!(err.to_string().contains("not leader"));

        let err = Error::Timeout { last_rc: None };
        assert!(err.to_string().contains("none"));
    }
}
