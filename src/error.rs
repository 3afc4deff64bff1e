//! Crate error types

use thiserror::Error;

/// Errors produced by the streaming client stack
#[derive(Error, Debug)]
pub enum Error {
    /// IO error during network or cache-file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS error during secure connection
    #[error("TLS error: {0}")]
    Tls(String),

    /// Connection or read timeout
    #[error("Connection timeout")]
    Timeout,

    /// Invalid or garbled response from server
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// NNTP protocol error with response code
    #[error("NNTP error {code}: {message}")]
    Protocol {
        /// NNTP response code (e.g., 400, 480, 502)
        code: u16,
        /// Error message from server
        message: String,
    },

    /// Authentication failed
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// No article with that message-id (430)
    #[error("No such article: {0}")]
    NoSuchArticle(String),

    /// Connection closed unexpectedly
    #[error("Connection closed")]
    ConnectionClosed,

    /// Lease attempted on a disposed connection pool
    #[error("Connection pool is disposed")]
    PoolDisposed,

    /// Operation cancelled by the caller
    #[error("Operation cancelled")]
    Cancelled,

    /// No usenet providers configured
    #[error("There are no usenet providers configured")]
    NoProviders,

    /// Declared layout is inconsistent with observed data; never retried
    #[error("Corrupt data: {0}")]
    Corrupt(String),

    /// Manifest already submitted (by content hash or by name/category)
    #[error("Duplicate NZB: {0}")]
    Duplicate(String),

    /// Ingestion health check failed
    #[error("NZB rejected: {0}")]
    Unhealthy(String),

    /// Manifest could not be parsed
    #[error("Invalid NZB: {0}")]
    InvalidNzb(String),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether a fresh connection is worth trying for this error.
    ///
    /// Not-found is a protocol answer, not a connection fault; cancellation,
    /// disposal and corruption must never be retried.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Error::NoSuchArticle(_)
                | Error::Cancelled
                | Error::PoolDisposed
                | Error::Corrupt(_)
                | Error::Duplicate(_)
                | Error::Unhealthy(_)
        )
    }
}

/// Result type alias using [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_not_retryable() {
        assert!(!Error::NoSuchArticle("<a@b>".to_string()).is_retryable());
        assert!(!Error::Cancelled.is_retryable());
        assert!(!Error::Corrupt("bad offsets".to_string()).is_retryable());
    }

    #[test]
    fn test_transient_errors_are_retryable() {
        assert!(Error::Timeout.is_retryable());
        assert!(Error::ConnectionClosed.is_retryable());
        assert!(
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "reset"
            ))
            .is_retryable()
        );
    }
}
