//! The crate's error currency.
//!
//! Every fallible operation in `zero-bolt` returns [`Result<T>`], where the
//! error is one of the domain tags from the driver's external contract
//! (see the module docs on [`Error`]). The retry coordinator
//! ([`crate::retry`]) classifies these tags to decide whether a failed
//! work unit is worth re-executing.

use thiserror::Error;

pub type Result<T> = core::result::Result<T, Error>;

/// The domain-tagged error type surfaced to applications.
///
/// Variant names intentionally mirror the tags named in the driver's
/// external contract rather than internal source types, so that a
/// classification function (see [`crate::retry::is_retryable`]) can match
/// on them without reaching into nested causes.
#[derive(Debug, Error)]
pub enum Error {
    /// A transport-level failure: closed channel, connect/handshake
    /// timeout, or an I/O error on an established connection. Always
    /// retryable at the session layer.
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The member chosen for a query can no longer serve the requested
    /// access mode (stepped-down writer, server gone from the cluster).
    #[error("Session expired: {0}")]
    SessionExpired(String),

    /// Fatal misuse of the API or a malformed/invalid statement. Never
    /// retried.
    #[error("Client error: {0}")]
    ClientException(String),

    /// A transient server-side condition (deadlock, momentary database
    /// unavailability). Retryable.
    #[error("Transient error [{code}]: {message}")]
    TransientException { code: String, message: String },

    /// Authentication failed. Fatal.
    #[error("Authentication failed: {0}")]
    AuthenticationException(String),

    /// A security/TLS failure distinct from authentication (untrusted
    /// cert, handshake downgrade). Fatal.
    #[error("Security error: {0}")]
    SecurityException(String),

    /// `Cursor::single()` was called on a stream that had zero or more
    /// than one record.
    #[error("No such record: {0}")]
    NoSuchRecord(String),

    /// A server-reported error that doesn't fall into one of the above
    /// buckets (DDL errors, constraint violations once committed, etc).
    #[error("Database error [{code}]: {message}")]
    DatabaseException { code: String, message: String },

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Bad configuration: {0}")]
    BadConfigError(String),

    #[error("A bug in zero-bolt: {0}")]
    LibraryBug(String),
}

impl Error {
    /// Build an [`Error`] from a server `FAILURE` message's `code`/`message`
    /// pair, classifying it into the right domain tag the way
    /// [`crate::retry::is_retryable`] expects.
    ///
    /// Code families:
    /// - `Neo.ClientError.Security.*` → [`Error::AuthenticationException`]
    /// - `Neo.ClientError.Cluster.NotALeader` → [`Error::SessionExpired`]
    /// - `Neo.ClientError.*` (anything else) → [`Error::ClientException`]
    /// - `Neo.TransientError.*` → [`Error::TransientException`]
    /// - anything else → [`Error::DatabaseException`]
    pub fn from_server_failure(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        let message = message.into();
        if code.starts_with("Neo.ClientError.Security.") {
            Error::AuthenticationException(message)
        } else if code == "Neo.ClientError.Cluster.NotALeader" {
            Error::SessionExpired(format!("Server no longer accepts writes: {message}"))
        } else if code.starts_with("Neo.ClientError.") {
            Error::ClientException(message)
        } else if code.starts_with("Neo.TransientError.") {
            Error::TransientException { code, message }
        } else {
            Error::DatabaseException { code, message }
        }
    }

    pub(crate) fn service_unavailable(msg: impl Into<String>) -> Self {
        Error::ServiceUnavailable(msg.into())
    }

    pub(crate) fn session_expired(msg: impl Into<String>) -> Self {
        Error::SessionExpired(msg.into())
    }

    pub(crate) fn client(msg: impl Into<String>) -> Self {
        Error::ClientException(msg.into())
    }
}

impl From<core::convert::Infallible> for Error {
    fn from(err: core::convert::Infallible) -> Self {
        match err {}
    }
}
