//! # Error Taxonomy
//!
//! All failures surfaced by the crate are classified into [`SbmError`].
//! The variants map onto the layers of the stack:
//!
//! - `Framing` / `Codec`: the byte-level envelope and the message codec
//! - `Transport` / `ConnectFailed` / `Cancelled` / `NotConnected`: the
//!   framed stream underneath a dispatcher
//! - `Timeout`: the request/response race in the dispatcher
//! - `Unauthorized`: access-control guard violations inside handlers
//! - `Handler`: an application handler failure wrapped for reporting
//! - `ClientNotConnected`: server-side routing to an unknown client
//! - `Config`: invalid construction-time parameters
//!
//! Handler bodies themselves return [`anyhow::Result`] so arbitrary
//! application errors flow through the dispatch loop without ceremony; the
//! loop logs them (or synthesizes an error reply) and never tears down the
//! connection over a failing handler.

use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Convenience alias used by every fallible API in the crate.
pub type Result<T> = std::result::Result<T, SbmError>;

/// Unified error type for transport, dispatch, and auth failures.
#[derive(Debug, Error)]
pub enum SbmError {
    /// The length-prefixed envelope was malformed (e.g. a declared frame
    /// length beyond the configured ceiling). Fatal to the receive session.
    #[error("framing error: {0}")]
    Framing(String),

    /// Message encode/decode failed. Propagated to `send` callers on
    /// encode; terminates the receive session on decode.
    #[error("codec error: {0}")]
    Codec(String),

    /// An I/O fault on the underlying stream.
    #[error("transport fault: {0}")]
    Transport(#[from] std::io::Error),

    /// `connect` exhausted its retry budget.
    #[error("connect failed after {attempts} attempt(s): {last_error}")]
    ConnectFailed { attempts: u32, last_error: String },

    /// The operation was cancelled before it could complete.
    #[error("operation cancelled")]
    Cancelled,

    /// A request lost the race against its timeout.
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    /// An access-control guard rejected the caller.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// An application handler failed; carried when a handler error must
    /// cross an API boundary (the inbound loop itself only logs these).
    #[error("handler error: {0}")]
    Handler(anyhow::Error),

    /// `send_to_client` was given an id with no live connection.
    #[error("client {0} is not connected")]
    ClientNotConnected(Uuid),

    /// The transport has no established stream to operate on.
    #[error("transport is not connected")]
    NotConnected,

    /// Invalid construction-time parameters (bad URL, missing certificate,
    /// double `start`, ...).
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl SbmError {
    /// Whether a connect-time failure is worth retrying.
    ///
    /// Transient socket faults (refused, reset, timed out, ...) feed the
    /// backoff loop; anything else short-circuits the retry budget.
    pub(crate) fn is_transient(&self) -> bool {
        use std::io::ErrorKind;

        match self {
            SbmError::Transport(e) => !matches!(
                e.kind(),
                ErrorKind::InvalidData
                    | ErrorKind::InvalidInput
                    | ErrorKind::PermissionDenied
                    | ErrorKind::Unsupported
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn transient_classification() {
        let refused = SbmError::Transport(io::Error::from(io::ErrorKind::ConnectionRefused));
        assert!(refused.is_transient());

        // TLS verification failures surface as InvalidData and must not retry.
        let bad_cert = SbmError::Transport(io::Error::new(
            io::ErrorKind::InvalidData,
            "invalid peer certificate",
        ));
        assert!(!bad_cert.is_transient());

        assert!(!SbmError::Config("bad url".into()).is_transient());
        assert!(!SbmError::Framing("oversized".into()).is_transient());
    }

    #[test]
    fn display_includes_context() {
        let err = SbmError::ConnectFailed {
            attempts: 3,
            last_error: "connection refused".into(),
        };
        assert!(err.to_string().contains("3 attempt"));
        assert!(err.to_string().contains("connection refused"));
    }
}
