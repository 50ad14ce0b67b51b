//! Error Types
//!
//! Every layer of the engine has its own error enum; this module holds the
//! top-level [`ServerError`] that the drivers and the public API speak, plus
//! [`CloseReason`], the tag every connection carries out of the close path.
//!
//! ## Taxonomy
//!
//! ```text
//! ServerError
//!   ├── ConnectionLost   peer went away (EOF or TLS close_notify)
//!   ├── Timeout          socket or protocol level
//!   ├── Protocol         a handler or codec asked for the connection to end
//!   ├── Tls              always fatal to the connection
//!   ├── PoolExhausted    borrow failed; the raw socket gets closed
//!   ├── Internal         unexpected state; aborts in strict mode
//!   ├── Io               transport failure
//!   └── Config           rejected configuration
//! ```

use crate::codec::CodecError;
use crate::config::ConfigError;
use crate::pool::PoolError;
use crate::tls::TlsError;
use std::fmt;
use std::io;

/// Result alias used across the engine.
pub type Result<T, E = ServerError> = std::result::Result<T, E>;

/// Errors surfaced by the engine.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// The peer closed the connection
    #[error("connection lost")]
    ConnectionLost,

    /// A socket read or protocol step timed out
    #[error("timed out: {0}")]
    Timeout(&'static str),

    /// Protocol violation or handler-requested teardown
    #[error("protocol error: {0}")]
    Protocol(String),

    /// TLS failure
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    /// A pool could not lend an object
    #[error("pool exhausted: {0}")]
    PoolExhausted(#[from] PoolError),

    /// Unexpected state inside the engine
    #[error("internal error: {0}")]
    Internal(String),

    /// Transport error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Configuration rejected at startup
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl From<CodecError> for ServerError {
    fn from(err: CodecError) -> Self {
        ServerError::Protocol(err.to_string())
    }
}

impl ServerError {
    /// Maps the error onto the reason recorded by the close path.
    pub fn close_reason(&self) -> CloseReason {
        match self {
            ServerError::ConnectionLost => CloseReason::PeerClosed,
            ServerError::Timeout(_) => CloseReason::Timeout,
            ServerError::Protocol(_) => CloseReason::Protocol,
            ServerError::Tls(_) => CloseReason::Tls,
            ServerError::PoolExhausted(_) | ServerError::Internal(_) | ServerError::Config(_) => {
                CloseReason::Internal
            }
            ServerError::Io(err) => match err.kind() {
                io::ErrorKind::UnexpectedEof => CloseReason::PeerClosed,
                io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => CloseReason::Timeout,
                _ => CloseReason::Io,
            },
        }
    }

    /// True for failures that indicate a bug rather than a misbehaving peer.
    pub fn is_internal(&self) -> bool {
        matches!(self, ServerError::Internal(_))
    }
}

/// Why a connection was closed.
///
/// The lifecycle callback uses [`CloseReason::is_clean`] to pick between
/// `on_closing` (local, orderly) and `on_lost` (peer or failure).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    /// A handler or the application asked for the close
    Requested,
    /// Idle timeout (socket timeout or reaper)
    Timeout,
    /// Too many failed authentication attempts
    MaxAuthTry,
    /// Admission control turned the client away
    MaxConnection,
    /// Server shutdown closed the connection
    Shutdown,
    /// The peer closed its side (EOF or close_notify)
    PeerClosed,
    /// Transport error
    Io,
    /// TLS failure
    Tls,
    /// Protocol violation
    Protocol,
    /// Unexpected engine or handler failure
    Internal,
}

impl CloseReason {
    /// Returns true when the close was initiated locally and orderly.
    pub fn is_clean(self) -> bool {
        matches!(
            self,
            CloseReason::Requested
                | CloseReason::Timeout
                | CloseReason::MaxAuthTry
                | CloseReason::MaxConnection
                | CloseReason::Shutdown
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CloseReason::Requested => "requested",
            CloseReason::Timeout => "timeout",
            CloseReason::MaxAuthTry => "max-auth-try",
            CloseReason::MaxConnection => "max-connection",
            CloseReason::Shutdown => "shutdown",
            CloseReason::PeerClosed => "peer-closed",
            CloseReason::Io => "io-error",
            CloseReason::Tls => "tls-error",
            CloseReason::Protocol => "protocol-error",
            CloseReason::Internal => "internal-error",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_eof_and_io_errors_are_tagged_differently() {
        let eof = ServerError::ConnectionLost.close_reason();
        let reset = ServerError::Io(io::Error::from(io::ErrorKind::ConnectionReset)).close_reason();

        assert_eq!(eof, CloseReason::PeerClosed);
        assert_eq!(reset, CloseReason::Io);
        assert!(!eof.is_clean());
        assert!(!reset.is_clean());
    }

    #[test]
    fn test_clean_reasons() {
        assert!(CloseReason::Requested.is_clean());
        assert!(CloseReason::Timeout.is_clean());
        assert!(CloseReason::MaxAuthTry.is_clean());
        assert!(!CloseReason::Tls.is_clean());
        assert!(!CloseReason::Internal.is_clean());
    }

    #[test]
    fn test_read_timeout_maps_to_timeout() {
        let err = ServerError::Io(io::Error::from(io::ErrorKind::WouldBlock));
        assert_eq!(err.close_reason(), CloseReason::Timeout);
        assert!(ServerError::Internal("bad".into()).is_internal());
    }
}
