//! Protocol Callbacks
//!
//! The engine knows nothing about the application protocol. Everything it
//! does with decoded frames goes through the traits in this module, each
//! invoked synchronously with a [`Session`] for the connection at hand.
//!
//! ```text
//!                      ┌───────────────┐  not authenticated
//!   decoded frame ────>│ auth state?   │─────────────────────> Authenticator
//!                      └───────┬───────┘
//!                              │ authenticated
//!            ┌─────────────────┼──────────────────┐
//!            ▼                 ▼                  ▼
//!   LINE / RAW_BYTES        OBJECT             BINARY
//!   CommandHandler       ObjectHandler      BinaryHandler
//! ```
//!
//! One handler instance serves every connection, so implementations must be
//! `Send + Sync` and keep per-client state in [`ClientData`].
//!
//! Handlers must not block indefinitely. Returning [`HandlerError::Close`]
//! closes the connection gracefully.

use crate::codec::{DataMode, DataModes, Frame};
use crate::config::ConfigError;
use crate::connection::{Session, SessionError};
use crate::error::CloseReason;
use bytes::Bytes;
use std::any::Any;
use std::sync::Arc;
use thiserror::Error;

/// Result type for handler callbacks.
pub type HandlerResult<T = ()> = Result<T, HandlerError>;

/// Errors a handler can return.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Close the connection gracefully
    #[error("close requested")]
    Close,

    /// The client violated the application protocol
    #[error("protocol error: {0}")]
    Protocol(String),

    /// A session operation failed
    #[error(transparent)]
    Session(#[from] SessionError),

    /// Transport failure inside the handler
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else. Treated as an internal failure.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Outcome of one authentication step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    /// Credentials accepted
    Accepted,
    /// Credentials rejected; counts toward `max_auth_try`
    Rejected,
    /// More frames are needed before a decision
    Incomplete,
}

/// Connection lifecycle notifications.
pub trait ClientEventHandler: Send + Sync {
    /// A client was admitted. Runs before any frame is read (after the TLS
    /// handshake when connections start secure).
    fn on_connect(&self, _session: &mut Session<'_>) -> HandlerResult {
        Ok(())
    }

    /// The connection is closing for a local reason (timeout, handler
    /// request, shutdown, limits). Data sent from here is discarded.
    fn on_closing(&self, _session: &mut Session<'_>, _reason: CloseReason) {}

    /// The connection was lost (peer closed, I/O or TLS failure).
    fn on_lost(&self, _session: &mut Session<'_>, _reason: CloseReason) {}
}

/// Policy callbacks for limit conditions. The default methods send the
/// configured message for each condition.
pub trait ExtendedEventHandler: Send + Sync {
    fn on_timeout(&self, session: &mut Session<'_>) -> HandlerResult {
        let msg = &session.config().timeout_msg;
        session.send_notice(msg)?;
        Ok(())
    }

    fn on_max_auth_try(&self, session: &mut Session<'_>) -> HandlerResult {
        let msg = &session.config().max_auth_try_msg;
        session.send_notice(msg)?;
        Ok(())
    }

    fn on_max_connection(&self, session: &mut Session<'_>) -> HandlerResult {
        let msg = &session.config().max_connection_msg;
        session.send_notice(msg)?;
        Ok(())
    }
}

/// Sends the configured messages.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardResponses;

impl ExtendedEventHandler for StandardResponses {}

/// Handles LINE and RAW_BYTES input.
pub trait CommandHandler: Send + Sync {
    fn handle_command(&self, session: &mut Session<'_>, command: &str) -> HandlerResult;
}

/// Handles OBJECT input.
pub trait ObjectHandler: Send + Sync {
    fn handle_object(&self, session: &mut Session<'_>, object: serde_json::Value)
        -> HandlerResult;
}

/// Handles BINARY input.
pub trait BinaryHandler: Send + Sync {
    fn handle_binary(&self, session: &mut Session<'_>, data: Bytes) -> HandlerResult;
}

/// Called when a backlog of outbound data has been fully written.
pub trait WriteHandler: Send + Sync {
    fn on_write_ready(&self, session: &mut Session<'_>) -> HandlerResult;
}

/// Challenge/response login.
pub trait Authenticator: Send + Sync {
    /// Prompts the client. Called on connect and after every rejection.
    fn ask_authentication(&self, _session: &mut Session<'_>) -> HandlerResult {
        Ok(())
    }

    /// Judges one frame of credentials.
    fn handle_authentication(
        &self,
        session: &mut Session<'_>,
        frame: &Frame,
    ) -> HandlerResult<AuthStatus>;
}

/// Upcast helper for [`ClientData`].
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any + Send> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Per-connection application state, pooled alongside the connection.
pub trait ClientData: AsAny + Send {
    /// Clears the data before it serves another client.
    fn reset(&mut self) {}
}

pub(crate) type ClientDataFactory = Arc<dyn Fn() -> Box<dyn ClientData> + Send + Sync>;

/// The handlers registered on a server, resolved once at startup.
#[derive(Clone)]
pub struct Handlers {
    pub(crate) events: Option<Arc<dyn ClientEventHandler>>,
    pub(crate) extended: Arc<dyn ExtendedEventHandler>,
    pub(crate) command: Option<Arc<dyn CommandHandler>>,
    pub(crate) object: Option<Arc<dyn ObjectHandler>>,
    pub(crate) binary: Option<Arc<dyn BinaryHandler>>,
    pub(crate) write: Option<Arc<dyn WriteHandler>>,
    pub(crate) authenticator: Option<Arc<dyn Authenticator>>,
}

impl Default for Handlers {
    fn default() -> Self {
        Self {
            events: None,
            extended: Arc::new(StandardResponses),
            command: None,
            object: None,
            binary: None,
            write: None,
            authenticator: None,
        }
    }
}

impl Handlers {
    /// True when some handler consumes `mode` input.
    pub fn handles(&self, mode: DataMode) -> bool {
        match mode {
            DataMode::Line | DataMode::RawBytes => self.command.is_some(),
            DataMode::Object => self.object.is_some(),
            DataMode::Binary => self.binary.is_some(),
        }
    }

    /// Rejects a configuration whose initial input mode has no handler.
    pub fn validate(&self, modes: &DataModes) -> Result<(), ConfigError> {
        if self.handles(modes.input) {
            Ok(())
        } else {
            Err(ConfigError::Invalid {
                field: "data_modes.input",
                reason: format!("no handler registered for {} input", modes.input),
            })
        }
    }
}

impl std::fmt::Debug for Handlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handlers")
            .field("events", &self.events.is_some())
            .field("command", &self.command.is_some())
            .field("object", &self.object.is_some())
            .field("binary", &self.binary.is_some())
            .field("write", &self.write.is_some())
            .field("authenticator", &self.authenticator.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    impl CommandHandler for Noop {
        fn handle_command(&self, _session: &mut Session<'_>, _command: &str) -> HandlerResult {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Counter {
        hits: u32,
    }

    impl ClientData for Counter {
        fn reset(&mut self) {
            self.hits = 0;
        }
    }

    #[test]
    fn test_initial_mode_needs_handler() {
        let mut handlers = Handlers::default();
        let modes = DataModes::default();
        assert!(handlers.validate(&modes).is_err());

        handlers.command = Some(Arc::new(Noop));
        assert!(handlers.validate(&modes).is_ok());
        assert!(handlers.handles(DataMode::RawBytes));
        assert!(!handlers.handles(DataMode::Object));
    }

    #[test]
    fn test_client_data_downcast() {
        let mut data: Box<dyn ClientData> = Box::new(Counter { hits: 3 });
        (*data).as_any_mut().downcast_mut::<Counter>().unwrap().hits += 1;
        assert_eq!((*data).as_any().downcast_ref::<Counter>().unwrap().hits, 4);

        data.reset();
        assert_eq!((*data).as_any().downcast_ref::<Counter>().unwrap().hits, 0);
    }
}
