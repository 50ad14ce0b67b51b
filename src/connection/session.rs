//! The handle handlers use to talk to their client.
//!
//! A [`Session`] exists only for the duration of one callback. Everything
//! it sends is appended to the connection's outbound chain and written
//! after the callback returns, in order.

use super::state::{AuthState, ConnectionState};
use super::{Connection, ConnectionId};
use crate::codec::{CodecError, DataMode, Direction, Encoder};
use crate::config::ServerConfig;
use crate::error::CloseReason;
use crate::handler::ClientData;
use crate::server::ServerContext;
use crate::tls::TlsError;
use bytes::BytesMut;
use std::net::SocketAddr;
use thiserror::Error;
use tracing::debug;

/// Failures of session operations.
#[derive(Debug, Error)]
pub enum SessionError {
    /// Input cannot switch to a mode nobody handles
    #[error("no handler registered for {0} input")]
    NoHandler(DataMode),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Tls(#[from] TlsError),

    /// `make_secure` without a TLS configuration
    #[error("TLS is not configured")]
    TlsUnavailable,

    #[error("connection is already secure")]
    AlreadySecure,
}

/// Access to one connection from inside a handler.
pub struct Session<'a> {
    ctx: &'a ServerContext,
    conn: &'a Connection,
    state: &'a mut ConnectionState,
}

impl<'a> Session<'a> {
    pub(crate) fn new(
        ctx: &'a ServerContext,
        conn: &'a Connection,
        state: &'a mut ConnectionState,
    ) -> Self {
        Self { ctx, conn, state }
    }

    fn send_with(
        &mut self,
        encode: impl FnOnce(&Encoder, &mut BytesMut) -> Result<(), CodecError>,
    ) -> Result<(), SessionError> {
        self.state.start_output(&self.ctx.buffers)?;
        let mut buf = self.ctx.buffers.borrow();
        encode(&self.state.encoder, &mut *buf)?;
        self.state.queue(buf, &self.ctx.buffers)?;
        Ok(())
    }

    /// Sends a line; CRLF is appended. Requires LINE output.
    pub fn send_line(&mut self, line: &str) -> Result<(), SessionError> {
        self.send_with(|enc, dst| enc.encode_line(line, dst))
    }

    /// Sends a value. Requires OBJECT output.
    pub fn send_object(&mut self, value: &serde_json::Value) -> Result<(), SessionError> {
        self.send_with(|enc, dst| enc.encode_object(value, dst))
    }

    /// Sends a chunk as is. Requires RAW_BYTES or BINARY output.
    pub fn send_bytes(&mut self, data: &[u8]) -> Result<(), SessionError> {
        self.send_with(|enc, dst| enc.encode_bytes(data, dst))
    }

    /// Sends a server message in whatever form the output mode carries
    /// text.
    pub fn send_notice(&mut self, msg: &str) -> Result<(), SessionError> {
        self.send_with(|enc, dst| enc.encode_notice(msg, dst))
    }

    /// Switches the data mode of one direction.
    ///
    /// Input bytes not yet framed by the old mode are handed to the new
    /// decoder. Switching output to OBJECT queues the stream header right
    /// away.
    pub fn set_data_mode(
        &mut self,
        direction: Direction,
        mode: DataMode,
    ) -> Result<(), SessionError> {
        match direction {
            Direction::In => {
                if !self.ctx.handlers.handles(mode) {
                    return Err(SessionError::NoHandler(mode));
                }
                if self.state.decoder.mode() != mode {
                    self.state.set_input_mode(mode);
                }
            }
            Direction::Out => {
                if self.state.encoder.mode() != mode {
                    self.state.set_output_mode(mode);
                    self.state.start_output(&self.ctx.buffers)?;
                }
            }
        }
        debug!(id = %self.conn.id(), ?direction, mode = %mode, "Data mode switched");
        Ok(())
    }

    pub fn data_mode(&self, direction: Direction) -> DataMode {
        match direction {
            Direction::In => self.state.decoder.mode(),
            Direction::Out => self.state.encoder.mode(),
        }
    }

    /// Closes the connection once the current callback returns. Data sent
    /// before is still delivered.
    pub fn close(&mut self) {
        self.state.close_requested.get_or_insert(CloseReason::Requested);
    }

    /// Starts a TLS handshake once the current frame is handled. Replies
    /// sent before this call go out in plaintext.
    pub fn make_secure(&mut self) -> Result<(), SessionError> {
        if self.ctx.tls.is_none() {
            return Err(SessionError::TlsUnavailable);
        }
        if self.state.is_secure() || self.state.upgrade_requested {
            return Err(SessionError::AlreadySecure);
        }
        self.state.upgrade_requested = true;
        Ok(())
    }

    pub fn is_secure(&self) -> bool {
        self.state.is_secure()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.auth == AuthState::Authenticated
    }

    pub fn auth_state(&self) -> AuthState {
        self.state.auth
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.conn.peer_addr()
    }

    pub fn id(&self) -> ConnectionId {
        self.conn.id()
    }

    /// The client data of this connection, if it is a `T`.
    pub fn client_data<T: ClientData + 'static>(&self) -> Option<&T> {
        self.state
            .client_data
            .as_deref()
            .and_then(|data| data.as_any().downcast_ref::<T>())
    }

    pub fn client_data_mut<T: ClientData + 'static>(&mut self) -> Option<&mut T> {
        self.state
            .client_data
            .as_deref_mut()
            .and_then(|data| data.as_any_mut().downcast_mut::<T>())
    }

    pub fn bytes_read(&self) -> u64 {
        self.conn.bytes_read()
    }

    pub fn bytes_written(&self) -> u64 {
        self.conn.bytes_written()
    }

    pub fn config(&self) -> &'a ServerConfig {
        &self.ctx.config
    }
}
