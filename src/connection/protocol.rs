//! Decode and dispatch, shared by both personalities.
//!
//! ```text
//!  raw_in ──> [TLS advance / unwrap] ──> decoder ──> frames
//!                                                      │
//!                       ┌──────────────────────────────┤
//!                       ▼                              ▼
//!                 Authenticator            Command / Object / Binary handler
//!                       │                              │
//!                       └──────────> Session sends ────┴──> outbound chain ──> flush
//! ```

use super::state::{AuthState, ConnectionState};
use super::transport::Transport;
use super::{Connection, Session, SessionError};
use crate::codec::Frame;
use crate::error::CloseReason;
use crate::handler::{AuthStatus, HandlerError, HandlerResult};
use crate::pool::{BufferPool, PooledBuffer};
use crate::server::ServerContext;
use crate::stats::ServerStats;
use crate::tls::{Advance, RecordSink, TlsAdapter, Unwrapped};
use bytes::{Buf, BytesMut};
use std::collections::VecDeque;
use std::io;
use tracing::{debug, error, info, trace, warn};

/// What the driver should do after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
    Continue,
    Close(CloseReason),
}

/// Writes the outbound chain front to back until it is empty or the
/// transport would block. Returns true when everything was written.
pub(crate) fn flush_outbound(
    outbound: &mut VecDeque<PooledBuffer>,
    transport: &dyn Transport,
    conn: &Connection,
    stats: &ServerStats,
) -> io::Result<bool> {
    while let Some(front) = outbound.front_mut() {
        if front.is_empty() {
            outbound.pop_front();
            continue;
        }
        match transport.write(&front[..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                front.advance(n);
                conn.record_write(n);
                stats.bytes_written(n);
                trace!(id = %conn.id(), bytes = n, "Wrote data");
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

pub(crate) fn flush(
    ctx: &ServerContext,
    conn: &Connection,
    state: &mut ConnectionState,
    transport: &dyn Transport,
) -> io::Result<bool> {
    flush_outbound(&mut state.outbound, transport, conn, &ctx.stats)
}

/// Record sink that writes through to the transport.
pub(crate) struct OutboundSink<'a> {
    outbound: &'a mut VecDeque<PooledBuffer>,
    buffers: &'a BufferPool,
    transport: &'a dyn Transport,
    conn: &'a Connection,
    stats: &'a ServerStats,
}

impl<'a> OutboundSink<'a> {
    pub fn new(
        ctx: &'a ServerContext,
        conn: &'a Connection,
        outbound: &'a mut VecDeque<PooledBuffer>,
        transport: &'a dyn Transport,
    ) -> Self {
        Self {
            outbound,
            buffers: &ctx.buffers,
            transport,
            conn,
            stats: &ctx.stats,
        }
    }
}

impl RecordSink for OutboundSink<'_> {
    fn buffer(&mut self) -> PooledBuffer {
        self.buffers.borrow()
    }

    fn enqueue(&mut self, records: PooledBuffer) {
        self.outbound.push_back(records);
    }

    fn flush(&mut self) -> io::Result<bool> {
        flush_outbound(self.outbound, self.transport, self.conn, self.stats)
    }
}

/// Maps a handler failure onto the close it causes.
pub(crate) fn handler_flow(ctx: &ServerContext, conn: &Connection, err: HandlerError) -> Flow {
    let id = conn.id();
    match err {
        HandlerError::Close => Flow::Close(CloseReason::Requested),
        HandlerError::Protocol(msg) => {
            debug!(id = %id, error = %msg, "Protocol error");
            Flow::Close(CloseReason::Protocol)
        }
        HandlerError::Session(e) => {
            warn!(id = %id, error = %e, "Session operation failed");
            Flow::Close(CloseReason::Protocol)
        }
        HandlerError::Io(e) => {
            debug!(id = %id, error = %e, "Handler I/O error");
            Flow::Close(CloseReason::Io)
        }
        HandlerError::Other(e) => {
            error!(id = %id, error = %e, "Handler failed");
            if ctx.config.strict {
                error!("Strict mode: aborting on internal error");
                std::process::abort();
            }
            Flow::Close(CloseReason::Internal)
        }
    }
}

/// A handler may also have asked to close through its session.
fn to_flow(
    ctx: &ServerContext,
    conn: &Connection,
    state: &ConnectionState,
    result: HandlerResult,
) -> Flow {
    match result {
        Ok(()) => state.close_requested.map_or(Flow::Continue, Flow::Close),
        Err(e) => handler_flow(ctx, conn, e),
    }
}

/// Announces the client and prompts for credentials.
pub(crate) fn greet(ctx: &ServerContext, conn: &Connection, state: &mut ConnectionState) -> Flow {
    state.greeted = true;

    if let Err(e) = state.start_output(&ctx.buffers) {
        return handler_flow(ctx, conn, SessionError::from(e).into());
    }
    if let Some(events) = &ctx.handlers.events {
        if let Err(e) = events.on_connect(&mut Session::new(ctx, conn, state)) {
            return handler_flow(ctx, conn, e);
        }
    }
    state.announced = true;

    match &ctx.handlers.authenticator {
        Some(auth) => {
            state.auth = AuthState::Pending;
            let result = auth.ask_authentication(&mut Session::new(ctx, conn, state));
            to_flow(ctx, conn, state, result)
        }
        None => {
            state.auth = AuthState::Authenticated;
            to_flow(ctx, conn, state, Ok(()))
        }
    }
}

/// Sends the timeout notice. The connection closes whatever happens.
pub(crate) fn notify_timeout(
    ctx: &ServerContext,
    conn: &Connection,
    state: &mut ConnectionState,
) {
    info!(client = ?conn.peer_addr(), id = %conn.id(), "Client timed out");
    let mut session = Session::new(ctx, conn, state);
    if let Err(e) = ctx.handlers.extended.on_timeout(&mut session) {
        debug!(id = %conn.id(), error = %e, "Timeout notice not sent");
    }
}

/// Sends the busy notice to a client turned away by admission control.
pub(crate) fn notify_max_connection(
    ctx: &ServerContext,
    conn: &Connection,
    state: &mut ConnectionState,
) {
    info!(client = ?conn.peer_addr(), "Max connections reached, rejecting client");
    let mut session = Session::new(ctx, conn, state);
    if let Err(e) = ctx.handlers.extended.on_max_connection(&mut session) {
        debug!(error = %e, "Busy notice not sent");
    }
}

/// Installs a TLS adapter. Bytes still in the decoder are ciphertext
/// that arrived right behind the upgrade request.
pub(crate) fn begin_tls(
    ctx: &ServerContext,
    conn: &Connection,
    state: &mut ConnectionState,
) -> Flow {
    let Some(config) = ctx.tls.clone() else {
        error!(id = %conn.id(), "TLS requested without a configuration");
        return Flow::Close(CloseReason::Internal);
    };
    match TlsAdapter::new(config) {
        Ok(adapter) => {
            let early = state.decoder.take_pending();
            if !early.is_empty() {
                let rest = state.raw_in.split();
                state.raw_in.extend_from_slice(&early);
                state.raw_in.extend_from_slice(&rest);
            }
            state.tls = Some(adapter);
            debug!(id = %conn.id(), "TLS handshake started");
            Flow::Continue
        }
        Err(e) => {
            warn!(id = %conn.id(), error = %e, "Could not start TLS");
            Flow::Close(CloseReason::Tls)
        }
    }
}

/// Runs everything in `raw_in` through TLS, the decoder and the handlers.
pub(crate) fn ingest(
    ctx: &ServerContext,
    conn: &Connection,
    state: &mut ConnectionState,
    transport: &dyn Transport,
) -> Flow {
    loop {
        let mut peer_closed = false;

        if state.tls.is_some() {
            match advance_tls(ctx, conn, state, transport) {
                Ok(true) => {}
                Ok(false) => return Flow::Continue,
                Err(flow) => return flow,
            }
            if !state.greeted {
                if let Flow::Close(reason) = greet(ctx, conn, state) {
                    return Flow::Close(reason);
                }
            }
            match unwrap_tls(conn, state) {
                Ok(closed) => peer_closed = closed,
                Err(flow) => return flow,
            }
        } else if !state.raw_in.is_empty() {
            let data = state.raw_in.split();
            state.decoder.feed(&data);
        }

        if let Flow::Close(reason) = decode_and_dispatch(ctx, conn, state) {
            return Flow::Close(reason);
        }
        if peer_closed {
            debug!(id = %conn.id(), "Peer sent close_notify");
            return Flow::Close(CloseReason::PeerClosed);
        }

        if !state.upgrade_requested {
            return Flow::Continue;
        }
        state.upgrade_requested = false;
        if let Flow::Close(reason) = begin_tls(ctx, conn, state) {
            return Flow::Close(reason);
        }
    }
}

/// Returns Ok(true) once the handshake is complete.
fn advance_tls(
    ctx: &ServerContext,
    conn: &Connection,
    state: &mut ConnectionState,
    transport: &dyn Transport,
) -> Result<bool, Flow> {
    let Some(tls) = state.tls.as_mut() else {
        return Ok(true);
    };
    if tls.is_handshake_complete() {
        return Ok(true);
    }

    let mut sink = OutboundSink::new(ctx, conn, &mut state.outbound, transport);
    match tls.advance(&mut state.raw_in, &mut sink) {
        Ok(Advance::Complete) => {
            debug!(id = %conn.id(), "TLS handshake complete");
            Ok(true)
        }
        Ok(Advance::NeedRead) | Ok(Advance::NeedWrite) => Ok(false),
        Err(e) => {
            // Push out any alert rustls produced before giving up.
            let alert = tls
                .write_records(&mut sink)
                .map_err(std::io::Error::other)
                .and_then(|()| sink.flush());
            if let Err(alert_err) = alert {
                trace!(id = %conn.id(), error = %alert_err, "TLS alert not sent");
            }
            info!(client = ?conn.peer_addr(), error = %e, "TLS handshake failed");
            Err(Flow::Close(CloseReason::Tls))
        }
    }
}

/// Decrypts `raw_in` into the decoder. Returns Ok(true) if the peer sent
/// close_notify.
fn unwrap_tls(conn: &Connection, state: &mut ConnectionState) -> Result<bool, Flow> {
    let Some(tls) = state.tls.as_mut() else {
        return Ok(false);
    };
    let mut plain = BytesMut::new();
    let result = tls.unwrap(&mut state.raw_in, &mut plain);
    if !plain.is_empty() {
        state.decoder.feed(&plain);
    }
    match result {
        Ok(Unwrapped::Data(_)) => Ok(false),
        Ok(Unwrapped::Closed(_)) => Ok(true),
        Err(e) => {
            warn!(id = %conn.id(), error = %e, "TLS record error");
            Err(Flow::Close(CloseReason::Tls))
        }
    }
}

fn decode_and_dispatch(
    ctx: &ServerContext,
    conn: &Connection,
    state: &mut ConnectionState,
) -> Flow {
    loop {
        let frame = match state.decoder.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return Flow::Continue,
            Err(e) => {
                warn!(client = ?conn.peer_addr(), error = %e, "Framing error");
                return Flow::Close(CloseReason::Protocol);
            }
        };
        ctx.stats.frame_processed();
        trace!(id = %conn.id(), bytes = frame.len(), "Decoded frame");

        if let Flow::Close(reason) = dispatch_frame(ctx, conn, state, frame) {
            return Flow::Close(reason);
        }
        if let Some(reason) = state.close_requested {
            return Flow::Close(reason);
        }
        // Later bytes belong to the TLS session.
        if state.upgrade_requested {
            return Flow::Continue;
        }
    }
}

/// Routes one frame to the authenticator or the handler for its mode.
pub(crate) fn dispatch_frame(
    ctx: &ServerContext,
    conn: &Connection,
    state: &mut ConnectionState,
    frame: Frame,
) -> Flow {
    if state.auth != AuthState::Authenticated {
        return authenticate(ctx, conn, state, frame);
    }

    let handlers = &ctx.handlers;
    let mut session = Session::new(ctx, conn, state);
    let result = match frame {
        Frame::Line(text) | Frame::Raw(text) => handlers
            .command
            .as_ref()
            .map(|h| h.handle_command(&mut session, &text)),
        Frame::Object(value) => handlers
            .object
            .as_ref()
            .map(|h| h.handle_object(&mut session, value)),
        Frame::Binary(data) => handlers
            .binary
            .as_ref()
            .map(|h| h.handle_binary(&mut session, data)),
    };
    match result {
        Some(result) => to_flow(ctx, conn, state, result),
        None => {
            error!(id = %conn.id(), "No handler for the active input mode");
            Flow::Close(CloseReason::Internal)
        }
    }
}

fn authenticate(
    ctx: &ServerContext,
    conn: &Connection,
    state: &mut ConnectionState,
    frame: Frame,
) -> Flow {
    let Some(auth) = &ctx.handlers.authenticator else {
        state.auth = AuthState::Authenticated;
        return dispatch_frame(ctx, conn, state, frame);
    };

    let status = {
        let mut session = Session::new(ctx, conn, state);
        auth.handle_authentication(&mut session, &frame)
    };
    match status {
        Err(e) => handler_flow(ctx, conn, e),
        Ok(AuthStatus::Incomplete) => Flow::Continue,
        Ok(AuthStatus::Accepted) => {
            state.auth = AuthState::Authenticated;
            state.auth_attempts = 0;
            debug!(id = %conn.id(), "Client authenticated");
            Flow::Continue
        }
        Ok(AuthStatus::Rejected) => {
            state.auth_attempts += 1;
            ctx.stats.auth_failed();
            let max = ctx.config.max_auth_try;
            if max > 0 && state.auth_attempts >= max {
                info!(
                    client = ?conn.peer_addr(),
                    attempts = state.auth_attempts,
                    "Max auth attempts reached"
                );
                let mut session = Session::new(ctx, conn, state);
                if let Err(e) = ctx.handlers.extended.on_max_auth_try(&mut session) {
                    debug!(id = %conn.id(), error = %e, "Max auth notice not sent");
                }
                return Flow::Close(CloseReason::MaxAuthTry);
            }
            debug!(id = %conn.id(), attempts = state.auth_attempts, "Authentication rejected");
            let result = auth.ask_authentication(&mut Session::new(ctx, conn, state));
            to_flow(ctx, conn, state, result)
        }
    }
}
