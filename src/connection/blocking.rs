//! The blocking personality.
//!
//! A reserved worker thread owns the socket for the connection's whole
//! life and parks in `read` with the idle timeout as the socket read
//! timeout. Other threads reach it only by shutting down its socket
//! through the connection's interrupt handle.

use super::protocol::{self, flush, Flow};
use super::state::ConnectionState;
use super::transport::{is_timeout, BlockingTransport, Transport};
use super::{Connection, Event, HoldGuard};
use crate::error::CloseReason;
use crate::server::ServerContext;
use std::io;
use std::net::TcpStream;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, info, trace};

/// Drives one connection from admission to close on the calling thread.
pub(crate) fn run(
    ctx: Arc<ServerContext>,
    conn: Arc<Connection>,
    generation: u64,
    stream: TcpStream,
    event: Event,
) {
    if !conn.try_hold(&ctx, generation) {
        debug!(id = %conn.id(), "Connection gone before its worker started");
        return;
    }
    let _hold = HoldGuard::adopt(&conn, &ctx);
    let transport = BlockingTransport::new(stream);

    let mut state = conn.state.lock();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        let reason = drive(&ctx, &conn, &mut state, &transport, event);
        super::close::close(&ctx, &conn, &mut state, &transport, reason);
    }));
    if let Err(payload) = outcome {
        super::close::close_after_panic(&ctx, &conn, &mut state, &transport, payload.as_ref());
    }
}

fn drive(
    ctx: &ServerContext,
    conn: &Connection,
    state: &mut ConnectionState,
    transport: &BlockingTransport,
    event: Event,
) -> CloseReason {
    if event == Event::MaxConnection {
        protocol::notify_max_connection(ctx, conn, state);
        return CloseReason::MaxConnection;
    }

    info!(client = ?conn.peer_addr(), id = %conn.id(), "Client connected");
    if let Err(e) = transport.set_read_timeout(ctx.config.timeout()) {
        debug!(id = %conn.id(), error = %e, "Could not set read timeout");
        return CloseReason::Io;
    }

    let flow = if ctx.start_secure {
        match protocol::begin_tls(ctx, conn, state) {
            Flow::Continue => protocol::ingest(ctx, conn, state, transport),
            close => close,
        }
    } else {
        protocol::greet(ctx, conn, state)
    };
    if let Flow::Close(reason) = flow {
        return reason;
    }

    let size = ctx.buffers.buffer_size();
    let mut buf = ctx.buffers.borrow();
    loop {
        if let Err(e) = flush(ctx, conn, state, transport) {
            if let Some(reason) = conn.take_pending_close() {
                return reason;
            }
            debug!(id = %conn.id(), error = %e, "Write failed");
            return CloseReason::Io;
        }

        let scratch = buf.scratch(size);
        match transport.read(scratch) {
            Ok(0) => return conn.take_pending_close().unwrap_or(CloseReason::PeerClosed),
            Ok(n) => {
                state.raw_in.extend_from_slice(&scratch[..n]);
                conn.record_read(n);
                ctx.stats.bytes_read(n);
                trace!(id = %conn.id(), bytes = n, "Read data");
            }
            Err(e) if is_timeout(&e) => {
                if let Some(reason) = conn.take_pending_close() {
                    return reason;
                }
                protocol::notify_timeout(ctx, conn, state);
                return CloseReason::Timeout;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                if let Some(reason) = conn.take_pending_close() {
                    return reason;
                }
                debug!(id = %conn.id(), error = %e, "Read failed");
                return CloseReason::Io;
            }
        }

        if let Flow::Close(reason) = protocol::ingest(ctx, conn, state, transport) {
            return reason;
        }
    }
}
