//! The event-driven personality.
//!
//! Each job pops one event off the connection's queue and runs it to
//! completion under the state lock. Nothing here blocks on the socket:
//! reads stop at `WouldBlock`, and writes that do not fit leave the rest
//! on the outbound chain with WRITE interest requested.

use super::protocol::{self, flush, Flow};
use super::state::ConnectionState;
use super::transport::{EventedTransport, Transport};
use super::{Connection, Event, Session};
use crate::error::CloseReason;
use crate::server::ServerContext;
use mio::Interest;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use tracing::{debug, info, trace};

/// Runs one event for `conn`, which the caller holds and has locked.
///
/// A handler panic closes the connection instead of leaving it
/// registered with no interest and no owner.
pub(crate) fn process(
    ctx: &ServerContext,
    conn: &Connection,
    generation: u64,
    state: &mut ConnectionState,
    event: Event,
) {
    let transport = EventedTransport::new(ctx, conn);
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
        step(ctx, conn, generation, state, &transport, event)
    }));
    if let Err(payload) = outcome {
        super::close::close_after_panic(ctx, conn, state, &transport, payload.as_ref());
    }
}

fn step(
    ctx: &ServerContext,
    conn: &Connection,
    generation: u64,
    state: &mut ConnectionState,
    transport: &EventedTransport<'_>,
    event: Event,
) {
    trace!(id = %conn.id(), ?event, "Processing event");

    let flow = match event {
        Event::Accept => accept(ctx, conn, state, transport),
        Event::MaxConnection => {
            protocol::notify_max_connection(ctx, conn, state);
            Flow::Close(CloseReason::MaxConnection)
        }
        Event::Read => read(ctx, conn, state, transport),
        Event::Write => write(ctx, conn, state, transport),
        Event::Timeout => timeout(ctx, conn, state),
        Event::Close => Flow::Close(conn.take_pending_close().unwrap_or(CloseReason::Requested)),
    };

    let flow = match flow {
        Flow::Continue => match flush(ctx, conn, state, transport) {
            Ok(_) => Flow::Continue,
            Err(e) => {
                debug!(id = %conn.id(), error = %e, "Write failed");
                Flow::Close(CloseReason::Io)
            }
        },
        close => close,
    };

    match flow {
        Flow::Close(reason) => super::close::close(ctx, conn, state, transport, reason),
        Flow::Continue => {
            let interest = if state.outbound.is_empty() {
                Interest::READABLE
            } else {
                Interest::READABLE | Interest::WRITABLE
            };
            ctx.request_interest(conn, generation, interest);
        }
    }
}

fn accept(
    ctx: &ServerContext,
    conn: &Connection,
    state: &mut ConnectionState,
    transport: &dyn Transport,
) -> Flow {
    info!(client = ?conn.peer_addr(), id = %conn.id(), "Client connected");
    if ctx.start_secure {
        if let Flow::Close(reason) = protocol::begin_tls(ctx, conn, state) {
            return Flow::Close(reason);
        }
        // The ClientHello may already be waiting.
        protocol::ingest(ctx, conn, state, transport)
    } else {
        protocol::greet(ctx, conn, state)
    }
}

/// A queued TIMEOUT may be stale: the client can have spoken between the
/// reaper's sweep and this job. Only a forced reclaim skips the check.
fn timeout(ctx: &ServerContext, conn: &Connection, state: &mut ConnectionState) -> Flow {
    if !conn.is_force_closed() {
        if let Some(limit) = ctx.config.timeout() {
            if conn.idle_for() < limit {
                debug!(id = %conn.id(), "Connection active again, timeout dropped");
                return Flow::Continue;
            }
        }
    }
    protocol::notify_timeout(ctx, conn, state);
    Flow::Close(CloseReason::Timeout)
}

fn read(
    ctx: &ServerContext,
    conn: &Connection,
    state: &mut ConnectionState,
    transport: &dyn Transport,
) -> Flow {
    let limit = ctx.config.limits.max_read_per_event;
    let size = ctx.buffers.buffer_size();
    let mut buf = ctx.buffers.borrow();
    let mut total = 0;
    let mut eof = false;

    while total < limit && !conn.is_force_closed() {
        let scratch = buf.scratch(size);
        match transport.read(scratch) {
            Ok(0) => {
                eof = true;
                break;
            }
            Ok(n) => {
                state.raw_in.extend_from_slice(&scratch[..n]);
                conn.record_read(n);
                ctx.stats.bytes_read(n);
                total += n;
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!(id = %conn.id(), error = %e, "Read failed");
                return Flow::Close(CloseReason::Io);
            }
        }
    }
    drop(buf);
    trace!(id = %conn.id(), bytes = total, eof, "Read data");

    match protocol::ingest(ctx, conn, state, transport) {
        Flow::Continue if eof => Flow::Close(CloseReason::PeerClosed),
        flow => flow,
    }
}

fn write(
    ctx: &ServerContext,
    conn: &Connection,
    state: &mut ConnectionState,
    transport: &dyn Transport,
) -> Flow {
    let drained = {
        let _permit = ctx.write_gate.enter();
        flush(ctx, conn, state, transport)
    };
    match drained {
        Err(e) => {
            debug!(id = %conn.id(), error = %e, "Write failed");
            return Flow::Close(CloseReason::Io);
        }
        Ok(false) => return Flow::Continue,
        Ok(true) => {}
    }

    let handshaking = state
        .tls
        .as_ref()
        .is_some_and(|tls| !tls.is_handshake_complete());
    if handshaking {
        return protocol::ingest(ctx, conn, state, transport);
    }

    let Some(handler) = &ctx.handlers.write else {
        return Flow::Continue;
    };
    let result = handler.on_write_ready(&mut Session::new(ctx, conn, state));
    match result {
        Ok(()) => state.close_requested.map_or(Flow::Continue, Flow::Close),
        Err(e) => protocol::handler_flow(ctx, conn, e),
    }
}
