//! The ordered close path.
//!
//! Every connection, in either personality and for any reason, goes
//! through [`close`] exactly once per binding:
//!
//! 1. drain the outbound chain, bounded by `close_drain_timeout`
//! 2. send TLS close_notify (unless TLS itself failed)
//! 3. fire `on_closing` or `on_lost` if `on_connect` had succeeded
//! 4. close the socket and cancel its registration
//! 5. return pooled buffers, drop TLS
//! 6. leave the registry and mark the connection closed
//!
//! The slot goes back to its pool when the last holder releases it.

use super::protocol::{flush, OutboundSink};
use super::state::ConnectionState;
use super::transport::Transport;
use super::{Connection, Session};
use crate::error::CloseReason;
use crate::server::ServerContext;
use crate::tls::RecordSink;
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Longest single wait for the socket to drain.
const DRAIN_POLL: Duration = Duration::from_millis(10);

pub(crate) fn close(
    ctx: &ServerContext,
    conn: &Connection,
    state: &mut ConnectionState,
    transport: &dyn Transport,
    reason: CloseReason,
) {
    if state.closing || conn.is_closed() {
        return;
    }
    state.closing = true;
    debug!(id = %conn.id(), %reason, "Closing connection");

    drain(ctx, conn, state, transport);

    if reason != CloseReason::Tls {
        if let Some(tls) = state.tls.as_mut() {
            let mut sink = OutboundSink::new(ctx, conn, &mut state.outbound, transport);
            let sent = tls
                .close_outbound(&mut sink)
                .map_err(std::io::Error::other)
                .and_then(|()| sink.flush());
            if let Err(e) = sent {
                debug!(id = %conn.id(), error = %e, "close_notify not sent");
            }
        }
    }

    if state.announced {
        state.announced = false;
        if let Some(events) = ctx.handlers.events.clone() {
            let mut session = Session::new(ctx, conn, state);
            if reason.is_clean() {
                events.on_closing(&mut session, reason);
            } else {
                events.on_lost(&mut session, reason);
            }
        }
    }

    finish(ctx, conn, state, transport, reason);
}

/// Closes the socket and leaves the registry. Runs at most once, even
/// when the first half of [`close`] unwound part way through.
fn finish(
    ctx: &ServerContext,
    conn: &Connection,
    state: &mut ConnectionState,
    transport: &dyn Transport,
    reason: CloseReason,
) {
    if conn.is_closed() {
        return;
    }
    transport.close();

    state.outbound.clear();
    state.raw_in.clear();
    state.decoder.take_pending();
    state.tls = None;

    if state.admitted {
        state.admitted = false;
        ctx.registry.remove(conn.id());
        ctx.stats.connection_closed(reason);
    }
    conn.mark_closed();

    info!(client = ?conn.peer_addr(), id = %conn.id(), %reason, "Client disconnected");
}

/// Closes a connection whose handler panicked.
///
/// Strict servers abort. Otherwise the connection goes through [`close`]
/// as an internal failure; if that panics too (in `on_lost`, say), the
/// socket and registry are still cleaned up.
pub(crate) fn close_after_panic(
    ctx: &ServerContext,
    conn: &Connection,
    state: &mut ConnectionState,
    transport: &dyn Transport,
    payload: &(dyn Any + Send),
) {
    error!(
        id = %conn.id(),
        client = ?conn.peer_addr(),
        panic = panic_message(payload),
        "Handler panicked"
    );
    if ctx.config.strict {
        error!("Strict mode: aborting on handler panic");
        std::process::abort();
    }
    if conn.is_closed() {
        return;
    }
    if !state.closing {
        let closed = panic::catch_unwind(AssertUnwindSafe(|| {
            close(ctx, conn, state, transport, CloseReason::Internal)
        }));
        if closed.is_ok() {
            return;
        }
        warn!(id = %conn.id(), "Close path panicked");
    }
    finish(ctx, conn, state, transport, CloseReason::Internal);
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Writes what is left on the outbound chain until it is empty, the
/// deadline passes, or a forced close is requested.
fn drain(
    ctx: &ServerContext,
    conn: &Connection,
    state: &mut ConnectionState,
    transport: &dyn Transport,
) {
    if state.outbound.is_empty() {
        return;
    }
    let deadline = Instant::now() + ctx.config.close_drain_timeout();

    loop {
        transport.limit_writes(deadline.saturating_duration_since(Instant::now()));
        match flush(ctx, conn, state, transport) {
            Ok(true) => return,
            Ok(false) => {}
            Err(e) => {
                debug!(id = %conn.id(), error = %e, "Drain failed");
                break;
            }
        }
        if conn.is_force_closed() {
            break;
        }
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        transport.wait_writable((deadline - now).min(DRAIN_POLL));
    }

    let unsent: usize = state.outbound.iter().map(|buf| buf.len()).sum();
    if unsent > 0 {
        warn!(id = %conn.id(), bytes = unsent, "Dropping unsent data on close");
    }
}
