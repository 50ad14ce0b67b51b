//! Idle Connection Reaper
//!
//! A background thread that sweeps the live-connection registry and
//! reclaims connections that went quiet.
//!
//! ## Why Do We Need This?
//!
//! Event-driven connections have no thread parked on them, so nothing
//! notices when a client simply stops talking. Blocking connections time
//! out on their own socket, but a ghost (closed, yet still registered) or a
//! worker stuck in a slow write would otherwise pin a slot forever.
//!
//! ## Design
//!
//! The reaper runs on its own thread and, every `timeout / 2`:
//! 1. Takes a snapshot of the registry (optimistic, then locked)
//! 2. Removes ghosts right away
//! 3. Queues TIMEOUT for every connection idle past its limit
//!
//! Blocking connections get `blocking_padding_ms` of grace because their
//! own socket timeout should fire first. Their owner thread is parked in
//! `read`, so the reaper shuts the socket down to wake it.
//!
//! Sweeping continues after shutdown starts, so a connection that hangs
//! in its close path is still reclaimed. The thread exits once the server
//! has stopped and the registry is empty.

use crate::connection::{Connection, ConnectionId, Event};
use crate::error::CloseReason;
use crate::server::{dispatch, ServerContext, ServerState};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use std::io;
use std::net::Shutdown;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, trace};

/// How often the reaper checks the registry while waiting to release the
/// pools after shutdown.
const DRAIN_CHECK: Duration = Duration::from_millis(50);

/// A handle to the running reaper.
///
/// When this handle is dropped, the reaper thread is told to stop.
#[derive(Debug)]
pub(crate) struct Reaper {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl Reaper {
    /// Starts the reaper. Returns None when idle timeouts are disabled.
    pub fn start(ctx: Arc<ServerContext>) -> io::Result<Option<Self>> {
        let Some(timeout) = ctx.config.timeout() else {
            debug!("Idle timeout disabled, reaper not started");
            return Ok(None);
        };
        let (stop_tx, stop_rx) = bounded(1);
        let name = format!("{}-reaper", ctx.config.name);
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || reaper_loop(ctx, timeout, stop_rx))?;

        info!(timeout_ms = timeout.as_millis() as u64, "Idle reaper started");
        Ok(Some(Self {
            stop_tx,
            handle: Some(handle),
        }))
    }

    /// Tells the reaper to stop sweeping. It releases the pools once the
    /// registry is empty.
    pub fn stop(&self) {
        let _ = self.stop_tx.try_send(());
    }

    pub fn join(&mut self) {
        self.stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The main reaper loop.
fn reaper_loop(ctx: Arc<ServerContext>, timeout: Duration, stop_rx: Receiver<()>) {
    let period = (timeout / 2).max(Duration::from_millis(1));

    loop {
        match stop_rx.recv_timeout(period) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                debug!("Reaper received shutdown signal");
                break;
            }
        }
        if ctx.state() == ServerState::Stopped && ctx.registry.is_empty() {
            break;
        }
        let reclaimed = sweep(&ctx, timeout);
        if reclaimed > 0 {
            debug!(
                reclaimed,
                remaining = ctx.registry.len(),
                "Idle connections reclaimed"
            );
        }
    }

    while !ctx.registry.is_empty() {
        thread::sleep(DRAIN_CHECK);
    }
    ctx.release_pools();
    info!("Idle reaper stopped");
}

/// One pass over the registry. Returns how many connections were acted on.
pub(crate) fn sweep(ctx: &Arc<ServerContext>, timeout: Duration) -> usize {
    let padding = if ctx.is_blocking() {
        Duration::from_millis(ctx.config.reaper.blocking_padding_ms)
    } else {
        Duration::ZERO
    };
    let limit = timeout + padding;
    let mut reclaimed = 0;

    for (id, conn) in ctx.registry.snapshot(ctx.config.reaper.optimistic_retries) {
        if conn.is_closed() || conn.generation() != id.generation {
            trace!(id = %id, "Removing ghost connection");
            ctx.registry.remove(id);
            reclaimed += 1;
            continue;
        }
        if conn.idle_for() < limit {
            continue;
        }
        reclaim(ctx, id, &conn);
        reclaimed += 1;
    }
    reclaimed
}

fn reclaim(ctx: &Arc<ServerContext>, id: ConnectionId, conn: &Arc<Connection>) {
    debug!(
        id = %id,
        client = ?conn.peer_addr(),
        idle_ms = conn.idle_for().as_millis() as u64,
        "Reclaiming idle connection"
    );
    if ctx.is_blocking() {
        conn.request_close(CloseReason::Timeout, true);
        conn.interrupt(Shutdown::Both);
        return;
    }

    if conn.holders() > 0 {
        // A worker may be parked in the close drain.
        conn.request_close(CloseReason::Timeout, true);
        conn.wake();
    }
    if conn.push_event(Event::Timeout) {
        dispatch(ctx, conn, id.generation);
    }
}
