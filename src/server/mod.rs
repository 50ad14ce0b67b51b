//! Server
//!
//! Wires the pools, the event loop, the dispatcher and the reaper around a
//! shared [`ServerContext`], and exposes the running server as [`Server`].
//!
//! ## Threads
//!
//! ```text
//!   ┌──────────────┐  accept / readiness  ┌──────────────┐
//!   │  event loop  │─────────────────────>│ worker pool  │  event jobs, or one
//!   │ (mio::Poll)  │<─────────────────────│              │  thread per blocking
//!   └──────────────┘  interest requests   └──────────────┘  connection
//!          ▲            (queue + waker)          ▲
//!          │                                     │ TIMEOUT
//!          │ shutdown                    ┌──────────────┐
//!   ┌──────────────┐                     │    reaper    │
//!   │   Server     │────── stop ────────>│              │
//!   └──────────────┘                     └──────────────┘
//! ```
//!
//! Worker threads never touch the poll registry themselves. They queue a
//! [`Registration`] and wake the loop, which applies the queue in order at
//! the top of its next iteration.

mod access;
mod builder;
mod dispatcher;
mod event_loop;
mod registry;
mod socket;

#[cfg(test)]
mod tests;

pub use access::{Access, AccessPolicy, IpAccessList};
pub use builder::ServerBuilder;

pub(crate) use dispatcher::dispatch;

use crate::config::{ExecutionMode, ServerConfig};
use crate::connection::{Connection, ConnectionId, ConnectionInfo, Event};
use crate::error::CloseReason;
use crate::handler::{ClientData, Handlers};
use crate::pool::{BufferPool, ObjectPool, Poolable, WorkerPool};
use crate::reaper::Reaper;
use crate::stats::{ServerStats, StatsSnapshot};
use dispatcher::WriteGate;
use mio::{Interest, Token};
use parking_lot::Mutex;
use registry::Registry;
use std::collections::VecDeque;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;
use tracing::{debug, error, info};

/// Lifecycle of the server as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Running,
    /// Shutdown was requested; the listener is about to close
    ShuttingDown,
    /// The listener is closed; live connections are draining
    Stopped,
}

impl ServerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ServerState::Running,
            1 => ServerState::ShuttingDown,
            _ => ServerState::Stopped,
        }
    }
}

/// A request from a worker thread to the event loop.
pub(crate) enum Registration {
    /// Add interest for the channel bound at `generation`
    Interest {
        token: Token,
        generation: u64,
        interest: Interest,
    },
    /// Deregister and drop a closed channel
    Cancel {
        token: Token,
        generation: u64,
        stream: mio::net::TcpStream,
    },
}

type ShutdownHook = Box<dyn FnOnce() + Send>;

impl Poolable for Box<dyn ClientData> {
    fn reset(&mut self) {
        ClientData::reset(&mut **self);
    }
}

/// State shared by every engine thread.
pub(crate) struct ServerContext {
    pub(crate) config: ServerConfig,
    pub(crate) handlers: Handlers,
    pub(crate) tls: Option<Arc<rustls::ServerConfig>>,
    pub(crate) start_secure: bool,
    pub(crate) access: Arc<dyn AccessPolicy>,
    pub(crate) buffers: BufferPool,
    pub(crate) connections: ObjectPool<Arc<Connection>>,
    pub(crate) client_data: Option<ObjectPool<Box<dyn ClientData>>>,
    pub(crate) workers: WorkerPool,
    pub(crate) registry: Registry,
    pub(crate) stats: Arc<ServerStats>,
    pub(crate) write_gate: WriteGate,
    registrations: Mutex<VecDeque<Registration>>,
    waker: mio::Waker,
    state: AtomicU8,
    epoch: Instant,
    pools_released: AtomicBool,
    shutdown_hooks: Mutex<Vec<ShutdownHook>>,
}

impl ServerContext {
    pub fn state(&self) -> ServerState {
        ServerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ServerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.state() != ServerState::Running
    }

    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    pub fn is_blocking(&self) -> bool {
        self.config.mode == ExecutionMode::Blocking
    }

    /// Flips Running to ShuttingDown. False if shutdown already began.
    fn begin_shutdown(&self) -> bool {
        let started = self
            .state
            .compare_exchange(
                ServerState::Running as u8,
                ServerState::ShuttingDown as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if started {
            info!(server = %self.config.name, "Shutdown requested");
            self.wake();
        }
        started
    }

    fn run_shutdown_hooks(&self) {
        let hooks = std::mem::take(&mut *self.shutdown_hooks.lock());
        for hook in hooks {
            hook();
        }
    }

    pub fn wake(&self) {
        if let Err(e) = self.waker.wake() {
            error!(error = %e, "Failed to wake the event loop");
        }
    }

    /// Asks the loop to add `interest` for the connection's channel.
    pub fn request_interest(&self, conn: &Connection, generation: u64, interest: Interest) {
        self.registrations.lock().push_back(Registration::Interest {
            token: event_loop::token_for(conn.slot()),
            generation,
            interest,
        });
        self.wake();
    }

    /// Hands a closed channel back to the loop for deregistration.
    pub fn cancel_registration(
        &self,
        conn: &Connection,
        generation: u64,
        stream: mio::net::TcpStream,
    ) {
        self.registrations.lock().push_back(Registration::Cancel {
            token: event_loop::token_for(conn.slot()),
            generation,
            stream,
        });
        self.wake();
    }

    fn take_registrations(&self) -> Vec<Registration> {
        self.registrations.lock().drain(..).collect()
    }

    /// Returns a connection and its client data to their pools. Called by
    /// the last holder, once per binding.
    pub fn recycle(&self, conn: Arc<Connection>) {
        let data = conn.state.lock().client_data.take();
        if let (Some(pool), Some(data)) = (&self.client_data, data) {
            pool.give_back(data);
        }
        debug!(slot = conn.slot(), "Connection recycled");
        self.connections.give_back(conn);
    }

    /// Asks whoever drives `conn` to close it.
    pub fn close_connection(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        generation: u64,
        reason: CloseReason,
    ) {
        if conn.generation() != generation || conn.is_closed() {
            return;
        }
        conn.request_close(reason, false);
        if self.is_blocking() {
            // The owner sees end of stream and runs the close path; writes
            // still drain.
            conn.interrupt(Shutdown::Read);
        } else if conn.push_event(Event::Close) {
            dispatch(self, conn, generation);
        }
    }

    /// Gives up on a connection that was bound but never started.
    pub fn abandon(&self, conn: &Arc<Connection>, generation: u64) {
        if !conn.try_hold(self, generation) {
            return;
        }
        {
            let mut state = conn.state.lock();
            if state.admitted {
                state.admitted = false;
                self.registry.remove(conn.id());
                self.stats.connection_closed(CloseReason::Internal);
            }
            conn.mark_closed();
        }
        conn.release(self);
    }

    /// Closes every pool. Safe to call more than once.
    pub fn release_pools(&self) {
        if self.pools_released.swap(true, Ordering::AcqRel) {
            return;
        }
        self.connections.release();
        if let Some(pool) = &self.client_data {
            pool.release();
        }
        self.buffers.release();
        info!(server = %self.config.name, "Pools released");
    }
}

/// A running server.
///
/// Dropping the handle requests shutdown without waiting for it; call
/// [`wait`](Self::wait) to block until every connection is closed.
pub struct Server {
    ctx: Arc<ServerContext>,
    local_addr: SocketAddr,
    event_loop: Option<JoinHandle<()>>,
    reaper: Option<Reaper>,
}

impl Server {
    pub fn builder(config: ServerConfig) -> ServerBuilder {
        ServerBuilder::new(config)
    }

    /// The address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn state(&self) -> ServerState {
        self.ctx.state()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.ctx.stats.snapshot()
    }

    /// Number of admitted, not yet closed connections.
    pub fn connection_count(&self) -> usize {
        self.ctx.registry.len()
    }

    /// A snapshot of every live connection.
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.ctx
            .registry
            .snapshot(self.ctx.config.reaper.optimistic_retries)
            .into_iter()
            .filter(|(id, conn)| conn.generation() == id.generation && !conn.is_closed())
            .map(|(_, conn)| conn.info())
            .collect()
    }

    pub fn find(&self, id: ConnectionId) -> Option<ConnectionInfo> {
        self.ctx
            .registry
            .get(id)
            .filter(|conn| conn.generation() == id.generation && !conn.is_closed())
            .map(|conn| conn.info())
    }

    /// Closes one connection. Returns false if it is no longer live.
    pub fn close_connection(&self, id: ConnectionId) -> bool {
        match self.ctx.registry.get(id) {
            Some(conn) if !conn.is_closed() => {
                self.ctx.close_connection(&conn, id.generation, CloseReason::Requested);
                true
            }
            _ => false,
        }
    }

    pub fn close_all_connections(&self) {
        for (id, conn) in self.ctx.registry.snapshot_locked() {
            self.ctx.close_connection(&conn, id.generation, CloseReason::Requested);
        }
    }

    /// Stops accepting and starts closing every connection. Returns
    /// immediately. The reaper keeps sweeping until the last connection
    /// is gone.
    pub fn shutdown(&self) {
        self.ctx.begin_shutdown();
    }

    /// Blocks until the event loop and the reaper have exited, then stops
    /// the worker threads.
    pub fn wait(mut self) {
        if let Some(handle) = self.event_loop.take() {
            if handle.join().is_err() {
                error!("Event loop panicked");
            }
        }
        if let Some(mut reaper) = self.reaper.take() {
            reaper.join();
        }
        self.ctx.workers.shutdown();
        info!(server = %self.ctx.config.name, "Server stopped");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("name", &self.ctx.config.name)
            .field("local_addr", &self.local_addr)
            .field("state", &self.state())
            .field("connections", &self.connection_count())
            .finish()
    }
}
