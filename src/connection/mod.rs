//! Connections
//!
//! A [`Connection`] is a pooled slot that gets bound to one accepted socket
//! at a time. Each binding bumps the slot's *generation*, so a handle
//! captured for an earlier client can never act on a later one.
//!
//! ## Personalities
//!
//! ```text
//!  Blocking                              Event-driven
//!  ────────                              ────────────
//!  ┌──────────────────────────┐          ┌────────────┐  READ/WRITE/TIMEOUT...
//!  │ reserved worker thread   │          │ event loop │────────┐
//!  │                          │          └────────────┘        ▼
//!  │  loop {                  │                        ┌──────────────┐
//!  │    read (socket timeout) │                        │ event queue  │ (per connection)
//!  │    decode, dispatch      │                        └──────┬───────┘
//!  │    flush                 │                               │ one event per job
//!  │  }                       │                               ▼
//!  │  close path              │                        ┌──────────────┐
//!  └──────────────────────────┘                        │ worker pool  │
//!                                                      └──────────────┘
//! ```
//!
//! Both personalities share the decode/dispatch code in `protocol` and the
//! ordered close path in `close`.
//!
//! ## Holders
//!
//! Several threads may hold a reference at once (the loop dispatching a
//! READ while the reaper queues a TIMEOUT), but only the one holding the
//! state lock drives transitions. A holder count, capped at
//! [`MAX_HOLDERS`], keeps the slot out of its pool until the last holder
//! lets go; the return itself is a single CAS on the `recycled` flag.
//!
//! Lock order is state, then channel. The event loop only ever takes the
//! channel lock.

pub(crate) mod blocking;
pub(crate) mod close;
pub(crate) mod event_driven;
pub(crate) mod protocol;
pub mod session;
pub(crate) mod state;
pub(crate) mod transport;

pub use session::{Session, SessionError};
pub use state::AuthState;

use crate::config::ServerConfig;
use crate::error::CloseReason;
use crate::handler::ClientData;
use crate::pool::Poolable;
use crate::server::ServerContext;
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use state::ConnectionState;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::net::{Shutdown, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

/// Most threads that may hold one connection at the same time.
pub const MAX_HOLDERS: usize = 5;

/// One unit of pending work for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    Accept,
    Read,
    Write,
    Close,
    MaxConnection,
    Timeout,
}

/// Identifies one client: the pool slot plus the generation of the binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionId {
    pub slot: usize,
    pub generation: u64,
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.slot, self.generation)
    }
}

/// Snapshot of a live connection for external inspection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer: Option<SocketAddr>,
    pub connected_for: Duration,
    pub idle_for: Duration,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// FIFO of pending events, deduplicated by a membership set.
#[derive(Debug, Default)]
struct EventQueue {
    queue: VecDeque<Event>,
    pending: HashSet<Event>,
}

impl EventQueue {
    fn push(&mut self, event: Event) -> bool {
        if !self.pending.insert(event) {
            return false;
        }
        self.queue.push_back(event);
        true
    }

    fn pop(&mut self) -> Option<Event> {
        let event = self.queue.pop_front()?;
        self.pending.remove(&event);
        Some(event)
    }

    fn clear(&mut self) {
        self.queue.clear();
        self.pending.clear();
    }
}

/// A pooled connection slot.
pub struct Connection {
    slot: usize,
    epoch: Instant,
    generation: AtomicU64,
    holders: AtomicUsize,
    closed: AtomicBool,
    recycled: AtomicBool,
    force_close: AtomicBool,
    pending_close: Mutex<Option<CloseReason>>,
    pub(crate) state: Mutex<ConnectionState>,
    events: Mutex<EventQueue>,
    pub(crate) channel: Mutex<Option<mio::net::TcpStream>>,
    /// Clone of a blocking socket that other threads may shut down
    interrupt: Mutex<Option<std::net::TcpStream>>,
    peer: Mutex<Option<SocketAddr>>,
    connected_at: AtomicU64,
    last_communication: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    woken: Mutex<bool>,
    wakeup: Condvar,
}

impl Connection {
    pub(crate) fn new(slot: usize, epoch: Instant, config: &ServerConfig) -> Self {
        Self {
            slot,
            epoch,
            generation: AtomicU64::new(0),
            holders: AtomicUsize::new(0),
            // Unbound slots behave like closed ones
            closed: AtomicBool::new(true),
            recycled: AtomicBool::new(true),
            force_close: AtomicBool::new(false),
            pending_close: Mutex::new(None),
            state: Mutex::new(ConnectionState::new(config.data_modes, config.limits.clone())),
            events: Mutex::new(EventQueue::default()),
            channel: Mutex::new(None),
            interrupt: Mutex::new(None),
            peer: Mutex::new(None),
            connected_at: AtomicU64::new(0),
            last_communication: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            woken: Mutex::new(false),
            wakeup: Condvar::new(),
        }
    }

    pub fn slot(&self) -> usize {
        self.slot
    }

    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn id(&self) -> ConnectionId {
        ConnectionId {
            slot: self.slot,
            generation: self.generation(),
        }
    }

    /// Attaches the slot to a new client. Returns the new generation.
    pub(crate) fn bind(
        &self,
        peer: SocketAddr,
        config: &ServerConfig,
        client_data: Option<Box<dyn ClientData>>,
    ) -> u64 {
        self.state.lock().prepare(config.data_modes, client_data);
        self.events.lock().clear();
        *self.peer.lock() = Some(peer);
        *self.pending_close.lock() = None;
        self.force_close.store(false, Ordering::Release);

        let now = self.now_ms();
        self.connected_at.store(now, Ordering::Release);
        self.last_communication.store(now, Ordering::Release);
        self.bytes_read.store(0, Ordering::Release);
        self.bytes_written.store(0, Ordering::Release);

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.recycled.store(false, Ordering::Release);
        self.closed.store(false, Ordering::Release);
        generation
    }

    pub(crate) fn set_channel(&self, stream: mio::net::TcpStream) {
        *self.channel.lock() = Some(stream);
    }

    pub(crate) fn set_interrupt(&self, stream: Option<std::net::TcpStream>) {
        *self.interrupt.lock() = stream;
    }

    /// Shuts down a blocking socket from another thread so its owner
    /// wakes up.
    pub(crate) fn interrupt(&self, how: Shutdown) {
        if let Some(stream) = self.interrupt.lock().as_ref() {
            let _ = stream.shutdown(how);
        }
    }

    // ── holder protocol ────────────────────────────────────────────────

    /// Registers a holder for `generation`. Fails when the cap is reached,
    /// the slot was rebound, or the connection is closed.
    pub(crate) fn try_hold(self: &Arc<Self>, ctx: &ServerContext, generation: u64) -> bool {
        let mut current = self.holders.load(Ordering::Acquire);
        loop {
            if current >= MAX_HOLDERS {
                trace!(slot = self.slot, "Holder cap reached");
                return false;
            }
            match self.holders.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        if self.generation() != generation || self.is_closed() {
            self.release(ctx);
            return false;
        }
        true
    }

    /// Drops a holder. The last holder of a closed connection returns it
    /// to its pool, exactly once per binding.
    pub(crate) fn release(self: &Arc<Self>, ctx: &ServerContext) {
        let previous = self.holders.fetch_sub(1, Ordering::AcqRel);
        if previous == 1
            && self.is_closed()
            && self
                .recycled
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
        {
            ctx.recycle(Arc::clone(self));
        }
    }

    pub fn holders(&self) -> usize {
        self.holders.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn mark_closed(&self) {
        self.closed.store(true, Ordering::Release);
    }

    // ── cooperative cancellation ───────────────────────────────────────

    /// Asks whoever drives the connection to close it with `reason`. With
    /// `force`, drain loops stop waiting for the peer.
    pub(crate) fn request_close(&self, reason: CloseReason, force: bool) {
        self.pending_close.lock().get_or_insert(reason);
        if force {
            self.force_close.store(true, Ordering::Release);
        }
    }

    pub(crate) fn take_pending_close(&self) -> Option<CloseReason> {
        self.pending_close.lock().take()
    }

    pub fn is_force_closed(&self) -> bool {
        self.force_close.load(Ordering::Acquire)
    }

    /// Wakes a thread parked in [`wait_for_wakeup`](Self::wait_for_wakeup).
    pub(crate) fn wake(&self) {
        *self.woken.lock() = true;
        self.wakeup.notify_all();
    }

    pub(crate) fn wait_for_wakeup(&self, timeout: Duration) {
        let mut woken = self.woken.lock();
        if !*woken {
            self.wakeup.wait_for(&mut woken, timeout);
        }
        *woken = false;
    }

    // ── events ─────────────────────────────────────────────────────────

    /// Queues `event` unless an identical one is already pending.
    pub(crate) fn push_event(&self, event: Event) -> bool {
        self.events.lock().push(event)
    }

    pub(crate) fn pop_event(&self) -> Option<Event> {
        self.events.lock().pop()
    }

    pub(crate) fn has_events(&self) -> bool {
        !self.events.lock().queue.is_empty()
    }

    // ── accounting ─────────────────────────────────────────────────────

    pub(crate) fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn touch(&self) {
        self.last_communication
            .fetch_max(self.now_ms(), Ordering::AcqRel);
    }

    pub(crate) fn record_read(&self, n: usize) {
        self.bytes_read.fetch_add(n as u64, Ordering::Relaxed);
        self.touch();
    }

    pub(crate) fn record_write(&self, n: usize) {
        self.bytes_written.fetch_add(n as u64, Ordering::Relaxed);
        self.touch();
    }

    /// Milliseconds since the epoch of the last successful read or write.
    pub fn last_communication_ms(&self) -> u64 {
        self.last_communication.load(Ordering::Acquire)
    }

    pub fn idle_for(&self) -> Duration {
        Duration::from_millis(self.now_ms().saturating_sub(self.last_communication_ms()))
    }

    pub fn bytes_read(&self) -> u64 {
        self.bytes_read.load(Ordering::Relaxed)
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.peer.lock()
    }

    pub fn info(&self) -> ConnectionInfo {
        let now = self.now_ms();
        ConnectionInfo {
            id: self.id(),
            peer: self.peer_addr(),
            connected_for: Duration::from_millis(
                now.saturating_sub(self.connected_at.load(Ordering::Acquire)),
            ),
            idle_for: Duration::from_millis(now.saturating_sub(self.last_communication_ms())),
            bytes_read: self.bytes_read(),
            bytes_written: self.bytes_written(),
        }
    }

    /// Wipes everything tied to the last client.
    fn clear(&self) {
        self.state.lock().clear();
        self.events.lock().clear();
        *self.channel.lock() = None;
        *self.interrupt.lock() = None;
        *self.peer.lock() = None;
        *self.pending_close.lock() = None;
        *self.woken.lock() = false;
        self.force_close.store(false, Ordering::Release);
        self.bytes_read.store(0, Ordering::Relaxed);
        self.bytes_written.store(0, Ordering::Relaxed);
    }
}

impl Poolable for Arc<Connection> {
    fn reset(&mut self) {
        self.clear();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("peer", &self.peer_addr())
            .field("holders", &self.holders())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Releases a hold taken with [`Connection::try_hold`] when dropped, so a
/// panicking job cannot leak the slot.
pub(crate) struct HoldGuard<'a> {
    conn: &'a Arc<Connection>,
    ctx: &'a ServerContext,
}

impl<'a> HoldGuard<'a> {
    /// Takes over a hold that was already counted.
    pub(crate) fn adopt(conn: &'a Arc<Connection>, ctx: &'a ServerContext) -> Self {
        Self { conn, ctx }
    }
}

impl Drop for HoldGuard<'_> {
    fn drop(&mut self) {
        self.conn.release(self.ctx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> Connection {
        Connection::new(3, Instant::now(), &ServerConfig::default())
    }

    #[test]
    fn test_event_queue_dedup() {
        let mut queue = EventQueue::default();
        assert!(queue.push(Event::Read));
        assert!(queue.push(Event::Write));
        assert!(!queue.push(Event::Read));

        assert_eq!(queue.pop(), Some(Event::Read));
        assert!(queue.push(Event::Read));
        assert_eq!(queue.pop(), Some(Event::Write));
        assert_eq!(queue.pop(), Some(Event::Read));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_bind_bumps_generation() {
        let conn = connection();
        assert!(conn.is_closed());

        let peer: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let first = conn.bind(peer, &ServerConfig::default(), None);
        assert_eq!(first, 1);
        assert!(!conn.is_closed());
        assert_eq!(conn.id().to_string(), "3.1");

        conn.mark_closed();
        let second = conn.bind(peer, &ServerConfig::default(), None);
        assert_eq!(second, 2);
        assert_eq!(conn.peer_addr(), Some(peer));
    }

    #[test]
    fn test_last_communication_is_monotonic() {
        let conn = connection();
        conn.last_communication.store(u64::MAX - 1, Ordering::Release);
        conn.record_read(10);
        assert_eq!(conn.last_communication_ms(), u64::MAX - 1);
        assert_eq!(conn.bytes_read(), 10);
    }

    #[test]
    fn test_pending_close_keeps_first_reason() {
        let conn = connection();
        conn.request_close(CloseReason::Timeout, false);
        conn.request_close(CloseReason::Shutdown, true);

        assert!(conn.is_force_closed());
        assert_eq!(conn.take_pending_close(), Some(CloseReason::Timeout));
        assert_eq!(conn.take_pending_close(), None);
    }
}
