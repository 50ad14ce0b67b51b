//! Event Loop / Acceptor
//!
//! One thread owns the listener and the `mio::Poll`. Each iteration:
//!
//! 1. applies interest requests queued by workers
//! 2. closes the listener once shutdown was requested
//! 3. handles readiness: accepts, READ and WRITE events
//! 4. exits once shutdown has drained every connection
//!
//! mio is edge-triggered, so the loop drops an interest bit when it hands
//! the matching event to a worker, and the worker asks for it again when
//! it is done. Re-registering makes the OS report readiness that built up
//! in between.

use super::access::Access;
use super::{dispatch, socket, Registration, ServerContext, ServerState};
use crate::connection::{blocking, Connection, Event};
use crate::error::CloseReason;
use crate::handler::ClientData;
use mio::event::Event as Readiness;
use mio::{Events, Interest, Poll, Token};
use std::collections::HashMap;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

pub(crate) const LISTENER: Token = Token(0);
pub(crate) const WAKER: Token = Token(1);

const POLL_TIMEOUT: Duration = Duration::from_millis(500);
/// Poll timeout while writes denied by the write gate wait for a retry
const RETRY_TIMEOUT: Duration = Duration::from_millis(10);

pub(crate) fn token_for(slot: usize) -> Token {
    Token(slot + 2)
}

/// A connection's channel as the loop tracks it.
struct Channel {
    conn: Arc<Connection>,
    generation: u64,
    /// Interest currently registered, None if not registered
    interest: Option<Interest>,
}

pub(crate) struct EventLoop {
    ctx: Arc<ServerContext>,
    poll: Poll,
    /// The listener accepts; the mio clone only reports readiness
    listener: Option<(TcpListener, mio::net::TcpListener)>,
    channels: HashMap<Token, Channel>,
    deferred_writes: Vec<Token>,
    stopping: bool,
    /// When connections still open after shutdown get forced closed
    force_at: Option<Instant>,
}

impl EventLoop {
    pub fn new(ctx: Arc<ServerContext>, poll: Poll, listener: TcpListener) -> io::Result<Self> {
        let mut evented = mio::net::TcpListener::from_std(listener.try_clone()?);
        poll.registry()
            .register(&mut evented, LISTENER, Interest::READABLE)?;
        Ok(Self {
            ctx,
            poll,
            listener: Some((listener, evented)),
            channels: HashMap::new(),
            deferred_writes: Vec::new(),
            stopping: false,
            force_at: None,
        })
    }

    pub fn run(mut self) {
        let mut events = Events::with_capacity(1024);
        info!(server = %self.ctx.config.name, "Event loop started");

        loop {
            self.apply_registrations();
            if self.ctx.state() == ServerState::ShuttingDown && !self.stopping {
                self.stop_accepting();
            }
            if self.stopping && self.ctx.registry.is_empty() && self.channels.is_empty() {
                break;
            }
            if self.force_at.is_some_and(|at| Instant::now() >= at) {
                self.force_at = None;
                self.force_remaining();
            }
            self.retry_deferred_writes();

            let timeout = if self.deferred_writes.is_empty() {
                POLL_TIMEOUT
            } else {
                RETRY_TIMEOUT
            };
            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "Poll failed, stopping event loop");
                break;
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER => self.accept_all(),
                    WAKER => {}
                    token => self.ready(token, event),
                }
            }
        }

        self.ctx.release_pools();
        info!(server = %self.ctx.config.name, "Event loop stopped");
    }

    // ── registrations ─────────────────────────────────────────────────

    fn apply_registrations(&mut self) {
        let mut merged: Vec<Registration> = Vec::new();
        for request in self.ctx.take_registrations() {
            match request {
                Registration::Interest {
                    token,
                    generation,
                    interest,
                } => {
                    let pending = merged.iter_mut().find_map(|r| match r {
                        Registration::Interest {
                            token: t,
                            generation: g,
                            interest: i,
                        } if *t == token && *g == generation => Some(i),
                        _ => None,
                    });
                    match pending {
                        Some(existing) => *existing = *existing | interest,
                        None => merged.push(Registration::Interest {
                            token,
                            generation,
                            interest,
                        }),
                    }
                }
                Registration::Cancel {
                    token,
                    generation,
                    stream,
                } => {
                    merged.retain(|r| {
                        !matches!(r, Registration::Interest { token: t, .. } if *t == token)
                    });
                    merged.push(Registration::Cancel {
                        token,
                        generation,
                        stream,
                    });
                }
            }
        }

        for request in merged {
            match request {
                Registration::Interest {
                    token,
                    generation,
                    interest,
                } => self.add_interest(token, generation, interest),
                Registration::Cancel {
                    token,
                    generation,
                    mut stream,
                } => {
                    if let Err(e) = self.poll.registry().deregister(&mut stream) {
                        trace!(error = %e, "Deregister of unregistered channel");
                    }
                    if self
                        .channels
                        .get(&token)
                        .is_some_and(|ch| ch.generation == generation)
                    {
                        self.channels.remove(&token);
                        self.deferred_writes.retain(|t| *t != token);
                    }
                    drop(stream);
                }
            }
        }
    }

    fn add_interest(&mut self, token: Token, generation: u64, interest: Interest) {
        let Some(channel) = self.channels.get_mut(&token) else {
            return;
        };
        if channel.generation != generation {
            return;
        }
        let wanted = channel.interest.map_or(interest, |current| current | interest);
        if channel.interest == Some(wanted) {
            return;
        }

        let result = match channel.conn.channel.lock().as_mut() {
            Some(stream) => match channel.interest {
                Some(_) => self.poll.registry().reregister(stream, token, wanted),
                None => self.poll.registry().register(stream, token, wanted),
            },
            None => return,
        };
        match result {
            Ok(()) => channel.interest = Some(wanted),
            Err(e) => {
                warn!(id = %channel.conn.id(), error = %e, "Interest registration failed");
                let conn = Arc::clone(&channel.conn);
                conn.request_close(CloseReason::Io, false);
                if conn.push_event(Event::Close) {
                    dispatch(&self.ctx, &conn, generation);
                }
            }
        }
    }

    /// Drops `flag` from the registered interest of `token`.
    fn clear_interest(&mut self, token: Token, flag: Interest) {
        let Some(channel) = self.channels.get_mut(&token) else {
            return;
        };
        let Some(current) = channel.interest else {
            return;
        };
        let remaining = current.remove(flag);
        if remaining == Some(current) {
            return;
        }

        if let Some(stream) = channel.conn.channel.lock().as_mut() {
            let result = match remaining {
                Some(interest) => self.poll.registry().reregister(stream, token, interest),
                None => self.poll.registry().deregister(stream),
            };
            if let Err(e) = result {
                debug!(id = %channel.conn.id(), error = %e, "Interest update failed");
            }
        }
        channel.interest = remaining;
    }

    // ── readiness ─────────────────────────────────────────────────────

    fn ready(&mut self, token: Token, event: &Readiness) {
        let Some(channel) = self.channels.get(&token) else {
            return;
        };
        let conn = Arc::clone(&channel.conn);
        let generation = channel.generation;

        if event.is_readable() || event.is_read_closed() || event.is_error() {
            self.clear_interest(token, Interest::READABLE);
            if conn.push_event(Event::Read) {
                dispatch(&self.ctx, &conn, generation);
            }
        }
        if event.is_writable() {
            self.offer_write(token, &conn, generation);
        }
    }

    fn offer_write(&mut self, token: Token, conn: &Arc<Connection>, generation: u64) {
        if !self.ctx.write_gate.permits() {
            if !self.deferred_writes.contains(&token) {
                trace!(id = %conn.id(), "Write deferred by the write gate");
                self.deferred_writes.push(token);
            }
            return;
        }
        self.clear_interest(token, Interest::WRITABLE);
        if conn.push_event(Event::Write) {
            dispatch(&self.ctx, conn, generation);
        }
    }

    fn retry_deferred_writes(&mut self) {
        for token in std::mem::take(&mut self.deferred_writes) {
            let Some(channel) = self.channels.get(&token) else {
                continue;
            };
            let conn = Arc::clone(&channel.conn);
            let generation = channel.generation;
            self.offer_write(token, &conn, generation);
        }
    }

    // ── accept ────────────────────────────────────────────────────────

    fn accept_all(&mut self) {
        loop {
            let accepted = match &self.listener {
                Some((listener, _)) => listener.accept(),
                None => return,
            };
            match accepted {
                Ok((stream, peer)) => self.admit(stream, peer),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // Usually descriptor exhaustion; the next readiness retries.
                    error!(error = %e, "Failed to accept connection");
                    return;
                }
            }
        }
    }

    fn admit(&mut self, stream: TcpStream, peer: SocketAddr) {
        let ctx = Arc::clone(&self.ctx);
        if ctx.is_shutting_down() {
            return;
        }
        trace!(client = %peer, "Accepted socket");
        socket::apply(&stream, &ctx.config.socket);

        let access = ctx.access.check(peer);
        if access == Access::Deny {
            info!(client = %peer, "Connection denied by access policy");
            ctx.stats.connection_rejected();
            return;
        }

        let conn = match ctx.connections.borrow() {
            Ok(conn) => conn,
            Err(e) => {
                warn!(client = %peer, error = %e, "No connection slot, closing socket");
                ctx.stats.connection_rejected();
                return;
            }
        };
        let data = match &ctx.client_data {
            Some(pool) => match pool.borrow() {
                Ok(data) => Some(data),
                Err(e) => {
                    warn!(client = %peer, error = %e, "No client data, closing socket");
                    ctx.connections.give_back(conn);
                    ctx.stats.connection_rejected();
                    return;
                }
            },
            None => None,
        };

        let over_limit = ctx
            .config
            .max_connections
            .is_some_and(|max| ctx.registry.len() >= max)
            && access != Access::Trusted;
        let event = if over_limit {
            Event::MaxConnection
        } else {
            Event::Accept
        };

        if ctx.is_blocking() {
            self.admit_blocking(conn, data, stream, peer, event);
        } else {
            self.admit_evented(conn, data, stream, peer, event);
        }
    }

    /// Records an accepted connection as live.
    fn register(&self, conn: &Arc<Connection>, generation: u64, event: Event) {
        if event == Event::Accept {
            self.ctx.registry.insert(Arc::clone(conn), generation);
            conn.state.lock().admitted = true;
            self.ctx.stats.connection_opened();
        } else {
            self.ctx.stats.connection_rejected();
        }
    }

    fn admit_evented(
        &mut self,
        conn: Arc<Connection>,
        data: Option<Box<dyn ClientData>>,
        stream: TcpStream,
        peer: SocketAddr,
        event: Event,
    ) {
        if let Err(e) = stream.set_nonblocking(true) {
            warn!(client = %peer, error = %e, "Could not make socket non-blocking");
            self.give_back(conn, data);
            return;
        }
        let generation = conn.bind(peer, &self.ctx.config, data);
        conn.set_channel(mio::net::TcpStream::from_std(stream));
        self.register(&conn, generation, event);

        self.channels.insert(
            token_for(conn.slot()),
            Channel {
                conn: Arc::clone(&conn),
                generation,
                interest: None,
            },
        );
        conn.push_event(event);
        dispatch(&self.ctx, &conn, generation);
    }

    fn admit_blocking(
        &mut self,
        conn: Arc<Connection>,
        data: Option<Box<dyn ClientData>>,
        stream: TcpStream,
        peer: SocketAddr,
        event: Event,
    ) {
        let Some(reservation) = self.ctx.workers.try_reserve() else {
            warn!(client = %peer, "No worker thread available, closing socket");
            self.give_back(conn, data);
            self.ctx.stats.connection_rejected();
            return;
        };
        if let Err(e) = stream.set_nonblocking(false) {
            warn!(client = %peer, error = %e, "Could not make socket blocking");
            self.give_back(conn, data);
            return;
        }

        let generation = conn.bind(peer, &self.ctx.config, data);
        conn.set_interrupt(stream.try_clone().ok());
        self.register(&conn, generation, event);

        let ctx = Arc::clone(&self.ctx);
        let worker_conn = Arc::clone(&conn);
        let started = reservation
            .execute(move || blocking::run(ctx, worker_conn, generation, stream, event));
        if let Err(e) = started {
            warn!(client = %peer, error = %e, "Could not start connection worker");
            self.ctx.abandon(&conn, generation);
        }
    }

    fn give_back(&self, conn: Arc<Connection>, data: Option<Box<dyn ClientData>>) {
        if let (Some(pool), Some(data)) = (&self.ctx.client_data, data) {
            pool.give_back(data);
        }
        self.ctx.connections.give_back(conn);
    }

    // ── shutdown ──────────────────────────────────────────────────────

    fn stop_accepting(&mut self) {
        self.stopping = true;
        if let Some((listener, mut evented)) = self.listener.take() {
            let _ = self.poll.registry().deregister(&mut evented);
            drop(evented);
            drop(listener);
        }
        self.ctx.set_state(ServerState::Stopped);
        info!(server = %self.ctx.config.name, "Listener closed");
        self.ctx.run_shutdown_hooks();

        let live = self.ctx.registry.snapshot_locked();
        info!(connections = live.len(), "Closing live connections");
        for (id, conn) in live {
            self.ctx
                .close_connection(&conn, id.generation, CloseReason::Shutdown);
        }
        self.force_at = Some(Instant::now() + self.ctx.config.close_drain_timeout());
    }

    /// Cuts off connections that did not finish closing within the drain
    /// timeout, such as a blocking worker stuck writing to a peer that
    /// stopped reading.
    fn force_remaining(&self) {
        let live = self.ctx.registry.snapshot_locked();
        if live.is_empty() {
            return;
        }
        warn!(connections = live.len(), "Close drain timed out, forcing close");
        for (id, conn) in live {
            if conn.generation() != id.generation || conn.is_closed() {
                continue;
            }
            conn.request_close(CloseReason::Shutdown, true);
            if self.ctx.is_blocking() {
                conn.interrupt(Shutdown::Both);
            } else {
                conn.wake();
            }
        }
    }
}
