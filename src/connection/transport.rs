//! Socket access for the two personalities.
//!
//! The protocol and close code is written once against [`Transport`]; the
//! event-driven flavour goes through the connection's channel lock and
//! never blocks, the blocking flavour owns its `std` stream outright.

use super::Connection;
use crate::server::ServerContext;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::time::Duration;
use tracing::trace;

const MIN_WRITE_TIMEOUT: Duration = Duration::from_millis(1);

pub(crate) trait Transport {
    /// Reads into `buf`. `Ok(0)` is end of stream.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Parks the caller until the socket may accept more data, or
    /// `timeout` passes.
    fn wait_writable(&self, timeout: Duration);

    /// Caps how long a single write may block. Non-blocking sockets
    /// ignore it.
    fn limit_writes(&self, _timeout: Duration) {}

    /// Cancels readiness registration and closes the socket.
    fn close(&self);
}

/// Non-blocking access through the connection's channel.
pub(crate) struct EventedTransport<'a> {
    ctx: &'a ServerContext,
    conn: &'a Connection,
}

impl<'a> EventedTransport<'a> {
    pub fn new(ctx: &'a ServerContext, conn: &'a Connection) -> Self {
        Self { ctx, conn }
    }
}

fn not_connected() -> io::Error {
    io::Error::from(io::ErrorKind::NotConnected)
}

impl Transport for EventedTransport<'_> {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self.conn.channel.lock().as_ref() {
            Some(mut stream) => stream.read(buf),
            None => Err(not_connected()),
        }
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        match self.conn.channel.lock().as_ref() {
            Some(mut stream) => stream.write(buf),
            None => Err(not_connected()),
        }
    }

    fn wait_writable(&self, timeout: Duration) {
        self.conn.wait_for_wakeup(timeout);
    }

    fn close(&self) {
        let stream = self.conn.channel.lock().take();
        if let Some(stream) = stream {
            // The loop owns the registration, so it deregisters and drops.
            self.ctx
                .cancel_registration(self.conn, self.conn.generation(), stream);
        }
    }
}

/// A socket owned by one worker thread for the connection's whole life.
pub(crate) struct BlockingTransport {
    stream: TcpStream,
}

impl BlockingTransport {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.stream.set_read_timeout(timeout)
    }
}

impl Transport for BlockingTransport {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.stream).read(buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        (&self.stream).write(buf)
    }

    fn wait_writable(&self, _timeout: Duration) {}

    fn limit_writes(&self, timeout: Duration) {
        // A zero timeout means "block forever" to the OS.
        let timeout = timeout.max(MIN_WRITE_TIMEOUT);
        if let Err(e) = self.stream.set_write_timeout(Some(timeout)) {
            trace!(error = %e, "Could not set write timeout");
        }
    }

    fn close(&self) {
        let _ = self.stream.shutdown(Shutdown::Both);
    }
}

/// True for the error kinds a socket read timeout produces.
pub(crate) fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
