//! Listener setup and per-connection socket options.

use crate::config::SocketOptions;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::Duration;
use tracing::warn;

/// Binds a non-blocking listener with the given backlog.
pub(crate) fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    socket.set_nonblocking(true)?;
    Ok(socket.into())
}

/// Applies the configured options to an accepted socket. Failures are
/// logged; the connection proceeds with OS defaults.
pub(crate) fn apply(stream: &TcpStream, options: &SocketOptions) {
    let sock = SockRef::from(stream);
    if let Err(e) = sock.set_nodelay(options.no_delay) {
        warn!(error = %e, "Failed to set TCP_NODELAY");
    }
    if let Some(secs) = options.linger_secs {
        if let Err(e) = sock.set_linger(Some(Duration::from_secs(secs))) {
            warn!(error = %e, "Failed to set SO_LINGER");
        }
    }
    if let Some(tos) = options.traffic_class {
        if let Err(e) = sock.set_tos(tos) {
            warn!(error = %e, "Failed to set traffic class");
        }
    }
    if let Some(size) = options.send_buffer_size {
        if let Err(e) = sock.set_send_buffer_size(size) {
            warn!(error = %e, "Failed to set send buffer size");
        }
    }
    if let Some(size) = options.recv_buffer_size {
        if let Err(e) = sock.set_recv_buffer_size(size) {
            warn!(error = %e, "Failed to set receive buffer size");
        }
    }
}
