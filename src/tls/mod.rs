//! TLS Record Adapter
//!
//! Drives a `rustls::ServerConnection` without letting it own the socket.
//! Ciphertext arrives in the connection's inbound buffer, records leave
//! through a [`RecordSink`] that appends pooled buffers to the outbound
//! chain, and the driver decides when bytes actually hit the wire.
//!
//! ## Handshake State Machine
//!
//! ```text
//!                ┌────────────┐ records pending ┌────────────┐
//!      ┌────────>│ NEED_UNWRAP│<────────────────│ NEED_WRAP  │──> write, NeedWrite if not drained
//!      │         └─────┬──────┘                 └────────────┘
//!      │    ciphertext │                              ▲
//!      │      fed      ▼                              │
//!      │         ┌────────────┐   more to send        │
//!      └─────────│ NEED_TASK  │───────────────────────┘
//!                └─────┬──────┘
//!                      │ handshake done
//!                      ▼
//!                ┌────────────┐      ┌─────────────────┐
//!                │  FINISHED  │─────>│ NOT_HANDSHAKING │
//!                └────────────┘      └─────────────────┘
//! ```
//!
//! [`TlsAdapter::advance`] is the only entry point for handshake progress;
//! the accept, read and write paths all call it.

pub mod config;

pub use config::{load_server_config, server_config};

use crate::pool::PooledBuffer;
use bytes::{Buf, BufMut, BytesMut};
use rustls::ServerConnection;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::trace;

/// TLS failures. All of them are fatal to the connection.
#[derive(Debug, Error)]
pub enum TlsError {
    /// rustls rejected the peer's records or our configuration
    #[error("{0}")]
    Rustls(#[from] rustls::Error),

    /// Reading or writing the record layer failed
    #[error("record I/O failed: {0}")]
    Io(#[from] io::Error),

    /// Application data cannot be wrapped before the handshake is finished
    #[error("handshake not finished")]
    HandshakeIncomplete,

    /// The certificate file held no certificates
    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    /// The key file held no private key
    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),
}

/// Where the handshake stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// Handshake records are waiting to be sent
    NeedWrap,
    /// More records from the peer are needed
    NeedUnwrap,
    /// Ciphertext was fed but not processed yet
    NeedTask,
    /// The handshake has just completed
    Finished,
    /// No handshake in progress
    NotHandshaking,
}

/// Outcome of [`TlsAdapter::advance`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// Waiting for the peer
    NeedRead,
    /// Records are queued but the socket would block
    NeedWrite,
    /// The handshake is done
    Complete,
}

/// Outcome of [`TlsAdapter::unwrap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unwrapped {
    /// Application bytes appended to the plaintext buffer
    Data(usize),
    /// The peer sent close_notify. Bytes decrypted before it were appended.
    Closed(usize),
}

/// The outbound side the adapter writes records to.
pub trait RecordSink {
    /// Borrows an empty buffer to write records into.
    fn buffer(&mut self) -> PooledBuffer;

    /// Appends a filled buffer to the outbound chain.
    fn enqueue(&mut self, records: PooledBuffer);

    /// Writes as much of the outbound chain as the transport accepts.
    /// Returns true once the chain is empty.
    fn flush(&mut self) -> io::Result<bool>;
}

/// Handshake and record processing for one connection.
#[derive(Debug)]
pub struct TlsAdapter {
    conn: ServerConnection,
    /// Ciphertext handed to rustls but not yet processed
    unprocessed: bool,
    /// Handshake completion not yet reported by `handshake_status`
    just_finished: bool,
    finished: bool,
    peer_closed: bool,
}

impl TlsAdapter {
    pub fn new(config: Arc<rustls::ServerConfig>) -> Result<Self, TlsError> {
        let mut conn = ServerConnection::new(config)?;
        // Plaintext is bounded by the outbound chain, not by rustls.
        conn.set_buffer_limit(None);
        Ok(Self {
            conn,
            unprocessed: false,
            just_finished: false,
            finished: false,
            peer_closed: false,
        })
    }

    pub fn handshake_status(&self) -> HandshakeStatus {
        if self.just_finished {
            return HandshakeStatus::Finished;
        }
        if !self.conn.is_handshaking() {
            return HandshakeStatus::NotHandshaking;
        }
        if self.conn.wants_write() {
            HandshakeStatus::NeedWrap
        } else if self.unprocessed {
            HandshakeStatus::NeedTask
        } else {
            HandshakeStatus::NeedUnwrap
        }
    }

    pub fn is_handshake_complete(&self) -> bool {
        self.finished
    }

    /// True once the peer's close_notify was processed.
    pub fn peer_has_closed(&self) -> bool {
        self.peer_closed
    }

    /// Pushes the handshake as far as the buffered ciphertext and the
    /// sink allow.
    pub fn advance(
        &mut self,
        inbound: &mut BytesMut,
        sink: &mut dyn RecordSink,
    ) -> Result<Advance, TlsError> {
        loop {
            let fed = self.feed(inbound)?;
            match self.handshake_status() {
                HandshakeStatus::NeedTask => self.run_task()?,
                HandshakeStatus::NeedWrap => {
                    self.write_records(sink)?;
                    if !sink.flush()? {
                        return Ok(Advance::NeedWrite);
                    }
                }
                HandshakeStatus::NeedUnwrap => {
                    if inbound.is_empty() || fed == 0 {
                        return Ok(Advance::NeedRead);
                    }
                }
                HandshakeStatus::Finished => {
                    self.just_finished = false;
                    trace!(
                        version = ?self.conn.protocol_version(),
                        "TLS handshake finished"
                    );
                }
                HandshakeStatus::NotHandshaking => {
                    // Session tickets and the like follow the handshake.
                    if self.conn.wants_write() {
                        self.write_records(sink)?;
                        if !sink.flush()? {
                            return Ok(Advance::NeedWrite);
                        }
                    }
                    return Ok(Advance::Complete);
                }
            }
        }
    }

    /// Decrypts buffered ciphertext into `plain`.
    pub fn unwrap(
        &mut self,
        inbound: &mut BytesMut,
        plain: &mut BytesMut,
    ) -> Result<Unwrapped, TlsError> {
        if !self.finished {
            return Err(TlsError::HandshakeIncomplete);
        }

        let mut produced = self.drain_plaintext(plain)?;
        while !self.peer_closed && !inbound.is_empty() {
            if self.feed(inbound)? == 0 {
                break;
            }
            self.run_task()?;
            produced += self.drain_plaintext(plain)?;
        }

        if self.peer_closed {
            Ok(Unwrapped::Closed(produced))
        } else {
            Ok(Unwrapped::Data(produced))
        }
    }

    /// Encrypts `plain` into records on the sink. Refused until the
    /// handshake has finished.
    pub fn wrap(&mut self, plain: &[u8], sink: &mut dyn RecordSink) -> Result<(), TlsError> {
        if !self.finished {
            return Err(TlsError::HandshakeIncomplete);
        }
        self.conn.writer().write_all(plain)?;
        self.write_records(sink)
    }

    /// Queues close_notify.
    pub fn close_outbound(&mut self, sink: &mut dyn RecordSink) -> Result<(), TlsError> {
        self.conn.send_close_notify();
        self.write_records(sink)
    }

    /// Moves any records rustls has pending onto the sink.
    pub fn write_records(&mut self, sink: &mut dyn RecordSink) -> Result<(), TlsError> {
        while self.conn.wants_write() {
            let mut buf = sink.buffer();
            buf.clear();
            let written = {
                let mut writer = (&mut *buf).writer();
                self.conn.write_tls(&mut writer)?
            };
            if written == 0 {
                break;
            }
            sink.enqueue(buf);
        }
        Ok(())
    }

    /// Hands as much buffered ciphertext to rustls as it takes.
    fn feed(&mut self, inbound: &mut BytesMut) -> Result<usize, TlsError> {
        let mut total = 0;
        while !inbound.is_empty() {
            let mut reader: &[u8] = &inbound[..];
            let n = match self.conn.read_tls(&mut reader) {
                Ok(n) => n,
                // rustls buffers are full until the next task runs
                Err(_) if total > 0 || self.unprocessed => break,
                Err(e) => return Err(TlsError::Io(e)),
            };
            if n == 0 {
                break;
            }
            inbound.advance(n);
            total += n;
            self.unprocessed = true;
        }
        Ok(total)
    }

    /// Processes fed ciphertext. This is the synchronous crypto task.
    fn run_task(&mut self) -> Result<(), TlsError> {
        let was_handshaking = self.conn.is_handshaking();
        self.unprocessed = false;
        let state = self.conn.process_new_packets()?;
        if state.peer_has_closed() {
            self.peer_closed = true;
        }
        if was_handshaking && !self.conn.is_handshaking() {
            self.finished = true;
            self.just_finished = true;
        }
        Ok(())
    }

    fn drain_plaintext(&mut self, plain: &mut BytesMut) -> Result<usize, TlsError> {
        let mut chunk = [0u8; 4096];
        let mut total = 0;
        loop {
            match self.conn.reader().read(&mut chunk) {
                Ok(0) => {
                    self.peer_closed = true;
                    break;
                }
                Ok(n) => {
                    plain.put_slice(&chunk[..n]);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    self.peer_closed = true;
                    break;
                }
                Err(e) => return Err(TlsError::Io(e)),
            }
        }
        Ok(total)
    }
}
