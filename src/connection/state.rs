//! Per-connection protocol state, guarded by the connection's state lock.

use crate::codec::{DataMode, DataModes, Decoder, Encoder};
use crate::config::Limits;
use crate::error::CloseReason;
use crate::handler::ClientData;
use crate::pool::{BufferPool, PooledBuffer};
use crate::tls::{RecordSink, TlsAdapter, TlsError};
use bytes::{BufMut, BytesMut};
use std::collections::VecDeque;
use std::io;
use tracing::warn;

/// Authentication progress of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    /// The client was prompted and the authenticator is judging frames
    Pending,
    Authenticated,
}

pub(crate) struct ConnectionState {
    pub decoder: Decoder,
    pub encoder: Encoder,
    pub auth: AuthState,
    pub auth_attempts: u32,
    /// Bytes read but not yet decoded (ciphertext while secure)
    pub raw_in: BytesMut,
    /// Outbound chain, written front to back
    pub outbound: VecDeque<PooledBuffer>,
    pub tls: Option<TlsAdapter>,
    pub client_data: Option<Box<dyn ClientData>>,
    /// on_connect and the auth prompt have run
    pub greeted: bool,
    /// on_connect succeeded, so the lifecycle callback is owed
    pub announced: bool,
    /// Counted in the registry and the active-connection stats
    pub admitted: bool,
    pub closing: bool,
    /// The OBJECT header (if any) for the current encoder was queued
    pub output_started: bool,
    pub upgrade_requested: bool,
    pub close_requested: Option<CloseReason>,
    limits: Limits,
}

impl ConnectionState {
    pub fn new(modes: DataModes, limits: Limits) -> Self {
        Self {
            decoder: Decoder::new(modes.input, &limits),
            encoder: Encoder::new(modes.output),
            auth: AuthState::Unauthenticated,
            auth_attempts: 0,
            raw_in: BytesMut::new(),
            outbound: VecDeque::new(),
            tls: None,
            client_data: None,
            greeted: false,
            announced: false,
            admitted: false,
            closing: false,
            output_started: false,
            upgrade_requested: false,
            close_requested: None,
            limits,
        }
    }

    /// Readies the state for a new client.
    pub fn prepare(&mut self, modes: DataModes, client_data: Option<Box<dyn ClientData>>) {
        self.clear();
        self.decoder = Decoder::new(modes.input, &self.limits);
        self.encoder = Encoder::new(modes.output);
        self.client_data = client_data;
    }

    /// Drops everything tied to the last client. Pooled buffers go back to
    /// their pool here.
    pub fn clear(&mut self) {
        self.decoder.take_pending();
        self.auth = AuthState::Unauthenticated;
        self.auth_attempts = 0;
        self.raw_in.clear();
        self.outbound.clear();
        self.tls = None;
        self.client_data = None;
        self.greeted = false;
        self.announced = false;
        self.admitted = false;
        self.closing = false;
        self.output_started = false;
        self.upgrade_requested = false;
        self.close_requested = None;
    }

    pub fn is_secure(&self) -> bool {
        self.tls.is_some()
    }

    /// Replaces the inbound decoder. Bytes the old decoder had not framed
    /// are moved to the new one. Returns how many were carried over.
    pub fn set_input_mode(&mut self, mode: DataMode) -> usize {
        let previous = self.decoder.mode();
        let pending = self.decoder.take_pending();
        if !pending.is_empty() {
            warn!(
                from = %previous,
                to = %mode,
                bytes = pending.len(),
                "Carrying undecoded bytes across data mode switch"
            );
        }
        self.decoder = Decoder::new(mode, &self.limits);
        self.decoder.feed(&pending);
        pending.len()
    }

    /// Replaces the outbound encoder. Its preamble goes out with the next
    /// send.
    pub fn set_output_mode(&mut self, mode: DataMode) {
        self.encoder = Encoder::new(mode);
        self.output_started = false;
    }

    /// Appends a plaintext buffer to the outbound chain, encrypting it
    /// first while secure.
    pub fn queue(&mut self, buf: PooledBuffer, buffers: &BufferPool) -> Result<(), TlsError> {
        match self.tls.as_mut() {
            Some(tls) => {
                let mut sink = QueueSink {
                    outbound: &mut self.outbound,
                    buffers,
                };
                tls.wrap(&buf, &mut sink)
            }
            None => {
                if !buf.is_empty() {
                    self.outbound.push_back(buf);
                }
                Ok(())
            }
        }
    }

    /// Queues the current encoder's preamble once.
    pub fn start_output(&mut self, buffers: &BufferPool) -> Result<(), TlsError> {
        if self.output_started {
            return Ok(());
        }
        self.output_started = true;
        if let Some(preamble) = self.encoder.preamble() {
            let mut buf = buffers.borrow();
            buf.put_slice(preamble);
            self.queue(buf, buffers)?;
        }
        Ok(())
    }
}

/// A sink that only appends to the outbound chain. Writing happens later,
/// when the driver flushes.
struct QueueSink<'a> {
    outbound: &'a mut VecDeque<PooledBuffer>,
    buffers: &'a BufferPool,
}

impl RecordSink for QueueSink<'_> {
    fn buffer(&mut self) -> PooledBuffer {
        self.buffers.borrow()
    }

    fn enqueue(&mut self, records: PooledBuffer) {
        self.outbound.push_back(records);
    }

    fn flush(&mut self) -> io::Result<bool> {
        Ok(self.outbound.is_empty())
    }
}
