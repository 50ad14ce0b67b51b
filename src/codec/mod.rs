//! Data Mode Codecs
//!
//! Every connection has two independent *data modes*, one per direction.
//! The mode decides how raw bytes are cut into frames on the way in and how
//! values are serialized on the way out.
//!
//! ## Modes
//!
//! | Mode        | Inbound frame                 | Wire format                               |
//! |-------------|-------------------------------|-------------------------------------------|
//! | `Line`      | `Frame::Line(String)`         | text terminated by LF (CR stripped), CRLF on output |
//! | `Object`    | `Frame::Object(Value)`        | stream header, then u32 length + JSON     |
//! | `RawBytes`  | `Frame::Raw(String)`          | whatever arrived, as a Latin-1 string     |
//! | `Binary`    | `Frame::Binary(Bytes)`        | whatever arrived, untouched               |
//!
//! ## Switching
//!
//! Switching a direction throws the old decoder (or encoder) away and builds
//! a fresh one. Bytes the old decoder had buffered but not yet framed are
//! handed to the new decoder, with a warning, so nothing is lost silently.

pub mod chunk;
pub mod line;
pub mod object;

pub use chunk::ChunkDecoder;
pub use line::LineDecoder;
pub use object::{ObjectDecoder, OBJECT_STREAM_HEADER};

use crate::config::Limits;
use bytes::{BufMut, Bytes, BytesMut};
use serde::Deserialize;
use std::fmt;
use thiserror::Error;

/// Line terminator written after every outbound LINE frame.
pub const CRLF: &[u8] = b"\r\n";

/// Errors raised while framing or serializing.
#[derive(Debug, Error)]
pub enum CodecError {
    /// A LINE frame grew past the configured limit without a terminator
    #[error("line too long: {len} bytes (max: {max})")]
    LineTooLong { len: usize, max: usize },

    /// The OBJECT stream did not start with the expected header
    #[error("bad object stream header")]
    BadObjectHeader,

    /// An OBJECT frame exceeds the configured limit
    #[error("object too large: {size} bytes (max: {max})")]
    ObjectTooLarge { size: usize, max: usize },

    /// The OBJECT payload is not valid JSON
    #[error("invalid object payload: {0}")]
    Json(#[from] serde_json::Error),

    /// A send was attempted in a mode that does not carry that kind of value
    #[error("cannot send {attempted} while the output mode is {active}")]
    ModeMismatch {
        attempted: &'static str,
        active: DataMode,
    },
}

/// Framing discipline of one direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum DataMode {
    /// CRLF-terminated text
    #[default]
    Line,
    /// Header-framed serialized values
    Object,
    /// Handler-defined chunks delivered as text
    RawBytes,
    /// Handler-defined binary chunks
    Binary,
}

impl fmt::Display for DataMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DataMode::Line => "LINE",
            DataMode::Object => "OBJECT",
            DataMode::RawBytes => "RAW_BYTES",
            DataMode::Binary => "BINARY",
        };
        f.write_str(s)
    }
}

/// Which side of the connection a data mode applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

/// The pair of data modes of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct DataModes {
    pub input: DataMode,
    pub output: DataMode,
}

/// One decoded unit of inbound data.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Line(String),
    Object(serde_json::Value),
    Raw(String),
    Binary(Bytes),
}

impl Frame {
    /// The text of a `Line` or `Raw` frame.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Frame::Line(s) | Frame::Raw(s) => Some(s),
            _ => None,
        }
    }

    /// Size of the frame's payload in bytes.
    pub fn len(&self) -> usize {
        match self {
            Frame::Line(s) | Frame::Raw(s) => s.len(),
            Frame::Object(v) => v.to_string().len(),
            Frame::Binary(b) => b.len(),
        }
    }

    /// True for an empty payload.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The active inbound decoder of a connection.
#[derive(Debug)]
pub enum Decoder {
    Line(LineDecoder),
    Object(ObjectDecoder),
    Chunk(ChunkDecoder),
}

impl Decoder {
    /// Builds the decoder for `mode`.
    pub fn new(mode: DataMode, limits: &Limits) -> Self {
        match mode {
            DataMode::Line => Decoder::Line(LineDecoder::new(limits.max_line_length)),
            DataMode::Object => Decoder::Object(ObjectDecoder::new(limits.max_object_size)),
            DataMode::RawBytes => Decoder::Chunk(ChunkDecoder::raw()),
            DataMode::Binary => Decoder::Chunk(ChunkDecoder::binary()),
        }
    }

    /// The mode this decoder implements.
    pub fn mode(&self) -> DataMode {
        match self {
            Decoder::Line(_) => DataMode::Line,
            Decoder::Object(_) => DataMode::Object,
            Decoder::Chunk(c) => c.mode(),
        }
    }

    /// Appends raw bytes.
    pub fn feed(&mut self, data: &[u8]) {
        match self {
            Decoder::Line(d) => d.feed(data),
            Decoder::Object(d) => d.feed(data),
            Decoder::Chunk(d) => d.feed(data),
        }
    }

    /// Pops the next complete frame, if any.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, CodecError> {
        match self {
            Decoder::Line(d) => d.next_frame(),
            Decoder::Object(d) => d.next_frame(),
            Decoder::Chunk(d) => Ok(d.next_frame()),
        }
    }

    /// Removes and returns the bytes not yet turned into frames.
    pub fn take_pending(&mut self) -> BytesMut {
        match self {
            Decoder::Line(d) => d.take_pending(),
            Decoder::Object(d) => d.take_pending(),
            Decoder::Chunk(d) => d.take_pending(),
        }
    }

    /// Bytes buffered but not yet framed.
    pub fn pending_len(&self) -> usize {
        match self {
            Decoder::Line(d) => d.pending_len(),
            Decoder::Object(d) => d.pending_len(),
            Decoder::Chunk(d) => d.pending_len(),
        }
    }

    /// True while an OBJECT decoder still waits for the stream header.
    pub fn awaiting_header(&self) -> bool {
        matches!(self, Decoder::Object(d) if !d.header_seen())
    }
}

/// The active outbound encoder of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Encoder {
    mode: DataMode,
}

impl Encoder {
    pub fn new(mode: DataMode) -> Self {
        Self { mode }
    }

    pub fn mode(&self) -> DataMode {
        self.mode
    }

    /// Bytes that must precede the first frame of this encoder.
    pub fn preamble(&self) -> Option<&'static [u8]> {
        (self.mode == DataMode::Object).then_some(&OBJECT_STREAM_HEADER[..])
    }

    /// Serializes a LINE frame.
    pub fn encode_line(&self, line: &str, dst: &mut BytesMut) -> Result<(), CodecError> {
        self.expect(DataMode::Line, "a line")?;
        dst.reserve(line.len() + CRLF.len());
        dst.put_slice(line.as_bytes());
        dst.put_slice(CRLF);
        Ok(())
    }

    /// Serializes an OBJECT frame.
    pub fn encode_object(
        &self,
        value: &serde_json::Value,
        dst: &mut BytesMut,
    ) -> Result<(), CodecError> {
        self.expect(DataMode::Object, "an object")?;
        object::encode(value, dst)
    }

    /// Copies a RAW_BYTES or BINARY chunk.
    pub fn encode_bytes(&self, data: &[u8], dst: &mut BytesMut) -> Result<(), CodecError> {
        match self.mode {
            DataMode::RawBytes | DataMode::Binary => {
                dst.put_slice(data);
                Ok(())
            }
            active => Err(CodecError::ModeMismatch {
                attempted: "bytes",
                active,
            }),
        }
    }

    /// Serializes a server notice (busy, timeout, max-auth messages) in
    /// whatever form the current output mode carries text.
    pub fn encode_notice(&self, msg: &str, dst: &mut BytesMut) -> Result<(), CodecError> {
        match self.mode {
            DataMode::Object => object::encode(&serde_json::Value::String(msg.to_string()), dst),
            _ => {
                dst.put_slice(msg.as_bytes());
                dst.put_slice(CRLF);
                Ok(())
            }
        }
    }

    fn expect(&self, mode: DataMode, attempted: &'static str) -> Result<(), CodecError> {
        if self.mode == mode {
            Ok(())
        } else {
            Err(CodecError::ModeMismatch {
                attempted,
                active: self.mode,
            })
        }
    }
}
