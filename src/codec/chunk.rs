//! RAW_BYTES and BINARY Decoders
//!
//! These modes leave chunk boundaries to the application: whatever bytes
//! arrived since the last frame form the next frame. RAW_BYTES maps each
//! byte to the char with the same code point (Latin-1), which keeps the
//! conversion lossless in both directions.

use super::{DataMode, Frame};
use bytes::BytesMut;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkKind {
    Raw,
    Binary,
}

/// Pass-through decoder for RAW_BYTES and BINARY.
#[derive(Debug)]
pub struct ChunkDecoder {
    buf: BytesMut,
    kind: ChunkKind,
}

impl ChunkDecoder {
    pub fn raw() -> Self {
        Self {
            buf: BytesMut::new(),
            kind: ChunkKind::Raw,
        }
    }

    pub fn binary() -> Self {
        Self {
            buf: BytesMut::new(),
            kind: ChunkKind::Binary,
        }
    }

    pub fn mode(&self) -> DataMode {
        match self.kind {
            ChunkKind::Raw => DataMode::RawBytes,
            ChunkKind::Binary => DataMode::Binary,
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn next_frame(&mut self) -> Option<Frame> {
        if self.buf.is_empty() {
            return None;
        }
        let chunk = self.buf.split();
        Some(match self.kind {
            ChunkKind::Raw => Frame::Raw(latin1(&chunk)),
            ChunkKind::Binary => Frame::Binary(chunk.freeze()),
        })
    }

    pub fn take_pending(&mut self) -> BytesMut {
        self.buf.split()
    }

    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }
}

/// Maps bytes to chars one to one.
pub fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Inverse of [`latin1`]. Chars above U+00FF are replaced by `?`.
pub fn latin1_bytes(s: &str) -> Vec<u8> {
    s.chars()
        .map(|c| u8::try_from(u32::from(c)).unwrap_or(b'?'))
        .collect()
}
