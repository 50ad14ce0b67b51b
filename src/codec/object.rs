//! OBJECT Framing
//!
//! ```text
//! ┌──────────────────────┐┌──────────┬─────────────┐┌──────────┬─────────────┐
//! │ "BOBJ" 0x01 (header) ││ len: u32 │ JSON bytes  ││ len: u32 │ JSON bytes  │ ...
//! └──────────────────────┘└──────────┴─────────────┘└──────────┴─────────────┘
//! ```
//!
//! The header is written once per stream, when the output mode switches to
//! OBJECT. A decoder cannot produce anything until it has seen it.

use super::{CodecError, Frame};
use bytes::{Buf, BufMut, BytesMut};

/// Magic and version that open every OBJECT stream.
pub const OBJECT_STREAM_HEADER: [u8; 5] = *b"BOBJ\x01";

const LEN_PREFIX: usize = 4;

/// Incremental OBJECT decoder.
#[derive(Debug)]
pub struct ObjectDecoder {
    buf: BytesMut,
    header_seen: bool,
    max_size: usize,
}

impl ObjectDecoder {
    pub fn new(max_size: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            header_seen: false,
            max_size,
        }
    }

    pub fn header_seen(&self) -> bool {
        self.header_seen
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn next_frame(&mut self) -> Result<Option<Frame>, CodecError> {
        if !self.header_seen {
            if self.buf.len() < OBJECT_STREAM_HEADER.len() {
                if !OBJECT_STREAM_HEADER.starts_with(&self.buf) {
                    return Err(CodecError::BadObjectHeader);
                }
                return Ok(None);
            }
            if self.buf[..OBJECT_STREAM_HEADER.len()] != OBJECT_STREAM_HEADER {
                return Err(CodecError::BadObjectHeader);
            }
            self.buf.advance(OBJECT_STREAM_HEADER.len());
            self.header_seen = true;
        }

        if self.buf.len() < LEN_PREFIX {
            return Ok(None);
        }
        let size = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
        if size > self.max_size {
            return Err(CodecError::ObjectTooLarge {
                size,
                max: self.max_size,
            });
        }
        if self.buf.len() < LEN_PREFIX + size {
            self.buf.reserve(LEN_PREFIX + size - self.buf.len());
            return Ok(None);
        }

        self.buf.advance(LEN_PREFIX);
        let payload = self.buf.split_to(size);
        let value = serde_json::from_slice(&payload)?;
        Ok(Some(Frame::Object(value)))
    }

    /// Returns the unframed bytes. If the header was already consumed it is
    /// not put back: the stream it opened ends with this decoder.
    pub fn take_pending(&mut self) -> BytesMut {
        self.buf.split()
    }

    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }
}

/// Appends one length-prefixed frame for `value`.
pub fn encode(value: &serde_json::Value, dst: &mut BytesMut) -> Result<(), CodecError> {
    let payload = serde_json::to_vec(value)?;
    dst.reserve(LEN_PREFIX + payload.len());
    dst.put_u32(payload.len() as u32);
    dst.put_slice(&payload);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_frames_after_header() {
        let mut wire = BytesMut::from(&OBJECT_STREAM_HEADER[..]);
        encode(&json!({"op": "login", "user": "ariz"}), &mut wire).unwrap();
        encode(&json!([1, 2, 3]), &mut wire).unwrap();

        let mut d = ObjectDecoder::new(1024);
        d.feed(&wire);

        assert_eq!(
            d.next_frame().unwrap(),
            Some(Frame::Object(json!({"op": "login", "user": "ariz"})))
        );
        assert_eq!(d.next_frame().unwrap(), Some(Frame::Object(json!([1, 2, 3]))));
        assert_eq!(d.next_frame().unwrap(), None);
    }

    #[test]
    fn test_split_frame() {
        let mut wire = BytesMut::from(&OBJECT_STREAM_HEADER[..]);
        encode(&json!("a somewhat longer string value"), &mut wire).unwrap();

        let mut d = ObjectDecoder::new(1024);
        let (a, b) = wire.split_at(9);
        d.feed(a);
        assert_eq!(d.next_frame().unwrap(), None);
        assert!(d.header_seen());

        d.feed(b);
        assert_eq!(
            d.next_frame().unwrap(),
            Some(Frame::Object(json!("a somewhat longer string value")))
        );
    }

    #[test]
    fn test_bad_header() {
        let mut d = ObjectDecoder::new(1024);
        d.feed(b"HELLO\r\n");
        assert!(matches!(d.next_frame(), Err(CodecError::BadObjectHeader)));

        let mut d = ObjectDecoder::new(1024);
        d.feed(b"BX");
        assert!(matches!(d.next_frame(), Err(CodecError::BadObjectHeader)));
    }

    #[test]
    fn test_too_large() {
        let mut d = ObjectDecoder::new(4);
        d.feed(&OBJECT_STREAM_HEADER);
        d.feed(&100u32.to_be_bytes());
        assert!(matches!(
            d.next_frame(),
            Err(CodecError::ObjectTooLarge { size: 100, max: 4 })
        ));
    }
}
