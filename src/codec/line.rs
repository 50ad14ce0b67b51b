//! LINE Decoder
//!
//! Cuts the inbound byte stream at LF. A CR right before the LF is stripped,
//! so both `\r\n` and bare `\n` terminated clients work. Lines are decoded as
//! UTF-8; invalid sequences are replaced rather than rejected.

use super::{CodecError, Frame};
use bytes::BytesMut;

/// Incremental LINE decoder.
#[derive(Debug)]
pub struct LineDecoder {
    buf: BytesMut,
    max_len: usize,
    /// Where the LF search resumes, so partial lines are not rescanned
    scanned: usize,
}

impl LineDecoder {
    pub fn new(max_len: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            max_len,
            scanned: 0,
        }
    }

    pub fn feed(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn next_frame(&mut self) -> Result<Option<Frame>, CodecError> {
        let Some(offset) = self.buf[self.scanned..].iter().position(|&b| b == b'\n') else {
            self.scanned = self.buf.len();
            if self.buf.len() > self.max_len {
                return Err(CodecError::LineTooLong {
                    len: self.buf.len(),
                    max: self.max_len,
                });
            }
            return Ok(None);
        };

        let end = self.scanned + offset;
        self.scanned = 0;

        let mut line = self.buf.split_to(end + 1);
        line.truncate(end);
        if line.last() == Some(&b'\r') {
            line.truncate(end - 1);
        }
        if line.len() > self.max_len {
            return Err(CodecError::LineTooLong {
                len: line.len(),
                max: self.max_len,
            });
        }

        let text = match String::from_utf8(line.to_vec()) {
            Ok(s) => s,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        };
        Ok(Some(Frame::Line(text)))
    }

    pub fn take_pending(&mut self) -> BytesMut {
        self.scanned = 0;
        self.buf.split()
    }

    pub fn pending_len(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn line(s: &str) -> Option<Frame> {
        Some(Frame::Line(s.to_string()))
    }

    #[test]
    fn test_crlf_and_lf() {
        let mut d = LineDecoder::new(1024);
        d.feed(b"HELLO\r\nWORLD\n");

        assert_eq!(d.next_frame().unwrap(), line("HELLO"));
        assert_eq!(d.next_frame().unwrap(), line("WORLD"));
        assert_eq!(d.next_frame().unwrap(), None);
    }

    #[test]
    fn test_partial_line() {
        let mut d = LineDecoder::new(1024);
        d.feed(b"HEL");
        assert_eq!(d.next_frame().unwrap(), None);

        d.feed(b"LO\r");
        assert_eq!(d.next_frame().unwrap(), None);

        d.feed(b"\n");
        assert_eq!(d.next_frame().unwrap(), line("HELLO"));
        assert_eq!(d.pending_len(), 0);
    }

    #[test]
    fn test_empty_line() {
        let mut d = LineDecoder::new(1024);
        d.feed(b"\r\n");
        assert_eq!(d.next_frame().unwrap(), line(""));
    }

    #[test]
    fn test_too_long() {
        let mut d = LineDecoder::new(8);
        d.feed(b"0123456789");
        assert!(matches!(
            d.next_frame(),
            Err(CodecError::LineTooLong { len: 10, max: 8 })
        ));
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let mut d = LineDecoder::new(64);
        d.feed(b"ab\xffcd\n");
        assert_eq!(d.next_frame().unwrap(), line("ab\u{FFFD}cd"));
    }
}
