//! Newline-delimited framing for Stratum connections.
//!
//! Complete lines may be any length; only the unterminated tail is bounded,
//! so a client cannot make us buffer an endless line.

use bytes::{BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Largest unterminated line we keep buffering before giving up.
pub const MAX_PARTIAL_LINE: usize = 512;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unterminated line of {0} bytes")]
    LineTooLong(usize),

    #[error("line is not valid UTF-8")]
    Utf8,
}

/// Splits input into trimmed, non-empty lines and writes lines with a
/// trailing newline.
#[derive(Debug, Default)]
pub struct StratumCodec {
    // Bytes already scanned for a newline
    scanned: usize,
}

impl StratumCodec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for StratumCodec {
    type Item = String;
    type Error = CodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<String>, CodecError> {
        loop {
            let Some(offset) = buf[self.scanned..].iter().position(|b| *b == b'\n') else {
                if buf.len() > MAX_PARTIAL_LINE {
                    return Err(CodecError::LineTooLong(buf.len()));
                }
                self.scanned = buf.len();
                return Ok(None);
            };

            let end = self.scanned + offset;
            self.scanned = 0;
            let line = buf.split_to(end + 1);
            let text = std::str::from_utf8(&line[..end])
                .map_err(|_| CodecError::Utf8)?
                .trim();
            if !text.is_empty() {
                return Ok(Some(text.to_string()));
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<String>, CodecError> {
        match self.decode(buf)? {
            Some(line) => Ok(Some(line)),
            None => {
                // A partial line at EOF is never dispatched
                buf.clear();
                self.scanned = 0;
                Ok(None)
            }
        }
    }
}

impl Encoder<String> for StratumCodec {
    type Error = CodecError;

    fn encode(&mut self, line: String, buf: &mut BytesMut) -> Result<(), CodecError> {
        buf.reserve(line.len() + 1);
        buf.put_slice(line.as_bytes());
        buf.put_u8(b'\n');
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(codec: &mut StratumCodec, buf: &mut BytesMut) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = codec.decode(buf).unwrap() {
            lines.push(line);
        }
        lines
    }

    #[test]
    fn test_splits_lines_and_keeps_tail() {
        let mut codec = StratumCodec::new();
        let mut buf = BytesMut::from(&b"{\"a\":1}\n{\"b\":2}\r\n{\"c\""[..]);
        assert_eq!(decode_all(&mut codec, &mut buf), ["{\"a\":1}", "{\"b\":2}"]);
        assert_eq!(&buf[..], b"{\"c\"");

        buf.extend_from_slice(b":3}\n");
        assert_eq!(decode_all(&mut codec, &mut buf), ["{\"c\":3}"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_skips_blank_lines() {
        let mut codec = StratumCodec::new();
        let mut buf = BytesMut::from(&b"\n  \r\n{}\n"[..]);
        assert_eq!(decode_all(&mut codec, &mut buf), ["{}"]);
    }

    #[test]
    fn test_long_complete_line_accepted() {
        let mut codec = StratumCodec::new();
        let long = "x".repeat(4 * MAX_PARTIAL_LINE);
        let mut buf = BytesMut::from(format!("{long}\n").as_bytes());
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(long));
    }

    #[test]
    fn test_overlong_partial_line_rejected() {
        let mut codec = StratumCodec::new();
        let mut buf = BytesMut::from(&[b'x'; MAX_PARTIAL_LINE][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.put_u8(b'x');
        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::LineTooLong(n)) if n == MAX_PARTIAL_LINE + 1
        ));
    }

    #[test]
    fn test_partial_line_dropped_at_eof() {
        let mut codec = StratumCodec::new();
        let mut buf = BytesMut::from(&b"{}\n{\"half"[..]);
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), Some("{}".to_string()));
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_invalid_utf8() {
        let mut codec = StratumCodec::new();
        let mut buf = BytesMut::from(&[0xff, 0xfe, b'\n'][..]);
        assert!(matches!(codec.decode(&mut buf), Err(CodecError::Utf8)));
    }

    #[test]
    fn test_encode_appends_newline() {
        let mut codec = StratumCodec::new();
        let mut buf = BytesMut::new();
        codec.encode("{}".to_string(), &mut buf).unwrap();
        assert_eq!(&buf[..], b"{}\n");
    }
}
