//! Message boundary detection for SIP carried on a flow byte stream.
//!
//! A flow has no framing of its own, so complete messages are found the way
//! SIP over any stream transport does it: the header block ends at the first
//! empty line and the body is exactly `Content-Length` bytes long. Runs of
//! CRLF between messages are keep-alives and are consumed silently.

use crate::WireError;
use std::ops::Range;

/// Terminator of the SIP header block
const HEADER_END: &[u8] = b"\r\n\r\n";

/// Outcome of scanning a receive buffer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Scan {
    /// Bytes that may be dropped from the front of the buffer
    pub consumed: usize,
    /// Byte ranges of every complete message, in arrival order
    pub messages: Vec<Range<usize>>,
}

impl Scan {
    /// Whether the scan found nothing but (possibly) keep-alive padding
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

/// Stateless SIP frame decoder for stream transports
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameDecoder;

impl FrameDecoder {
    /// Create a new frame decoder
    pub fn new() -> Self {
        Self
    }

    /// Scan `buf` for complete messages.
    ///
    /// Returns how many leading bytes are fully processed together with the
    /// range of each message found. A trailing partial message is left
    /// unconsumed. An error means the stream can no longer be trusted.
    pub fn scan(&self, buf: &[u8]) -> Result<Scan, WireError> {
        let mut scan = Scan::default();
        let mut pos = 0;

        loop {
            // Keep-alive CRLFs between messages
            while pos < buf.len() && matches!(buf[pos], b'\r' | b'\n') {
                pos += 1;
            }
            scan.consumed = pos;

            if pos == buf.len() {
                break;
            }

            let Some(header_len) = find_header_end(&buf[pos..]) else {
                break;
            };

            let content_length = content_length(&buf[pos..pos + header_len])?;
            let body_start = pos + header_len + HEADER_END.len();
            let end = body_start
                .checked_add(content_length)
                .ok_or_else(|| WireError::InvalidContentLength(content_length.to_string()))?;

            if end > buf.len() {
                break;
            }

            scan.messages.push(pos..end);
            pos = end;
            scan.consumed = pos;
        }

        Ok(scan)
    }
}

fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_END.len()).position(|w| w == HEADER_END)
}

/// Extract the body length from a header block (start line included)
fn content_length(headers: &[u8]) -> Result<usize, WireError> {
    for line in headers.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let Some(colon) = line.iter().position(|&b| b == b':') else {
            continue;
        };

        let name = line[..colon].trim_ascii();
        if !(name.eq_ignore_ascii_case(b"content-length") || name.eq_ignore_ascii_case(b"l")) {
            continue;
        }

        let value = line[colon + 1..].trim_ascii();
        return std::str::from_utf8(value)
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .ok_or_else(|| {
                WireError::InvalidContentLength(String::from_utf8_lossy(value).into_owned())
            });
    }

    Err(WireError::MissingContentLength)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(body: &str) -> String {
        format!(
            "MESSAGE sip:b@example.com SIP/2.0\r\nCall-ID: abc\r\nContent-Length: {}\r\n\r\n{}",
            body.len(),
            body
        )
    }

    #[test]
    fn test_single_complete_message() {
        let msg = message("hello");
        let scan = FrameDecoder::new().scan(msg.as_bytes()).unwrap();

        assert_eq!(scan.consumed, msg.len());
        assert_eq!(scan.messages, vec![0..msg.len()]);
    }

    #[test]
    fn test_partial_message_is_not_consumed() {
        let msg = message("hello world");
        let partial = &msg.as_bytes()[..msg.len() - 3];
        let scan = FrameDecoder::new().scan(partial).unwrap();

        assert_eq!(scan.consumed, 0);
        assert!(scan.is_empty());
    }

    #[test]
    fn test_two_messages_and_tail() {
        let first = message("one");
        let second = message("two");
        let data = format!("{}{}INVITE sip:x SIP/2.0\r\n", first, second);
        let scan = FrameDecoder::new().scan(data.as_bytes()).unwrap();

        assert_eq!(scan.messages.len(), 2);
        assert_eq!(scan.messages[1], first.len()..first.len() + second.len());
        assert_eq!(scan.consumed, first.len() + second.len());
    }

    #[test]
    fn test_keepalive_crlf_is_consumed() {
        let scan = FrameDecoder::new().scan(b"\r\n\r\n").unwrap();
        assert_eq!(scan.consumed, 4);
        assert!(scan.is_empty());

        let msg = message("x");
        let data = format!("\r\n\r\n{}", msg);
        let scan = FrameDecoder::new().scan(data.as_bytes()).unwrap();
        assert_eq!(scan.messages, vec![4..data.len()]);
    }

    #[test]
    fn test_compact_content_length() {
        let data = b"OPTIONS sip:b SIP/2.0\r\nl: 2\r\n\r\nok";
        let scan = FrameDecoder::new().scan(data).unwrap();
        assert_eq!(scan.consumed, data.len());
    }

    #[test]
    fn test_missing_content_length_is_an_error() {
        let data = b"OPTIONS sip:b SIP/2.0\r\nCall-ID: 1\r\n\r\n";
        assert_eq!(
            FrameDecoder::new().scan(data),
            Err(WireError::MissingContentLength)
        );
    }

    #[test]
    fn test_garbage_content_length_is_an_error() {
        let data = b"OPTIONS sip:b SIP/2.0\r\nContent-Length: lots\r\n\r\n";
        assert!(matches!(
            FrameDecoder::new().scan(data),
            Err(WireError::InvalidContentLength(v)) if v == "lots"
        ));
    }
}
