//! Wire protocol error types.

use thiserror::Error;

/// Errors raised while framing SIP messages on a flow byte stream
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Header block complete but no Content-Length (mandatory on streams)
    #[error("missing Content-Length header")]
    MissingContentLength,

    /// Content-Length present but not a valid length
    #[error("invalid Content-Length: {0}")]
    InvalidContentLength(String),

    /// Buffered message exceeds the configured maximum
    #[error("message too large: {len} bytes (max {max})")]
    TooLarge {
        /// Bytes buffered so far
        len: usize,
        /// Configured limit
        max: usize,
    },

    /// Parser reported more bytes consumed than were buffered
    #[error("consumed {consumed} bytes but only {available} buffered")]
    Overrun {
        /// Bytes the parser claimed
        consumed: usize,
        /// Bytes actually buffered
        available: usize,
    },
}
