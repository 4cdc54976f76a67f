//! SIP stream framing and receive buffering for RINA flows.
//!
//! A RINA flow delivers an unframed byte stream, exactly like a TCP
//! connection. This crate holds the pieces of the receive path that do not
//! depend on any runtime:
//!
//! - **Frame decoding**: finds complete SIP messages in buffered bytes
//!   (`Content-Length` framing, CRLF keep-alives skipped)
//! - **Receive buffering**: a fixed fast buffer with spill-over into a
//!   reusable large-message buffer
//! - **Keep-alive payload**: the bytes sent as a heartbeat on idle flows
//!
//! ## Receive cycle
//!
//! ```text
//! +-----------+    +-----------------+    +----------------+
//! | flow read | -> | RxBuffer (fast/ | -> | FrameDecoder / |
//! |           |    | large)          |    | manager parser |
//! +-----------+    +-----------------+    +----------------+
//!                          ^                      |
//!                          +---- consume(n) ------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod buffer;
pub mod error;
pub mod frame;

// Re-export main types
pub use buffer::{RxBuffer, DEFAULT_FAST_BUFFER_SIZE, DEFAULT_MAX_MESSAGE_SIZE};
pub use error::WireError;
pub use frame::{FrameDecoder, Scan};

/// Heartbeat sent on idle flows (a SIP CRLF keep-alive)
pub const KEEP_ALIVE_DATA: &[u8] = b"\r\n\r\n";
