//! Two-tier receive buffering for flow byte streams.
//!
//! Reads always land in a fixed-size fast buffer. While the unconsumed tail
//! of the stream fits there it stays there; once a message outgrows it, the
//! tail spills into a growable large-message buffer that stays active until
//! the backlog drains. The large buffer is cleared, never freed, between
//! messages so its capacity is reused.
//!
//! ```text
//!   read ──► fast[len..cap] ──► parser ──► consume(eaten)
//!                 │                              │
//!                 └──── remainder >= cap ────► large (active)
//! ```

use crate::WireError;
use tracing::trace;

/// Default fast buffer size, the size of a "normal" SIP message
pub const DEFAULT_FAST_BUFFER_SIZE: usize = 4000;

/// Default upper bound for a single buffered message
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 65536;

/// Receive buffer with fast-path and large-message storage
#[derive(Debug)]
pub struct RxBuffer {
    fast: Box<[u8]>,
    fast_len: usize,
    large: Vec<u8>,
    large_active: bool,
    max_message_size: usize,
    spills: u64,
}

impl RxBuffer {
    /// Create a buffer with the given fast capacity and message limit
    pub fn new(fast_buffer_size: usize, max_message_size: usize) -> Self {
        let fast_buffer_size = fast_buffer_size.max(1);
        Self {
            fast: vec![0u8; fast_buffer_size].into_boxed_slice(),
            fast_len: 0,
            large: Vec::new(),
            large_active: false,
            max_message_size: max_message_size.max(fast_buffer_size),
            spills: 0,
        }
    }

    /// Fast buffer capacity
    pub fn fast_capacity(&self) -> usize {
        self.fast.len()
    }

    /// Whether buffered data currently lives in the large-message buffer
    pub fn is_large_active(&self) -> bool {
        self.large_active
    }

    /// Number of times data spilled from the fast buffer into the large one
    pub fn spill_count(&self) -> u64 {
        self.spills
    }

    /// Bytes currently buffered and not yet consumed
    pub fn len(&self) -> usize {
        self.data().len()
    }

    /// Whether nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Region the next read should fill.
    ///
    /// With the fast buffer active this is its free tail. With the large
    /// buffer active the whole fast buffer is scratch space, and
    /// [`commit`](Self::commit) appends from it.
    pub fn read_buf(&mut self) -> &mut [u8] {
        if self.large_active {
            &mut self.fast[..]
        } else {
            &mut self.fast[self.fast_len..]
        }
    }

    /// Account for `n` bytes just read into [`read_buf`](Self::read_buf)
    pub fn commit(&mut self, n: usize) -> Result<(), WireError> {
        if self.large_active {
            let len = self.large.len() + n;
            if len > self.max_message_size {
                return Err(WireError::TooLarge {
                    len,
                    max: self.max_message_size,
                });
            }
            self.large.extend_from_slice(&self.fast[..n]);
        } else {
            debug_assert!(self.fast_len + n <= self.fast.len());
            self.fast_len += n;
        }
        Ok(())
    }

    /// Buffered bytes to hand to the parser
    pub fn data(&self) -> &[u8] {
        if self.large_active {
            &self.large
        } else {
            &self.fast[..self.fast_len]
        }
    }

    /// Drop `eaten` bytes from the front and relocate the remainder.
    pub fn consume(&mut self, eaten: usize) -> Result<(), WireError> {
        let len = self.len();
        if eaten > len {
            return Err(WireError::Overrun {
                consumed: eaten,
                available: len,
            });
        }

        let remainder = len - eaten;
        if remainder < self.fast.len() {
            if remainder > 0 {
                if self.large_active {
                    self.fast[..remainder].copy_from_slice(&self.large[eaten..]);
                } else if eaten > 0 {
                    self.fast.copy_within(eaten..len, 0);
                }
            }
            self.fast_len = remainder;

            if self.large_active {
                trace!("Large message drained, {} byte(s) back in fast buffer", remainder);
                // Reset, keep capacity for the next large message
                self.large.clear();
                self.large_active = false;
            }
        } else if !self.large_active {
            self.large.clear();
            self.large.reserve(remainder.max(self.fast.len() * 2));
            self.large.extend_from_slice(&self.fast[eaten..len]);
            self.fast_len = 0;
            self.large_active = true;
            self.spills += 1;
            trace!("Spilled {} byte(s) into large message buffer", remainder);
        } else if eaten > 0 {
            self.large.copy_within(eaten.., 0);
            self.large.truncate(remainder);
        }

        Ok(())
    }

    /// Push `chunk` through the buffer as a sequence of reads.
    ///
    /// `parse` sees the buffered bytes after every read and returns how many
    /// it consumed. Returns the total consumed across all cycles.
    pub fn feed<F>(&mut self, mut chunk: &[u8], mut parse: F) -> Result<usize, WireError>
    where
        F: FnMut(&[u8]) -> Result<usize, WireError>,
    {
        let mut total = 0;
        while !chunk.is_empty() {
            let buf = self.read_buf();
            let n = buf.len().min(chunk.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            chunk = &chunk[n..];

            self.commit(n)?;
            let eaten = parse(self.data())?;
            self.consume(eaten)?;
            total += eaten;
        }
        Ok(total)
    }
}

impl Default for RxBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_FAST_BUFFER_SIZE, DEFAULT_MAX_MESSAGE_SIZE)
    }
}
