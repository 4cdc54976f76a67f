//! Sends issued before a transport finished connecting.
//!
//! Entries are moved out of the queue when they are flushed or drained, so
//! each completion callback runs at most once.

use crate::{Result, TransportError};
use bytes::Bytes;
use std::collections::VecDeque;
use std::fmt;
use tokio::time::Instant;

/// Completion callback for a send; receives the byte count or the failure
pub type SendCallback = Box<dyn FnOnce(Result<usize>) + Send + 'static>;

/// One queued send
pub struct DelayedSend {
    /// Payload, shared with the caller
    pub data: Bytes,
    /// Completion callback
    pub on_sent: Option<SendCallback>,
    /// Instant after which the entry is failed instead of transmitted
    pub deadline: Instant,
}

impl DelayedSend {
    /// Queue `data` until `deadline`
    pub fn new(data: Bytes, on_sent: Option<SendCallback>, deadline: Instant) -> Self {
        Self {
            data,
            on_sent,
            deadline,
        }
    }

    /// Whether the deadline has passed at `now`
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.deadline
    }

    /// Complete the entry with a failure
    pub fn fail(self, err: TransportError) {
        if let Some(on_sent) = self.on_sent {
            on_sent(Err(err));
        }
    }
}

impl fmt::Debug for DelayedSend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayedSend")
            .field("len", &self.data.len())
            .field("has_callback", &self.on_sent.is_some())
            .field("deadline", &self.deadline)
            .finish()
    }
}

/// FIFO of delayed sends
#[derive(Debug, Default)]
pub struct DelayedQueue {
    entries: VecDeque<DelayedSend>,
}

impl DelayedQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry
    pub fn push(&mut self, entry: DelayedSend) {
        self.entries.push_back(entry);
    }

    /// Number of queued entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every entry, oldest first
    pub fn drain(&mut self) -> Vec<DelayedSend> {
        self.entries.drain(..).collect()
    }

    /// Remove every entry, separating live ones from expired ones.
    ///
    /// Both lists keep FIFO order.
    pub fn split_expired(&mut self, now: Instant) -> (Vec<DelayedSend>, Vec<DelayedSend>) {
        self.entries.drain(..).partition(|entry| !entry.is_expired(now))
    }
}

/// Fail every entry with the same error
pub fn fail_all(entries: Vec<DelayedSend>, err: &TransportError) {
    for entry in entries {
        entry.fail(err.clone());
    }
}
