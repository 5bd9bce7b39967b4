//! Per-endpoint FIFO of received game messages.
//!
//! The I/O thread pushes, the consumer thread pops. One mutex guards the
//! whole queue; nothing is reordered and nothing is dropped except by
//! [`MessageQueue::clear`] when the owning endpoint is destroyed.

use std::collections::VecDeque;
use std::sync::Mutex;

use tessera_protocol::NumericPlayerId;

use crate::sync::lock;

/// One received message. Immutable once queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageEnvelope {
    sender: NumericPlayerId,
    payload: Vec<u8>,
}

impl MessageEnvelope {
    /// Wrap a payload received from `sender`.
    pub fn new(sender: NumericPlayerId, payload: Vec<u8>) -> Self {
        Self { sender, payload }
    }

    /// Numeric id of the sender.
    pub fn sender(&self) -> NumericPlayerId {
        self.sender
    }

    /// Message bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload length in bytes.
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Outcome of a receive call on the polling contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveStatus {
    /// A message was copied into the caller's buffer and removed.
    Success {
        /// Who sent it.
        sender: NumericPlayerId,
        /// Bytes written to the buffer.
        len: usize,
    },
    /// The queue is empty.
    NoMessages,
    /// The head message does not fit; it stays queued.
    Failure {
        /// Buffer size needed for the head message.
        required: usize,
    },
}

/// Thread-safe FIFO of [`MessageEnvelope`]s.
#[derive(Debug, Default)]
pub struct MessageQueue {
    inner: Mutex<VecDeque<MessageEnvelope>>,
}

impl MessageQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an envelope. Returns the queue length afterwards.
    pub fn push(&self, envelope: MessageEnvelope) -> usize {
        let mut queue = lock(&self.inner);
        queue.push_back(envelope);
        queue.len()
    }

    /// Number of queued envelopes.
    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        lock(&self.inner).is_empty()
    }

    /// Remove and return the head envelope.
    pub fn pop(&self) -> Option<MessageEnvelope> {
        lock(&self.inner).pop_front()
    }

    /// Copy the head envelope into `buffer` and remove it, unless it does not
    /// fit.
    pub fn pop_into(&self, buffer: &mut [u8]) -> ReceiveStatus {
        let mut queue = lock(&self.inner);
        let Some(head) = queue.front() else {
            return ReceiveStatus::NoMessages;
        };
        if head.len() > buffer.len() {
            return ReceiveStatus::Failure {
                required: head.len(),
            };
        }

        let len = head.len();
        let sender = head.sender();
        buffer[..len].copy_from_slice(head.payload());
        queue.pop_front();
        ReceiveStatus::Success { sender, len }
    }

    /// Drop every queued envelope. Returns how many were dropped.
    pub fn clear(&self) -> usize {
        let mut queue = lock(&self.inner);
        let dropped = queue.len();
        queue.clear();
        dropped
    }
}
