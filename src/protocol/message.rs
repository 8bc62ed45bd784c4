//! Outgoing message identity and lifecycle
//!
//! A `Message` is one command in flight to one module. Its `MessageId` keys
//! the transmission lock (so retransmissions by the same logical operation
//! re-enter the lock), and its encoded bytes are cached across
//! retransmissions then dropped when the exchange finishes.

use crate::protocol::command::Command;
use crate::protocol::datagram::{Datagram, HOST_ADDRESS};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU8, Ordering};

/// Process-unique identity of one logical transmission
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageId(pub u64);

/// Per-module message number source
///
/// Message numbers are a single wrapping byte; 0 is reserved so that a
/// reference number of 0 unambiguously means "not a reply".
#[derive(Debug, Default)]
pub struct MessageNumberAllocator {
    next: AtomicU8,
}

impl MessageNumberAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> u8 {
        loop {
            let number = self.next.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            if number != 0 {
                return number;
            }
        }
    }
}

/// One outbound command with its wire framing
#[derive(Debug)]
pub struct Message {
    pub id: MessageId,
    pub destination: u8,
    pub message_number: u8,
    pub command: Command,
    /// Encoded frame, kept while retransmission is still possible
    serialized: Mutex<Option<Vec<u8>>>,
}

impl Message {
    pub fn new(id: MessageId, destination: u8, message_number: u8, command: Command) -> Self {
        Message {
            id,
            destination,
            message_number,
            command,
            serialized: Mutex::new(None),
        }
    }

    /// Encoded wire bytes, computed once and reused for retransmission
    pub fn wire_bytes(&self) -> Vec<u8> {
        let mut cache = self.serialized.lock();
        if let Some(bytes) = cache.as_ref() {
            return bytes.clone();
        }
        let bytes = Datagram {
            source: HOST_ADDRESS,
            destination: self.destination,
            message_number: self.message_number,
            reference_number: 0,
            packet_id: self.command.packet_id(),
            payload: self.command.payload(),
        }
        .encode();
        *cache = Some(bytes.clone());
        bytes
    }

    /// Drop the cached frame once no retransmission can occur
    pub fn finish(&self) {
        *self.serialized.lock() = None;
    }
}
