//! Wire protocol: framing, command vocabulary, message lifecycle

pub mod command;
pub mod datagram;
pub mod message;

pub use command::{Command, I2cBusSpeed, NackReason, Response, RESPONSE_BIT};
pub use datagram::{Datagram, FrameReader};
pub use message::{Message, MessageId, MessageNumberAllocator};
