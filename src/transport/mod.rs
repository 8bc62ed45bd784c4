//! Transport abstraction for hub communication
//!
//! The protocol stack talks to the wire through this trait so that tests can
//! substitute a scripted transport. One thread (the incoming datagram
//! poller) blocks in `read` while other threads call `write`; implementations
//! must support that concurrency without a caller-visible lock.

mod mock;
mod serial;

pub use mock::MockTransport;
pub use serial::SerialTransport;

use crate::error::Result;
use std::time::Duration;

/// Byte-stream transport to the hub chain
pub trait Transport: Send + Sync {
    /// Write all of `data` to the wire.
    fn write(&self, data: &[u8]) -> Result<()>;

    /// Read into `buf`, blocking until at least `min` bytes are available,
    /// the timeout expires, or a read interrupt is requested. Returns the
    /// number of bytes read: a timeout or interrupt returns whatever had
    /// already arrived, possibly 0, and never discards consumed bytes.
    fn read(&self, buf: &mut [u8], min: usize, timeout: Duration) -> Result<usize>;

    /// Whether the underlying device is still open
    fn is_open(&self) -> bool;

    /// Ask a blocked `read` to return early (with 0 bytes). Passing `false`
    /// re-arms reads for subsequent calls.
    fn request_read_interrupt(&self, interrupt: bool);

    /// Close the transport. Blocked reads return; all later calls fail.
    fn close(&self);
}
