//! Mock transport for testing

use super::Transport;
use crate::error::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Mock transport for unit testing
///
/// Reads block exactly like the serial transport does, so the incoming
/// datagram poller runs against it unmodified. Test code injects inbound
/// bytes with `inject_read` and inspects outbound traffic with
/// `take_written`.
#[derive(Clone, Default)]
pub struct MockTransport {
    inner: Arc<Shared>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<MockState>,
    readable: Condvar,
}

struct MockState {
    read_buffer: VecDeque<u8>,
    write_buffer: Vec<u8>,
    open: bool,
    interrupt_requested: bool,
}

impl Default for MockState {
    fn default() -> Self {
        MockState {
            read_buffer: VecDeque::new(),
            write_buffer: Vec::new(),
            open: true,
            interrupt_requested: false,
        }
    }
}

impl MockTransport {
    /// Create a new mock transport
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject data to be read; wakes any blocked reader
    pub fn inject_read(&self, data: &[u8]) {
        let mut state = self.inner.state.lock();
        state.read_buffer.extend(data);
        self.inner.readable.notify_all();
    }

    /// Take all written data, clearing the write buffer
    pub fn take_written(&self) -> Vec<u8> {
        std::mem::take(&mut self.inner.state.lock().write_buffer)
    }

    /// Get all written data without clearing it
    pub fn get_written(&self) -> Vec<u8> {
        self.inner.state.lock().write_buffer.clone()
    }
}

impl Transport for MockTransport {
    fn write(&self, data: &[u8]) -> Result<()> {
        let mut state = self.inner.state.lock();
        if !state.open {
            return Err(Error::BusShutDown);
        }
        state.write_buffer.extend_from_slice(data);
        Ok(())
    }

    fn read(&self, buf: &mut [u8], min: usize, timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if !state.open || state.interrupt_requested {
                return Ok(0);
            }
            if state.read_buffer.len() >= min {
                break;
            }
            if self
                .inner
                .readable
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                break;
            }
        }
        let available = state.read_buffer.len().min(buf.len());
        for item in buf.iter_mut().take(available) {
            *item = state.read_buffer.pop_front().unwrap();
        }
        Ok(available)
    }

    fn is_open(&self) -> bool {
        self.inner.state.lock().open
    }

    fn request_read_interrupt(&self, interrupt: bool) {
        let mut state = self.inner.state.lock();
        state.interrupt_requested = interrupt;
        self.inner.readable.notify_all();
    }

    fn close(&self) {
        let mut state = self.inner.state.lock();
        state.open = false;
        self.inner.readable.notify_all();
    }
}
