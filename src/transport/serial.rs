//! Serial transport implementation

use super::Transport;
use crate::error::{Error, Result};
use parking_lot::Mutex;
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// How long each low-level read blocks before re-checking for interrupt
const READ_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Serial transport over a USB serial adapter
///
/// The reader and writer are independent clones of the same port so that the
/// incoming datagram poller can sit in `read` while other threads transmit.
pub struct SerialTransport {
    reader: Mutex<Box<dyn SerialPort>>,
    writer: Mutex<Box<dyn SerialPort>>,
    open: AtomicBool,
    interrupt_requested: AtomicBool,
}

impl SerialTransport {
    /// Open a serial port
    ///
    /// # Arguments
    /// * `path` - Serial port path (e.g., "/dev/ttyUSB0")
    /// * `baud_rate` - Baud rate (e.g., 460800)
    pub fn open(path: &str, baud_rate: u32) -> Result<Self> {
        let writer = serialport::new(path, baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(READ_POLL_INTERVAL)
            .open()?;
        let reader = writer.try_clone()?;

        log::info!("Opened serial port: {} at {} baud", path, baud_rate);

        Ok(SerialTransport {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            open: AtomicBool::new(true),
            interrupt_requested: AtomicBool::new(false),
        })
    }
}

impl Transport for SerialTransport {
    fn write(&self, data: &[u8]) -> Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(Error::BusShutDown);
        }
        let mut port = self.writer.lock();
        port.write_all(data)?;
        port.flush()?;
        Ok(())
    }

    fn read(&self, buf: &mut [u8], min: usize, timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        let mut total = 0usize;
        let mut port = self.reader.lock();

        while total < min {
            if !self.open.load(Ordering::SeqCst) || self.interrupt_requested.load(Ordering::SeqCst)
            {
                // Bytes already pulled off the port belong to the caller;
                // dropping them here would desync the frame reader.
                return Ok(total);
            }
            if Instant::now() >= deadline {
                return Ok(total);
            }
            match port.read(&mut buf[total..]) {
                Ok(n) => total += n,
                Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(total)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn request_read_interrupt(&self, interrupt: bool) {
        self.interrupt_requested.store(interrupt, Ordering::SeqCst);
    }

    fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}
