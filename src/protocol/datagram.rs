//! Hub wire framing
//!
//! Packet format: [0x44 0x4B] [LENGTH u16 LE] [DST] [SRC] [MSG#] [REF#]
//! [PACKET_ID u16 LE] [PAYLOAD] [CHECKSUM]
//!
//! LENGTH counts the whole packet, sync bytes and checksum included.
//! Checksum: wrapping 8-bit sum of every byte preceding the checksum octet.

use crate::error::{Error, Result};
use crate::transport::Transport;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Sync byte 1
pub const SYNC1: u8 = 0x44;
/// Sync byte 2
pub const SYNC2: u8 = 0x4B;

/// Bytes before the payload: sync(2) + length(2) + dst + src + msg# + ref# + packet_id(2)
pub const HEADER_LENGTH: usize = 10;
/// Header plus trailing checksum
pub const FRAME_OVERHEAD: usize = HEADER_LENGTH + 1;
/// Upper bound on a whole frame; anything longer is framing noise
pub const MAX_FRAME_LENGTH: usize = 1024;

/// Address of the host on every bus
pub const HOST_ADDRESS: u8 = 0;
/// Destination address used for discovery broadcasts
pub const BROADCAST_ADDRESS: u8 = 0;

/// Wrapping 8-bit sum over `data`
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// One framed packet, either direction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Datagram {
    /// Address of the recipient; first on the wire
    pub destination: u8,
    /// Address of the sender (host is 0)
    pub source: u8,
    /// Per-module sequence number, never 0 for host-originated commands
    pub message_number: u8,
    /// For replies, the message number being answered; 0 otherwise
    pub reference_number: u8,
    /// Command/response discriminator
    pub packet_id: u16,
    /// Command-specific payload
    pub payload: Vec<u8>,
}

impl Datagram {
    /// Encode into wire bytes, checksum appended
    pub fn encode(&self) -> Vec<u8> {
        let total = FRAME_OVERHEAD + self.payload.len();
        let mut frame = Vec::with_capacity(total);
        frame.push(SYNC1);
        frame.push(SYNC2);
        frame.extend_from_slice(&(total as u16).to_le_bytes());
        frame.push(self.destination);
        frame.push(self.source);
        frame.push(self.message_number);
        frame.push(self.reference_number);
        frame.extend_from_slice(&self.packet_id.to_le_bytes());
        frame.extend_from_slice(&self.payload);
        frame.push(checksum(&frame));
        frame
    }

    /// Parse a complete frame (sync bytes through checksum)
    pub fn parse(frame: &[u8]) -> Result<Self> {
        if frame.len() < FRAME_OVERHEAD {
            return Err(Error::InvalidPacket(format!(
                "frame too short: {} bytes",
                frame.len()
            )));
        }
        if frame[0] != SYNC1 || frame[1] != SYNC2 {
            return Err(Error::InvalidPacket("bad sync bytes".to_string()));
        }
        let declared = u16::from_le_bytes([frame[2], frame[3]]) as usize;
        if declared != frame.len() {
            return Err(Error::InvalidPacket(format!(
                "length field {} != frame length {}",
                declared,
                frame.len()
            )));
        }
        let expected = checksum(&frame[..frame.len() - 1]);
        let actual = frame[frame.len() - 1];
        if expected != actual {
            return Err(Error::ChecksumError { expected, actual });
        }
        Ok(Datagram {
            destination: frame[4],
            source: frame[5],
            message_number: frame[6],
            reference_number: frame[7],
            packet_id: u16::from_le_bytes([frame[8], frame[9]]),
            payload: frame[HEADER_LENGTH..frame.len() - 1].to_vec(),
        })
    }
}

/// Incremental frame extractor over a transport
///
/// The bus shares one receive path among all modules, so a corrupted byte
/// must never wedge it: on any framing or checksum failure the reader drops
/// back to hunting for the next sync pair.
pub struct FrameReader {
    transport: Arc<dyn Transport>,
}

impl FrameReader {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        FrameReader { transport }
    }

    /// Read the next valid datagram. Returns `Ok(None)` on timeout or read
    /// interrupt; skips over garbage and bad-checksum frames.
    pub fn next_datagram(&mut self, timeout: Duration) -> Result<Option<Datagram>> {
        let deadline = Instant::now() + timeout;
        loop {
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(d) if !d.is_zero() => d,
                _ => return Ok(None),
            };
            match self.read_one_frame(remaining)? {
                FrameOutcome::Datagram(datagram) => return Ok(Some(datagram)),
                FrameOutcome::Interrupted => return Ok(None),
                FrameOutcome::Desync => continue,
            }
        }
    }

    fn read_one_frame(&mut self, timeout: Duration) -> Result<FrameOutcome> {
        let deadline = Instant::now() + timeout;

        // Hunt for the sync pair one byte at a time. A repeated sync1 may
        // itself start the real preamble, so it restarts the pair check
        // rather than discarding.
        let mut byte = [0u8; 1];
        'hunt: loop {
            if self.read_exact(&mut byte, deadline)? == 0 {
                return Ok(FrameOutcome::Interrupted);
            }
            if byte[0] != SYNC1 {
                continue;
            }
            loop {
                if self.read_exact(&mut byte, deadline)? == 0 {
                    return Ok(FrameOutcome::Interrupted);
                }
                match byte[0] {
                    SYNC2 => break 'hunt,
                    SYNC1 => continue,
                    _ => continue 'hunt,
                }
            }
        }

        let mut length_bytes = [0u8; 2];
        if self.read_exact(&mut length_bytes, deadline)? == 0 {
            return Ok(FrameOutcome::Interrupted);
        }
        let total = u16::from_le_bytes(length_bytes) as usize;
        if !(FRAME_OVERHEAD..=MAX_FRAME_LENGTH).contains(&total) {
            log::warn!("implausible frame length {}; resyncing", total);
            return Ok(FrameOutcome::Desync);
        }

        let mut frame = vec![0u8; total];
        frame[0] = SYNC1;
        frame[1] = SYNC2;
        frame[2] = length_bytes[0];
        frame[3] = length_bytes[1];
        if self.read_exact(&mut frame[4..], deadline)? == 0 {
            return Ok(FrameOutcome::Interrupted);
        }

        match Datagram::parse(&frame) {
            Ok(datagram) => Ok(FrameOutcome::Datagram(datagram)),
            Err(e) => {
                log::warn!("dropping bad frame: {}", e);
                Ok(FrameOutcome::Desync)
            }
        }
    }

    /// Fill `buf` completely or report interrupt/timeout as 0
    fn read_exact(&mut self, buf: &mut [u8], deadline: Instant) -> Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(d) if !d.is_zero() => d,
                _ => return Ok(0),
            };
            let want = buf.len() - filled;
            let n = self.transport.read(&mut buf[filled..], want, remaining)?;
            if n == 0 {
                return Ok(0);
            }
            filled += n;
        }
        Ok(buf.len())
    }
}

enum FrameOutcome {
    Datagram(Datagram),
    Interrupted,
    Desync,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    fn sample_datagram() -> Datagram {
        Datagram {
            source: 0,
            destination: 2,
            message_number: 1,
            reference_number: 0,
            packet_id: 0x7F04,
            payload: vec![],
        }
    }

    #[test]
    fn test_encode_keep_alive() {
        // 44 4B | 0B 00 | 02 | 00 | 01 | 00 | 04 7F | checksum
        let frame = sample_datagram().encode();
        assert_eq!(
            frame,
            vec![0x44, 0x4B, 0x0B, 0x00, 0x02, 0x00, 0x01, 0x00, 0x04, 0x7F, 0x20]
        );
    }

    #[test]
    fn test_parse_round_trip_with_payload() {
        let datagram = Datagram {
            source: 0,
            destination: 3,
            message_number: 42,
            reference_number: 0,
            packet_id: 0x2002,
            payload: vec![0x00, 0x68, 0x01, 0x3D],
        };
        let parsed = Datagram::parse(&datagram.encode()).unwrap();
        assert_eq!(parsed, datagram);
    }

    #[test]
    fn test_single_bit_corruption_rejected() {
        let frame = sample_datagram().encode();
        for byte_index in 0..frame.len() {
            for bit in 0..8 {
                let mut corrupted = frame.clone();
                corrupted[byte_index] ^= 1 << bit;
                assert!(
                    Datagram::parse(&corrupted).is_err(),
                    "flip of bit {} in byte {} went undetected",
                    bit,
                    byte_index
                );
            }
        }
    }

    #[test]
    fn test_checksum_error_reported() {
        let mut frame = sample_datagram().encode();
        let last = frame.len() - 1;
        frame[last] = frame[last].wrapping_add(1);
        match Datagram::parse(&frame) {
            Err(Error::ChecksumError { .. }) => {}
            other => panic!("expected checksum error, got {:?}", other),
        }
    }

    #[test]
    fn test_reader_resyncs_past_garbage() {
        let transport = MockTransport::new();
        let good = sample_datagram().encode();

        // Leading noise, a truncated sync pair, then a valid frame.
        transport.inject_read(&[0x00, 0xFF, 0x44, 0x00, 0x44]);
        transport.inject_read(&good);

        let mut reader = FrameReader::new(Arc::new(transport));
        let datagram = reader
            .next_datagram(Duration::from_millis(200))
            .unwrap()
            .expect("datagram after garbage");
        assert_eq!(datagram, sample_datagram());
    }

    #[test]
    fn test_reader_assembles_frame_delivered_in_pieces() {
        let transport = MockTransport::new();
        let good = sample_datagram().encode();
        let (head, tail) = good.split_at(5);

        transport.inject_read(head);
        let injector = {
            let transport = transport.clone();
            let tail = tail.to_vec();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(30));
                transport.inject_read(&tail);
            })
        };

        let mut reader = FrameReader::new(Arc::new(transport));
        let datagram = reader
            .next_datagram(Duration::from_millis(500))
            .unwrap()
            .expect("frame assembled across partial reads");
        assert_eq!(datagram, sample_datagram());
        injector.join().unwrap();
    }

    #[test]
    fn test_reader_skips_bad_checksum_frame() {
        let transport = MockTransport::new();
        let good = sample_datagram().encode();
        let mut bad = good.clone();
        *bad.last_mut().unwrap() ^= 0x80;

        transport.inject_read(&bad);
        transport.inject_read(&good);

        let mut reader = FrameReader::new(Arc::new(transport));
        let datagram = reader
            .next_datagram(Duration::from_millis(200))
            .unwrap()
            .expect("good datagram after bad one");
        assert_eq!(datagram, sample_datagram());
    }

    #[test]
    fn test_reader_times_out_on_silence() {
        let transport = MockTransport::new();
        let mut reader = FrameReader::new(Arc::new(transport));
        let result = reader.next_datagram(Duration::from_millis(20)).unwrap();
        assert!(result.is_none());
    }
}
