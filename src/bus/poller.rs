//! Incoming datagram poller
//!
//! One thread per bus sits on the transport, extracts frames, and routes
//! them by source address. It must survive any amount of wire garbage; only
//! shutdown or a dead transport stops it.

use crate::bus::BusInner;
use crate::protocol::FrameReader;
use std::sync::Arc;
use std::time::Duration;

/// Upper bound on one blocking read so the shutdown flag is re-checked
const POLL_TIMEOUT: Duration = Duration::from_secs(1);

pub(crate) fn run(bus: Arc<BusInner>) {
    log::debug!("incoming datagram poller started for {}", bus.serial_number());
    let mut reader = FrameReader::new(bus.transport());

    while !bus.is_shut_down() {
        match reader.next_datagram(POLL_TIMEOUT) {
            Ok(Some(datagram)) => bus.route_incoming(datagram),
            Ok(None) => {} // timeout or interrupt; loop re-checks shutdown
            Err(e) => {
                // Timeouts and interrupts come back as Ok(None); an Err means
                // the device itself failed, whatever is_open still claims.
                log::error!("{}: poller read failed: {}", bus.serial_number(), e);
                bus.note_transport_failure("USB device no longer readable");
                break;
            }
        }
    }
    log::debug!("incoming datagram poller stopped for {}", bus.serial_number());
}
