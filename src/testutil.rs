//! Scripted hub simulator for tests
//!
//! Runs a background thread that plays the module side of the protocol
//! against a `MockTransport`: it parses host frames as they are written and
//! injects replies, with per-module scripting knobs for busy nacks, silent
//! modules, and canned I2C read data.

use crate::protocol::command::{
    packet_id, I2C_STATUS_IN_PROGRESS, I2C_STATUS_TARGET_NACK,
};
use crate::protocol::datagram::{Datagram, BROADCAST_ADDRESS, SYNC1, SYNC2};
use crate::protocol::RESPONSE_BIT;
use crate::transport::MockTransport;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

#[derive(Debug)]
pub struct SimModule {
    pub address: u8,
    pub parent: bool,
    /// Silent modules never answer; used for unresponsive-module tests
    pub silent: bool,
    /// Swallow this many commands without replying (reply loss simulation)
    pub drop_frames: u32,
    /// Refuse this many transaction-starting I2C commands with MasterBusy
    pub i2c_busy_nacks: u32,
    /// Answer this many read status queries with "in progress" first
    pub i2c_read_in_progress_polls: u32,
    /// Report a target nack on status queries while set
    pub i2c_target_nack: bool,
    /// Refuse write status queries with this nack code
    pub i2c_write_status_nack: Option<u8>,
    /// Refuse read status queries with this nack code
    pub i2c_read_status_nack: Option<u8>,
    /// Data handed out by the read status query
    pub i2c_read_data: Vec<u8>,
    /// Packet ids of every command received, in order
    pub received: Vec<u16>,
    /// Payloads of I2C write commands, for inspection
    pub i2c_writes: Vec<Vec<u8>>,
    next_message_number: u8,
}

impl SimModule {
    fn new(address: u8, parent: bool) -> Self {
        SimModule {
            address,
            parent,
            silent: false,
            drop_frames: 0,
            i2c_busy_nacks: 0,
            i2c_read_in_progress_polls: 0,
            i2c_target_nack: false,
            i2c_write_status_nack: None,
            i2c_read_status_nack: None,
            i2c_read_data: Vec::new(),
            received: Vec::new(),
            i2c_writes: Vec::new(),
            next_message_number: 0,
        }
    }

    fn next_message_number(&mut self) -> u8 {
        self.next_message_number = self.next_message_number.wrapping_add(1);
        if self.next_message_number == 0 {
            self.next_message_number = 1;
        }
        self.next_message_number
    }
}

pub struct ScriptedHub {
    transport: MockTransport,
    modules: Arc<Mutex<Vec<SimModule>>>,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ScriptedHub {
    pub fn new(addresses: &[(u8, bool)]) -> Self {
        let transport = MockTransport::new();
        let modules = Arc::new(Mutex::new(
            addresses
                .iter()
                .map(|&(address, parent)| SimModule::new(address, parent))
                .collect::<Vec<_>>(),
        ));
        let stop = Arc::new(AtomicBool::new(false));

        let thread = {
            let transport = transport.clone();
            let modules = modules.clone();
            let stop = stop.clone();
            thread::spawn(move || run(transport, modules, stop))
        };

        ScriptedHub {
            transport,
            modules,
            stop,
            thread: Some(thread),
        }
    }

    pub fn transport(&self) -> MockTransport {
        self.transport.clone()
    }

    pub fn with_module<T>(&self, address: u8, f: impl FnOnce(&mut SimModule) -> T) -> T {
        let mut modules = self.modules.lock();
        let module = modules
            .iter_mut()
            .find(|m| m.address == address)
            .unwrap_or_else(|| panic!("no scripted module at #{}", address));
        f(module)
    }

    pub fn received_packet_ids(&self, address: u8) -> Vec<u16> {
        self.with_module(address, |m| m.received.clone())
    }
}

impl Drop for ScriptedHub {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

fn run(transport: MockTransport, modules: Arc<Mutex<Vec<SimModule>>>, stop: Arc<AtomicBool>) {
    let mut buffer: Vec<u8> = Vec::new();
    while !stop.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(2));
        buffer.extend(transport.take_written());
        while let Some(frame) = extract_frame(&mut buffer) {
            if let Ok(datagram) = Datagram::parse(&frame) {
                handle(&transport, &modules, datagram);
            }
        }
    }
}

/// Pull one complete frame off the front of `buffer`, discarding any
/// leading bytes that are not a sync pair.
fn extract_frame(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    while !buffer.is_empty() {
        let start = buffer
            .windows(2)
            .position(|w| w == [SYNC1, SYNC2])
            .unwrap_or(buffer.len());
        buffer.drain(..start);
        if buffer.len() < 4 {
            return None;
        }
        let total = u16::from_le_bytes([buffer[2], buffer[3]]) as usize;
        if total < 11 {
            buffer.drain(..2);
            continue;
        }
        if buffer.len() < total {
            return None;
        }
        return Some(buffer.drain(..total).collect());
    }
    None
}

fn handle(transport: &MockTransport, modules: &Arc<Mutex<Vec<SimModule>>>, datagram: Datagram) {
    let mut modules = modules.lock();

    if datagram.packet_id == packet_id::DISCOVERY && datagram.destination == BROADCAST_ADDRESS {
        for module in modules.iter_mut().filter(|m| !m.silent) {
            let reply = Datagram {
                source: module.address,
                destination: 0,
                message_number: module.next_message_number(),
                reference_number: datagram.message_number,
                packet_id: packet_id::DISCOVERY | RESPONSE_BIT,
                payload: vec![u8::from(module.parent)],
            };
            transport.inject_read(&reply.encode());
        }
        return;
    }

    let Some(module) = modules
        .iter_mut()
        .find(|m| m.address == datagram.destination)
    else {
        return;
    };
    module.received.push(datagram.packet_id);
    if module.silent {
        return;
    }
    if module.drop_frames > 0 {
        module.drop_frames -= 1;
        return;
    }

    let source = module.address;
    let message_number = module.next_message_number();
    let reference_number = datagram.message_number;
    let reply = |packet_id: u16, payload: Vec<u8>| {
        let frame = Datagram {
            source,
            destination: 0,
            message_number,
            reference_number,
            packet_id,
            payload,
        }
        .encode();
        transport.inject_read(&frame);
    };

    match datagram.packet_id {
        packet_id::KEEP_ALIVE | packet_id::FAIL_SAFE => reply(packet_id::ACK, vec![0]),
        packet_id::SET_MODULE_ADDRESS => {
            reply(packet_id::ACK, vec![0]);
            if let Some(&new_address) = datagram.payload.first() {
                module.address = new_address;
            }
        }
        packet_id::QUERY_INTERFACE => {
            let mut payload = 0x2001u16.to_le_bytes().to_vec();
            payload.extend_from_slice(&8u16.to_le_bytes());
            reply(packet_id::QUERY_INTERFACE | RESPONSE_BIT, payload);
        }
        packet_id::I2C_CONFIGURE_CHANNEL
        | packet_id::I2C_WRITE_SINGLE_BYTE
        | packet_id::I2C_WRITE_MULTIPLE_BYTES
        | packet_id::I2C_READ_SINGLE_BYTE
        | packet_id::I2C_READ_MULTIPLE_BYTES
        | packet_id::I2C_WRITE_READ_MULTIPLE_BYTES => {
            if module.i2c_busy_nacks > 0 {
                module.i2c_busy_nacks -= 1;
                reply(packet_id::NACK, vec![10]); // I2cMasterBusy
            } else {
                if matches!(
                    datagram.packet_id,
                    packet_id::I2C_WRITE_SINGLE_BYTE | packet_id::I2C_WRITE_MULTIPLE_BYTES
                ) {
                    // payload: channel, address7, data...
                    module.i2c_writes.push(datagram.payload[2..].to_vec());
                }
                reply(packet_id::ACK, vec![0]);
            }
        }
        packet_id::I2C_WRITE_STATUS_QUERY => {
            if let Some(code) = module.i2c_write_status_nack {
                reply(packet_id::NACK, vec![code]);
            } else {
                let status = if module.i2c_target_nack {
                    I2C_STATUS_TARGET_NACK
                } else {
                    0
                };
                reply(
                    packet_id::I2C_WRITE_STATUS_QUERY | RESPONSE_BIT,
                    vec![status, module.i2c_writes.last().map_or(0, |w| w.len() as u8)],
                );
            }
        }
        packet_id::I2C_READ_STATUS_QUERY => {
            if let Some(code) = module.i2c_read_status_nack {
                reply(packet_id::NACK, vec![code]);
            } else if module.i2c_read_in_progress_polls > 0 {
                module.i2c_read_in_progress_polls -= 1;
                reply(
                    packet_id::I2C_READ_STATUS_QUERY | RESPONSE_BIT,
                    vec![I2C_STATUS_IN_PROGRESS],
                );
            } else if module.i2c_target_nack {
                reply(
                    packet_id::I2C_READ_STATUS_QUERY | RESPONSE_BIT,
                    vec![I2C_STATUS_TARGET_NACK],
                );
            } else {
                let mut payload = vec![0u8];
                payload.extend_from_slice(&module.i2c_read_data);
                reply(packet_id::I2C_READ_STATUS_QUERY | RESPONSE_BIT, payload);
            }
        }
        _ => reply(packet_id::NACK, vec![250]), // CommandNotSupported
    }
}
