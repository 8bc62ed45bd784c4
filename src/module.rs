//! One expansion hub module on the bus
//!
//! A `HubModule` owns the command/response bookkeeping for a single bus
//! address: message numbering, the table of exchanges awaiting replies,
//! retransmission, and the unresponsive-module fast path.

use crate::bus::BusInner;
use crate::error::{Error, Result};
use crate::protocol::{Command, Datagram, Message, MessageNumberAllocator, NackReason, Response};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{mpsc, Arc, Weak};
use std::time::{Duration, Instant};

/// A reply routed to a waiting exchange
#[derive(Debug)]
enum Completion {
    Ack { attention_required: bool },
    Nack(NackReason),
    Reply(Response),
}

pub struct HubModule {
    /// Current bus address; mutated only during an address change
    address: AtomicU8,
    bus: Weak<BusInner>,
    /// True for modules owned by user code: these get keep-alive pings and
    /// fail-safe on shutdown. System-operation throwaways do not.
    user_module: bool,
    message_numbers: MessageNumberAllocator,
    /// Exchanges awaiting a reply, keyed by message number
    pending: Mutex<HashMap<u8, PendingExchange>>,
    not_responding: AtomicBool,
    /// When the host last put bytes on the wire for this module
    last_transmit: Mutex<Instant>,
}

struct PendingExchange {
    sender: mpsc::Sender<Completion>,
}

impl HubModule {
    pub(crate) fn new(bus: Weak<BusInner>, address: u8, user_module: bool) -> Arc<Self> {
        Arc::new(HubModule {
            address: AtomicU8::new(address),
            bus,
            user_module,
            message_numbers: MessageNumberAllocator::new(),
            pending: Mutex::new(HashMap::new()),
            not_responding: AtomicBool::new(false),
            last_transmit: Mutex::new(Instant::now()),
        })
    }

    pub fn address(&self) -> u8 {
        self.address.load(Ordering::SeqCst)
    }

    pub(crate) fn set_address(&self, address: u8) {
        self.address.store(address, Ordering::SeqCst);
    }

    pub fn is_user_module(&self) -> bool {
        self.user_module
    }

    pub fn is_not_responding(&self) -> bool {
        self.not_responding.load(Ordering::SeqCst)
    }

    pub(crate) fn idle_since(&self) -> Instant {
        *self.last_transmit.lock()
    }

    /// (poll interval, transaction deadline) from the bus config; defaults
    /// if the bus is already gone.
    pub(crate) fn i2c_timing(&self) -> (Duration, Duration) {
        match self.bus.upgrade() {
            Some(bus) => (
                bus.config.i2c.poll_interval(),
                bus.config.i2c.transaction_deadline(),
            ),
            None => {
                let defaults = crate::config::I2cConfig::default();
                (defaults.poll_interval(), defaults.transaction_deadline())
            }
        }
    }

    /// Send a command that is answered by a bare ack
    pub fn send(&self, command: Command) -> Result<()> {
        debug_assert!(!command.expects_response());
        match self.transact(command)? {
            Response::Ack { .. } => Ok(()),
            other => Err(Error::InvalidPacket(format!(
                "expected ack, got {:?}",
                other
            ))),
        }
    }

    /// Send a command and wait for its payload-bearing response
    pub fn send_receive(&self, command: Command) -> Result<Response> {
        debug_assert!(command.expects_response());
        self.transact(command)
    }

    /// Reset the module's fail-safe watchdog
    pub fn ping(&self) -> Result<()> {
        self.send(Command::KeepAlive)
    }

    /// Drive the module's outputs to their safe states
    pub fn fail_safe(&self) -> Result<()> {
        self.send(Command::FailSafe)
    }

    /// Whether the module implements a named command interface
    pub fn query_interface(&self, interface_name: &str) -> Result<Option<(u16, u16)>> {
        let response = self.send_receive(Command::QueryInterface {
            interface_name: interface_name.to_string(),
        });
        match response {
            Ok(Response::QueryInterface {
                first_packet_id,
                packet_id_count,
            }) => Ok(Some((first_packet_id, packet_id_count))),
            Ok(other) => Err(Error::InvalidPacket(format!(
                "unexpected query interface reply: {:?}",
                other
            ))),
            Err(Error::Nack {
                reason: NackReason::CommandNotSupported,
            }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Run one complete command exchange: transmit, await reply, retransmit
    /// on silence, abandon at the deadline.
    pub fn transact(&self, command: Command) -> Result<Response> {
        let bus = self.bus.upgrade().ok_or(Error::BusShutDown)?;

        // An unresponsive module fails fast so user code is not stalled by
        // the full await interval on every call. Keep-alives still go out:
        // they are how the module is noticed coming back.
        if self.is_not_responding() && command != Command::KeepAlive {
            return Err(Error::Nack {
                reason: NackReason::AbandonedWaitingForAck,
            });
        }

        let message_number = self.message_numbers.next();
        let message = Message::new(
            bus.allocate_message_id(),
            self.address(),
            message_number,
            command,
        );

        let (sender, receiver) = mpsc::channel();
        self.pending
            .lock()
            .insert(message_number, PendingExchange { sender });

        bus.lock.acquire(message.id);
        let result = self.run_exchange(&bus, &message, &receiver);
        bus.lock.release(message.id);

        self.pending.lock().remove(&message_number);
        message.finish();
        result
    }

    fn run_exchange(
        &self,
        bus: &Arc<BusInner>,
        message: &Message,
        receiver: &mpsc::Receiver<Completion>,
    ) -> Result<Response> {
        let sent = bus.transmit_datagram(message)?;
        *self.last_transmit.lock() = Instant::now();
        if !sent {
            // Bus is disengaged: pretend the exchange succeeded.
            return Ok(message.command.placeholder_response());
        }

        let expects_response = message.command.expects_response();
        let retransmit_interval = bus.config.retransmit_interval();
        let deadline = Instant::now() + bus.config.await_interval();
        let mut acked = false;

        loop {
            let remaining = match deadline.checked_duration_since(Instant::now()) {
                Some(d) if !d.is_zero() => d,
                _ => break,
            };
            match receiver.recv_timeout(remaining.min(retransmit_interval)) {
                Ok(Completion::Ack { attention_required }) => {
                    if expects_response {
                        // Spurious ack for a responded command; keep waiting.
                        acked = true;
                        continue;
                    }
                    return Ok(Response::Ack { attention_required });
                }
                Ok(Completion::Nack(reason)) => return Err(Error::Nack { reason }),
                Ok(Completion::Reply(response)) => return Ok(response),
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if Instant::now() < deadline {
                        log::debug!(
                            "module #{}: retransmitting msg#{} ({:?})",
                            self.address(),
                            message.message_number,
                            message.command.packet_id()
                        );
                        bus.transmit_datagram(message)?;
                        *self.last_transmit.lock() = Instant::now();
                    }
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => return Err(Error::BusShutDown),
            }
        }

        // Nothing usable arrived within the await interval.
        let reason = if acked {
            NackReason::AbandonedWaitingForResponse
        } else {
            NackReason::AbandonedWaitingForAck
        };
        if !self.not_responding.swap(true, Ordering::SeqCst) {
            bus.warnings.note_unresponsive_module(self.address());
        }
        Err(Error::Nack { reason })
    }

    /// Called by the poller for every datagram whose source is this module
    pub(crate) fn on_incoming_datagram(&self, datagram: Datagram) {
        // Any traffic from the module proves it is alive.
        if self.not_responding.swap(false, Ordering::SeqCst) {
            log::info!("module #{} is responding again", self.address());
            if let Some(bus) = self.bus.upgrade() {
                bus.warnings.clear_unresponsive_module(self.address());
            }
        }

        let completion = match Response::parse(datagram.packet_id, &datagram.payload) {
            Ok(Response::Ack { attention_required }) => Completion::Ack { attention_required },
            Ok(Response::Nack(reason)) => Completion::Nack(reason),
            Ok(response) => Completion::Reply(response),
            Err(e) => {
                log::warn!("module #{}: undecodable reply: {}", self.address(), e);
                return;
            }
        };

        let pending = self.pending.lock();
        match pending.get(&datagram.reference_number) {
            Some(exchange) => {
                // A send failure means the exchange already gave up; fine.
                let _ = exchange.sender.send(completion);
            }
            None => {
                log::debug!(
                    "module #{}: reply for unknown msg#{} dropped",
                    self.address(),
                    datagram.reference_number
                );
            }
        }
    }

    /// Fail every in-flight exchange with `reason`. Used when the bus dies
    /// under us: waiting threads must not sit out their full await interval.
    pub(crate) fn fail_all_pending(&self, reason: NackReason) {
        let pending = self.pending.lock();
        for exchange in pending.values() {
            let _ = exchange.sender.send(Completion::Nack(reason));
        }
    }
}

impl std::fmt::Debug for HubModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubModule")
            .field("address", &self.address())
            .field("user_module", &self.user_module)
            .field("not_responding", &self.is_not_responding())
            .finish()
    }
}
