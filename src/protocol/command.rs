//! Command and response vocabulary
//!
//! The host-to-module command set is a closed sum type: every command the
//! stack can send is a variant here, with its packet id and payload encoding
//! in one place. Replies carry the command's packet id with the high bit set;
//! acks and nacks have dedicated ids.

use crate::error::{Error, Result};

/// Set on the packet id of every command-specific reply
pub const RESPONSE_BIT: u16 = 0x8000;

/// Packet id constants
pub mod packet_id {
    pub const ACK: u16 = 0x7F01;
    pub const NACK: u16 = 0x7F02;
    pub const KEEP_ALIVE: u16 = 0x7F04;
    pub const FAIL_SAFE: u16 = 0x7F05;
    pub const SET_MODULE_ADDRESS: u16 = 0x7F06;
    pub const QUERY_INTERFACE: u16 = 0x7F07;
    pub const DISCOVERY: u16 = 0x7F0F;

    pub const I2C_CONFIGURE_CHANNEL: u16 = 0x2001;
    pub const I2C_WRITE_SINGLE_BYTE: u16 = 0x2002;
    pub const I2C_WRITE_MULTIPLE_BYTES: u16 = 0x2003;
    pub const I2C_WRITE_STATUS_QUERY: u16 = 0x2004;
    pub const I2C_READ_SINGLE_BYTE: u16 = 0x2005;
    pub const I2C_READ_MULTIPLE_BYTES: u16 = 0x2006;
    pub const I2C_READ_STATUS_QUERY: u16 = 0x2007;
    pub const I2C_WRITE_READ_MULTIPLE_BYTES: u16 = 0x2008;
}

/// I2C bus clock selection for `ConfigureI2cChannel`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum I2cBusSpeed {
    Standard100K = 0,
    Fast400K = 1,
}

/// Why a module refused a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackReason {
    /// A command parameter was outside the legal range (0-9 on the wire)
    ParameterOutOfRange(u8),
    /// I2C controller is servicing another transaction
    I2cMasterBusy,
    /// The queried I2C operation has not finished yet
    I2cOperationInProgress,
    /// A result was queried but no transaction is pending
    I2cNoResultsPending,
    /// The module does not implement this packet id
    CommandNotSupported,
    /// The command could not be routed to its addressee
    CommandRoutingError,
    /// The command was received but its effect is still pending
    CommandImplPending,
    /// Wire code this stack does not recognize
    Unrecognized(u8),
    /// Synthesized by the host: no ack arrived within the await interval
    AbandonedWaitingForAck,
    /// Synthesized by the host: acked, but no response arrived in time
    AbandonedWaitingForResponse,
}

impl NackReason {
    pub fn from_wire(code: u8) -> Self {
        match code {
            0..=9 => NackReason::ParameterOutOfRange(code),
            10 => NackReason::I2cMasterBusy,
            11 => NackReason::I2cOperationInProgress,
            12 => NackReason::I2cNoResultsPending,
            250 => NackReason::CommandNotSupported,
            251 => NackReason::CommandRoutingError,
            253 => NackReason::CommandImplPending,
            other => NackReason::Unrecognized(other),
        }
    }

    /// Whether an I2C transaction that drew this nack should simply be
    /// retried once the controller frees up
    pub fn is_retryable_i2c(&self) -> bool {
        matches!(
            self,
            NackReason::I2cMasterBusy
                | NackReason::I2cOperationInProgress
                | NackReason::CommandImplPending
        )
    }

    /// Synthesized reasons exist only host-side and have no wire code
    pub fn is_synthesized(&self) -> bool {
        matches!(
            self,
            NackReason::AbandonedWaitingForAck | NackReason::AbandonedWaitingForResponse
        )
    }
}

/// Every command the host can send to a module
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Reset the module's fail-safe watchdog
    KeepAlive,
    /// Drive all outputs to their safe states
    FailSafe,
    /// Persistently change the module's bus address
    SetModuleAddress { new_address: u8 },
    /// Ask whether the module implements a named command interface
    QueryInterface { interface_name: String },
    /// Broadcast asking every module on the chain to identify itself
    Discovery,

    ConfigureI2cChannel {
        channel: u8,
        speed: I2cBusSpeed,
    },
    WriteI2cSingleByte {
        channel: u8,
        address7: u8,
        byte: u8,
    },
    WriteI2cMultipleBytes {
        channel: u8,
        address7: u8,
        data: Vec<u8>,
    },
    I2cWriteStatusQuery {
        channel: u8,
    },
    ReadI2cSingleByte {
        channel: u8,
        address7: u8,
    },
    ReadI2cMultipleBytes {
        channel: u8,
        address7: u8,
        count: u8,
    },
    I2cReadStatusQuery {
        channel: u8,
    },
    /// Combined register-write then read, one bus transaction
    WriteReadI2cMultipleBytes {
        channel: u8,
        address7: u8,
        register: u8,
        count: u8,
    },
}

impl Command {
    pub fn packet_id(&self) -> u16 {
        match self {
            Command::KeepAlive => packet_id::KEEP_ALIVE,
            Command::FailSafe => packet_id::FAIL_SAFE,
            Command::SetModuleAddress { .. } => packet_id::SET_MODULE_ADDRESS,
            Command::QueryInterface { .. } => packet_id::QUERY_INTERFACE,
            Command::Discovery => packet_id::DISCOVERY,
            Command::ConfigureI2cChannel { .. } => packet_id::I2C_CONFIGURE_CHANNEL,
            Command::WriteI2cSingleByte { .. } => packet_id::I2C_WRITE_SINGLE_BYTE,
            Command::WriteI2cMultipleBytes { .. } => packet_id::I2C_WRITE_MULTIPLE_BYTES,
            Command::I2cWriteStatusQuery { .. } => packet_id::I2C_WRITE_STATUS_QUERY,
            Command::ReadI2cSingleByte { .. } => packet_id::I2C_READ_SINGLE_BYTE,
            Command::ReadI2cMultipleBytes { .. } => packet_id::I2C_READ_MULTIPLE_BYTES,
            Command::I2cReadStatusQuery { .. } => packet_id::I2C_READ_STATUS_QUERY,
            Command::WriteReadI2cMultipleBytes { .. } => packet_id::I2C_WRITE_READ_MULTIPLE_BYTES,
        }
    }

    pub fn payload(&self) -> Vec<u8> {
        match self {
            Command::KeepAlive | Command::FailSafe | Command::Discovery => vec![],
            Command::SetModuleAddress { new_address } => vec![*new_address],
            Command::QueryInterface { interface_name } => {
                let mut payload = interface_name.as_bytes().to_vec();
                payload.push(0); // NUL-terminated on the wire
                payload
            }
            Command::ConfigureI2cChannel { channel, speed } => vec![*channel, *speed as u8],
            Command::WriteI2cSingleByte {
                channel,
                address7,
                byte,
            } => vec![*channel, *address7, *byte],
            Command::WriteI2cMultipleBytes {
                channel,
                address7,
                data,
            } => {
                let mut payload = Vec::with_capacity(2 + data.len());
                payload.push(*channel);
                payload.push(*address7);
                payload.extend_from_slice(data);
                payload
            }
            Command::I2cWriteStatusQuery { channel } => vec![*channel],
            Command::ReadI2cSingleByte { channel, address7 } => vec![*channel, *address7],
            Command::ReadI2cMultipleBytes {
                channel,
                address7,
                count,
            } => vec![*channel, *address7, *count],
            Command::I2cReadStatusQuery { channel } => vec![*channel],
            Command::WriteReadI2cMultipleBytes {
                channel,
                address7,
                register,
                count,
            } => vec![*channel, *address7, *count, *register],
        }
    }

    /// Whether the module answers with a payload-bearing response rather
    /// than a bare ack
    pub fn expects_response(&self) -> bool {
        matches!(
            self,
            Command::QueryInterface { .. }
                | Command::I2cWriteStatusQuery { .. }
                | Command::I2cReadStatusQuery { .. }
        )
    }

    /// Stand-in reply used when a command is pretended rather than sent
    /// (disengaged bus). Data-bearing responses come back zeroed.
    pub fn placeholder_response(&self) -> Response {
        match self {
            Command::QueryInterface { .. } => Response::QueryInterface {
                first_packet_id: 0,
                packet_id_count: 0,
            },
            Command::I2cWriteStatusQuery { .. } => Response::I2cWriteStatus {
                status: 0,
                bytes_written: 0,
            },
            Command::I2cReadStatusQuery { .. } => Response::I2cReadStatus {
                status: 0,
                data: vec![],
            },
            _ => Response::Ack {
                attention_required: false,
            },
        }
    }
}

/// Every reply a module can send back
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ack {
        /// Module has diagnostics it wants queried
        attention_required: bool,
    },
    Nack(NackReason),
    /// Reply to a discovery broadcast
    Discovery {
        /// True for the module wired directly to USB; false for RS-485
        /// children
        parent: bool,
    },
    QueryInterface {
        first_packet_id: u16,
        packet_id_count: u16,
    },
    I2cWriteStatus {
        status: u8,
        bytes_written: u8,
    },
    I2cReadStatus {
        status: u8,
        data: Vec<u8>,
    },
}

/// I2C status byte: transaction still running
pub const I2C_STATUS_IN_PROGRESS: u8 = 0x01;
/// I2C status byte: target device did not acknowledge
pub const I2C_STATUS_TARGET_NACK: u8 = 0x02;

impl Response {
    /// Decode a reply from its packet id and payload
    pub fn parse(incoming_packet_id: u16, payload: &[u8]) -> Result<Response> {
        match incoming_packet_id {
            packet_id::ACK => Ok(Response::Ack {
                attention_required: payload.first().copied().unwrap_or(0) != 0,
            }),
            packet_id::NACK => {
                let code = payload
                    .first()
                    .copied()
                    .ok_or_else(|| Error::InvalidPacket("nack without reason code".into()))?;
                Ok(Response::Nack(NackReason::from_wire(code)))
            }
            id if id == packet_id::DISCOVERY | RESPONSE_BIT => Ok(Response::Discovery {
                parent: payload.first().copied().unwrap_or(0) != 0,
            }),
            id if id == packet_id::QUERY_INTERFACE | RESPONSE_BIT => {
                if payload.len() < 4 {
                    return Err(Error::InvalidPacket(
                        "query interface response too short".into(),
                    ));
                }
                Ok(Response::QueryInterface {
                    first_packet_id: u16::from_le_bytes([payload[0], payload[1]]),
                    packet_id_count: u16::from_le_bytes([payload[2], payload[3]]),
                })
            }
            id if id == packet_id::I2C_WRITE_STATUS_QUERY | RESPONSE_BIT => {
                if payload.len() < 2 {
                    return Err(Error::InvalidPacket(
                        "i2c write status response too short".into(),
                    ));
                }
                Ok(Response::I2cWriteStatus {
                    status: payload[0],
                    bytes_written: payload[1],
                })
            }
            id if id == packet_id::I2C_READ_STATUS_QUERY | RESPONSE_BIT => {
                let status = payload
                    .first()
                    .copied()
                    .ok_or_else(|| Error::InvalidPacket("i2c read status response empty".into()))?;
                Ok(Response::I2cReadStatus {
                    status,
                    data: payload[1..].to_vec(),
                })
            }
            other => Err(Error::InvalidPacket(format!(
                "unrecognized reply packet id {:#06x}",
                other
            ))),
        }
    }

    /// True for acks and command replies, false for nacks
    pub fn is_positive(&self) -> bool {
        !matches!(self, Response::Nack(_))
    }
}
