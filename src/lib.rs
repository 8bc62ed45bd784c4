//! hublink - Communication stack for daisy-chained expansion hub modules
//!
//! Implements the framed, checksummed command/response protocol spoken over
//! a shared USB/RS-485 line: message-keyed bus arbitration, reply
//! correlation with retransmission, module discovery and address
//! management, I2C transactions, and firmware update sequencing.

pub mod bus;
pub mod config;
pub mod discovery;
pub mod error;
pub mod firmware;
pub mod i2c;
pub mod module;
pub mod protocol;
pub mod transport;
pub mod warning;

#[cfg(test)]
pub(crate) mod testutil;

// Re-export commonly used types
pub use bus::{ControllerContext, HubBus};
pub use config::BusConfig;
pub use discovery::{ImuType, ModuleMeta, ModuleMetaList};
pub use error::{Error, Result};
pub use firmware::{BootloaderLines, FirmwareUpdater};
pub use i2c::{I2cDevice, I2cWaitControl};
pub use module::HubModule;
