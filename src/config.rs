//! Bus timing and behavior configuration
//!
//! Loads configuration from a TOML file. Every heuristic timing constant in
//! the protocol stack lives here: the documented hub timing guarantees only
//! establish generous upper bounds, so the values are tunable rather than
//! baked in.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Top-level configuration for one hub bus
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct BusConfig {
    /// Maximum time a single message may hold the transmission lock before
    /// the lock is forcibly reassigned (ms). Reaching this is an
    /// internal-consistency failure, not normal flow.
    pub lock_acquisition_timeout_ms: u64,

    /// Total window to wait for an ack or response before abandoning (ms)
    pub await_interval_ms: u64,

    /// Interval between retransmissions while awaiting a reply (ms)
    pub retransmit_interval_ms: u64,

    /// Keep-alive ping interval for idle user modules (ms). The hub firmware
    /// fail-safes if it hears nothing for 2500 ms; any traffic resets that
    /// timer, so pings are only sent when a module has been quiet.
    pub keep_alive_interval_ms: u64,

    pub discovery: DiscoveryConfig,
    pub i2c: I2cConfig,
    pub firmware: FirmwareConfig,
}

/// I2C status-poll pacing
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct I2cConfig {
    /// Spacing between status polls and busy retries (ms)
    pub poll_interval_ms: u64,
    /// Give up on a single I2C transaction after this long (ms)
    pub transaction_deadline_ms: u64,
}

/// Discovery reply-collection window parameters
///
/// The window is computed as
/// `per_module_interval * max_modules + packet_time + slop`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Spacing between successive per-module discovery replies (ms)
    pub per_module_interval_ms: u64,
    /// Maximum number of modules that can answer a discovery broadcast
    pub max_modules: u16,
    /// Maximum time for one complete packet to arrive on the wire (ms)
    pub packet_time_ms: u64,
    /// Extra slack on top of the computed bound (ms)
    pub slop_ms: u64,
}

/// Firmware update / bootloader entry timing
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FirmwareConfig {
    /// Settle time between pin/CBUS line transitions (ms)
    pub line_wiggle_ms: u64,
    /// Recovery time after releasing reset (ms)
    pub reset_recovery_ms: u64,
    /// Time to let the module settle into its bootloader (ms)
    pub bootloader_settle_ms: u64,
    /// Number of enter-mode+flash attempts before giving up
    pub update_attempts: u32,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            lock_acquisition_timeout_ms: 500,
            await_interval_ms: 250,
            retransmit_interval_ms: 100,
            keep_alive_interval_ms: 1000,
            discovery: DiscoveryConfig::default(),
            i2c: I2cConfig::default(),
            firmware: FirmwareConfig::default(),
        }
    }
}

impl Default for I2cConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 3,
            transaction_deadline_ms: 500,
        }
    }
}

impl I2cConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn transaction_deadline(&self) -> Duration {
        Duration::from_millis(self.transaction_deadline_ms)
    }
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            per_module_interval_ms: 3,
            max_modules: 254,
            packet_time_ms: 50,
            slop_ms: 200,
        }
    }
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            line_wiggle_ms: 75,
            reset_recovery_ms: 200,
            bootloader_settle_ms: 100,
            update_attempts: 2,
        }
    }
}

impl BusConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: BusConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn lock_acquisition_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_acquisition_timeout_ms)
    }

    pub fn await_interval(&self) -> Duration {
        Duration::from_millis(self.await_interval_ms)
    }

    pub fn retransmit_interval(&self) -> Duration {
        Duration::from_millis(self.retransmit_interval_ms)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }
}

impl DiscoveryConfig {
    /// Worst-case window in which every present module will have replied to
    /// a discovery broadcast. A generous upper bound, not a protocol
    /// guarantee.
    pub fn reply_window(&self) -> Duration {
        Duration::from_millis(
            self.per_module_interval_ms * u64::from(self.max_modules)
                + self.packet_time_ms
                + self.slop_ms,
        )
    }
}
