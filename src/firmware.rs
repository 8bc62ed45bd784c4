//! Firmware update sequencing
//!
//! Updating a hub's firmware means taking the shared line away from normal
//! traffic, strapping the module into its bootloader with the programming
//! and reset lines, and handing the wire to a flashing routine. Only one
//! update may run per controller, across all buses, because the strap lines
//! of chained modules are not isolated from each other.

use crate::bus::{ControllerContext, HubBus};
use crate::config::FirmwareConfig;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// CBUS bitmask for the (active-low) reset line on FTDI-attached hubs
pub const CBUS_N_RESET_MASK: u8 = 0x01;
/// CBUS bitmask for the (active-low) bootloader-select line
pub const CBUS_N_PROG_MASK: u8 = 0x02;

/// Control over the module's bootstrap lines
///
/// `asserted = true` drives the line active (low on the hardware). The two
/// implementations in the field are FTDI CBUS bit-bang for USB-attached
/// hubs and SoC GPIO for embedded controllers; both live outside this crate
/// behind this seam.
pub trait BootloaderLines: Send + Sync {
    fn set_programming(&self, asserted: bool) -> Result<()>;
    fn set_reset(&self, asserted: bool) -> Result<()>;
}

/// One GPIO line on an embedded controller
pub trait DigitalPin: Send + Sync {
    fn set_high(&self, high: bool) -> Result<()>;
}

/// FTDI CBUS bit-bang access for USB-attached hubs
pub trait CbusBitbang: Send + Sync {
    /// Drive the lines selected by `mask` to the levels in `levels`
    fn write_bits(&self, mask: u8, levels: u8) -> Result<()>;
}

/// Bootstrap lines wired to SoC GPIOs. The module's inputs are active-low.
pub struct GpioBootloaderLines {
    pub programming: Box<dyn DigitalPin>,
    pub reset: Box<dyn DigitalPin>,
}

impl BootloaderLines for GpioBootloaderLines {
    fn set_programming(&self, asserted: bool) -> Result<()> {
        self.programming.set_high(!asserted)
    }

    fn set_reset(&self, asserted: bool) -> Result<()> {
        self.reset.set_high(!asserted)
    }
}

/// Bootstrap lines reached through FTDI CBUS pins. Both lines share one
/// bit-bang register, so the last commanded levels are cached and rewritten
/// together.
pub struct CbusBootloaderLines {
    bitbang: Box<dyn CbusBitbang>,
    /// Current line levels; both lines idle high (deasserted)
    levels: parking_lot::Mutex<u8>,
}

impl CbusBootloaderLines {
    pub fn new(bitbang: Box<dyn CbusBitbang>) -> Self {
        CbusBootloaderLines {
            bitbang,
            levels: parking_lot::Mutex::new(CBUS_N_RESET_MASK | CBUS_N_PROG_MASK),
        }
    }

    fn drive(&self, line_mask: u8, asserted: bool) -> Result<()> {
        let mut levels = self.levels.lock();
        if asserted {
            *levels &= !line_mask; // active low
        } else {
            *levels |= line_mask;
        }
        self.bitbang
            .write_bits(CBUS_N_RESET_MASK | CBUS_N_PROG_MASK, *levels)
    }
}

impl BootloaderLines for CbusBootloaderLines {
    fn set_programming(&self, asserted: bool) -> Result<()> {
        self.drive(CBUS_N_PROG_MASK, asserted)
    }

    fn set_reset(&self, asserted: bool) -> Result<()> {
        self.drive(CBUS_N_RESET_MASK, asserted)
    }
}

/// Update request record, as received from the UI layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareUpdateRequest {
    pub serial_number: String,
    pub firmware_image_file: String,
    /// Opaque id the requester uses to match the outcome to the request
    pub originator_id: String,
}

impl FirmwareUpdateRequest {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Other(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Other(e.to_string()))
    }
}

/// Result record for one update, serializable for the UI layer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirmwareUpdateOutcome {
    pub serial_number: String,
    pub attempts: u32,
    pub success: bool,
    pub detail: String,
}

impl FirmwareUpdateOutcome {
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::Other(e.to_string()))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Other(e.to_string()))
    }
}

/// Sequences a firmware update: claims the controller-wide in-progress
/// flag, quiesces the bus, straps the bootloader, runs the flashing
/// routine, and restores normal operation no matter what happened.
#[derive(Clone)]
pub struct FirmwareUpdater {
    config: FirmwareConfig,
    in_progress: Arc<AtomicBool>,
}

impl FirmwareUpdater {
    pub fn new(config: FirmwareConfig, context: &ControllerContext) -> Self {
        FirmwareUpdater {
            config,
            in_progress: context.firmware_update_in_progress.clone(),
        }
    }

    /// Run one update. `flash` is called with the attempt number (1-based)
    /// once the module is sitting in its bootloader; it owns the wire for
    /// the duration of the call.
    pub fn update<F>(
        &self,
        bus: &HubBus,
        lines: &dyn BootloaderLines,
        flash: F,
    ) -> Result<FirmwareUpdateOutcome>
    where
        F: Fn(u32) -> Result<()>,
    {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::Other(
                "a firmware update is already in progress".to_string(),
            ));
        }

        log::info!("{}: firmware update starting", bus.serial_number());
        bus.disengage();
        let flashed = self.run_attempts(bus, lines, flash);

        // Whatever happened above, the module gets a clean reset, the bus
        // gets re-engaged, and the flag gets cleared.
        let reset_result = self.reset_module(lines);
        bus.engage();
        self.in_progress.store(false, Ordering::SeqCst);

        let (attempts, flash_result) = flashed;
        reset_result?;
        let outcome = match flash_result {
            Ok(()) => FirmwareUpdateOutcome {
                serial_number: bus.serial_number().to_string(),
                attempts,
                success: true,
                detail: "firmware update succeeded".to_string(),
            },
            Err(e) => FirmwareUpdateOutcome {
                serial_number: bus.serial_number().to_string(),
                attempts,
                success: false,
                detail: format!("firmware update failed: {}", e),
            },
        };
        log::info!("{}: {}", bus.serial_number(), outcome.detail);
        Ok(outcome)
    }

    fn run_attempts<F>(&self, bus: &HubBus, lines: &dyn BootloaderLines, flash: F) -> (u32, Result<()>)
    where
        F: Fn(u32) -> Result<()>,
    {
        let mut last_error = Error::Other("no update attempts configured".to_string());
        for attempt in 1..=self.config.update_attempts {
            log::info!(
                "{}: update attempt {}/{}",
                bus.serial_number(),
                attempt,
                self.config.update_attempts
            );
            if let Err(e) = self.enter_bootloader(lines) {
                return (attempt, Err(e));
            }
            thread::sleep(Duration::from_millis(self.config.bootloader_settle_ms));
            match flash(attempt) {
                Ok(()) => return (attempt, Ok(())),
                Err(e) => {
                    log::warn!("{}: attempt {} failed: {}", bus.serial_number(), attempt, e);
                    last_error = e;
                }
            }
        }
        (self.config.update_attempts, Err(last_error))
    }

    /// Strap the module into its bootloader: hold the programming line,
    /// pulse reset, release programming only after the part is back up.
    fn enter_bootloader(&self, lines: &dyn BootloaderLines) -> Result<()> {
        let wiggle = Duration::from_millis(self.config.line_wiggle_ms);
        lines.set_programming(true)?;
        thread::sleep(wiggle);
        lines.set_reset(true)?;
        thread::sleep(wiggle);
        lines.set_reset(false)?;
        thread::sleep(Duration::from_millis(self.config.reset_recovery_ms));
        lines.set_programming(false)?;
        Ok(())
    }

    /// Hardware-reset the module without flashing anything. Used when
    /// bringing a controller up to get the hub into a known state.
    pub fn reset_device(&self, bus: &HubBus, lines: &dyn BootloaderLines) -> Result<()> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::Other(
                "a firmware update is already in progress".to_string(),
            ));
        }
        log::info!("{}: hardware reset", bus.serial_number());
        bus.disengage();
        let result = self.reset_module(lines);
        bus.engage();
        self.in_progress.store(false, Ordering::SeqCst);
        result
    }

    /// Plain reset back into the application image
    fn reset_module(&self, lines: &dyn BootloaderLines) -> Result<()> {
        let wiggle = Duration::from_millis(self.config.line_wiggle_ms);
        lines.set_programming(false)?;
        lines.set_reset(true)?;
        thread::sleep(wiggle);
        lines.set_reset(false)?;
        thread::sleep(Duration::from_millis(self.config.reset_recovery_ms));
        Ok(())
    }
}
