//! I2C transactions through a hub module
//!
//! The hub's I2C controller is asynchronous: a write or read command only
//! starts the bus transaction, and completion is learned by polling status
//! queries. This layer hides that, retries the transient "controller busy"
//! refusals, and converts device faults into placeholder data plus a
//! warning instead of an error, so one flaky sensor cannot crash a control
//! loop.

use crate::error::{Error, Result};
use crate::module::HubModule;
use crate::protocol::command::{I2C_STATUS_IN_PROGRESS, I2C_STATUS_TARGET_NACK};
use crate::protocol::{Command, I2cBusSpeed, NackReason, Response};
use crate::warning::WarningAggregator;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// How much confirmation a write should wait for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum I2cWaitControl {
    /// Return once the hub accepts the command; completion unverified
    None,
    /// Wait until the hub has committed to issuing the transaction
    Atomic,
    /// Wait until the bytes are confirmed on the target device
    #[default]
    Written,
}

/// One target device on one I2C channel of one module
pub struct I2cDevice {
    module: Arc<HubModule>,
    channel: u8,
    address7: u8,
    name: String,
    warnings: WarningAggregator,
    /// Use the combined write-read command for register reads. Older
    /// firmware lacks it; the two-command sequence is the fallback.
    combined_write_read: bool,
    poll_interval: Duration,
    transaction_deadline: Duration,
}

impl I2cDevice {
    pub fn new(
        module: Arc<HubModule>,
        channel: u8,
        address7: u8,
        name: &str,
        warnings: WarningAggregator,
    ) -> Self {
        let (poll_interval, transaction_deadline) = module.i2c_timing();
        I2cDevice {
            module,
            channel,
            address7,
            name: name.to_string(),
            warnings,
            combined_write_read: true,
            poll_interval,
            transaction_deadline,
        }
    }

    /// Fall back to the two-command read sequence for older firmware
    pub fn set_combined_write_read(&mut self, enabled: bool) {
        self.combined_write_read = enabled;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Set the channel's bus clock
    pub fn configure(&self, speed: I2cBusSpeed) -> Result<()> {
        self.module.send(Command::ConfigureI2cChannel {
            channel: self.channel,
            speed,
        })
    }

    /// Write `data` starting at `register`, waiting for confirmation
    pub fn write(&self, register: u8, data: &[u8]) -> Result<()> {
        self.write_with_control(register, data, I2cWaitControl::Written)
    }

    pub fn write_with_control(
        &self,
        register: u8,
        data: &[u8],
        wait: I2cWaitControl,
    ) -> Result<()> {
        let mut buffer = Vec::with_capacity(1 + data.len());
        buffer.push(register);
        buffer.extend_from_slice(data);
        if let Err(e) = self.write_raw(&buffer) {
            // Device faults degrade to a warning, never an error into the
            // control loop. Anything that is not a module nack is real.
            return match e.nack_reason() {
                Some(_) => {
                    self.note_fault("write refused");
                    Ok(())
                }
                None => Err(e),
            };
        }
        match wait {
            I2cWaitControl::None => Ok(()),
            I2cWaitControl::Atomic | I2cWaitControl::Written => self.wait_for_write_completion(),
        }
    }

    /// Read `count` bytes starting at `register`
    pub fn read(&self, register: u8, count: u8) -> Result<Vec<u8>> {
        if count == 0 {
            return Err(Error::InvalidParameter("i2c read of 0 bytes".to_string()));
        }
        let issued = if self.combined_write_read {
            self.send_transaction(Command::WriteReadI2cMultipleBytes {
                channel: self.channel,
                address7: self.address7,
                register,
                count,
            })
        } else {
            self.read_via_two_commands(register, count)
        };
        if let Err(e) = issued {
            return match e.nack_reason() {
                Some(_) => self.placeholder_data(count, "transaction refused"),
                None => Err(e),
            };
        }
        self.poll_for_read_result(count)
    }

    /// Address the register with a bare write, then issue the read. Older
    /// firmware without the combined write-read command needs this.
    fn read_via_two_commands(&self, register: u8, count: u8) -> Result<()> {
        self.write_raw(&[register])?;
        self.wait_for_write_completion()?;
        let read_command = if count == 1 {
            Command::ReadI2cSingleByte {
                channel: self.channel,
                address7: self.address7,
            }
        } else {
            Command::ReadI2cMultipleBytes {
                channel: self.channel,
                address7: self.address7,
                count,
            }
        };
        self.send_transaction(read_command)
    }

    /// One-byte writes use the dedicated single-byte command. The firmware
    /// handles both forms, but the split matches what it was validated
    /// against, so it stays.
    fn write_raw(&self, buffer: &[u8]) -> Result<()> {
        let command = if buffer.len() == 1 {
            Command::WriteI2cSingleByte {
                channel: self.channel,
                address7: self.address7,
                byte: buffer[0],
            }
        } else {
            Command::WriteI2cMultipleBytes {
                channel: self.channel,
                address7: self.address7,
                data: buffer.to_vec(),
            }
        };
        self.send_transaction(command)
    }

    /// Send a transaction-starting command, retrying while the controller
    /// reports itself busy with earlier work. Expired-deadline busy nacks
    /// surface as the nack; callers route them to the fault path.
    fn send_transaction(&self, command: Command) -> Result<()> {
        let deadline = Instant::now() + self.transaction_deadline;
        loop {
            match self.module.send(command.clone()) {
                Ok(()) => return Ok(()),
                Err(e) => match e.nack_reason() {
                    Some(reason) if reason.is_retryable_i2c() && Instant::now() < deadline => {
                        thread::sleep(self.poll_interval);
                    }
                    _ => return Err(e),
                },
            }
        }
    }

    /// Poll the write status until the controller finishes. Write faults
    /// mark the device and return normally; a NoResultsPending nack means
    /// the controller already retired the transaction.
    fn wait_for_write_completion(&self) -> Result<()> {
        let deadline = Instant::now() + self.transaction_deadline;
        loop {
            let status = self.module.send_receive(Command::I2cWriteStatusQuery {
                channel: self.channel,
            });
            match status {
                Ok(Response::I2cWriteStatus { status, .. }) => {
                    if status & I2C_STATUS_IN_PROGRESS != 0 {
                        if Instant::now() >= deadline {
                            self.note_fault("write never completed");
                            return Ok(());
                        }
                        thread::sleep(self.poll_interval);
                        continue;
                    }
                    if status & I2C_STATUS_TARGET_NACK != 0 {
                        self.note_fault("device did not acknowledge write");
                        return Ok(());
                    }
                    self.warnings.clear_problem_i2c_device(&self.name);
                    return Ok(());
                }
                Ok(other) => {
                    return Err(Error::InvalidPacket(format!(
                        "unexpected write status reply: {:?}",
                        other
                    )))
                }
                Err(e) => match e.nack_reason() {
                    Some(NackReason::I2cNoResultsPending) => return Ok(()),
                    Some(reason) if reason.is_retryable_i2c() && Instant::now() < deadline => {
                        thread::sleep(self.poll_interval);
                    }
                    Some(_) => {
                        self.note_fault("write status refused");
                        return Ok(());
                    }
                    None => return Err(e),
                },
            }
        }
    }

    /// Poll the read status until data arrives. Faults yield zeroed
    /// placeholder data and a warning rather than an error.
    fn poll_for_read_result(&self, count: u8) -> Result<Vec<u8>> {
        let deadline = Instant::now() + self.transaction_deadline;
        loop {
            let status = self.module.send_receive(Command::I2cReadStatusQuery {
                channel: self.channel,
            });
            match status {
                Ok(Response::I2cReadStatus { status, data }) => {
                    if status & I2C_STATUS_IN_PROGRESS != 0 {
                        if Instant::now() >= deadline {
                            return self.placeholder_data(count, "read never completed");
                        }
                        thread::sleep(self.poll_interval);
                        continue;
                    }
                    if status & I2C_STATUS_TARGET_NACK != 0 {
                        return self.placeholder_data(count, "device did not acknowledge read");
                    }
                    if data.len() != count as usize {
                        return self.placeholder_data(count, "short read");
                    }
                    self.warnings.clear_problem_i2c_device(&self.name);
                    return Ok(data);
                }
                Ok(other) => {
                    return Err(Error::InvalidPacket(format!(
                        "unexpected read status reply: {:?}",
                        other
                    )))
                }
                Err(e) => match e.nack_reason() {
                    Some(reason) if reason.is_retryable_i2c() && Instant::now() < deadline => {
                        thread::sleep(self.poll_interval);
                    }
                    Some(_) => return self.placeholder_data(count, "read status refused"),
                    None => return Err(e),
                },
            }
        }
    }

    fn note_fault(&self, what: &str) {
        log::warn!("i2c device '{}': {}", self.name, what);
        self.warnings.note_problem_i2c_device(&self.name);
    }

    fn placeholder_data(&self, count: u8, what: &str) -> Result<Vec<u8>> {
        self.note_fault(&format!("{}; returning placeholder data", what));
        Ok(vec![0; count as usize])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{ControllerContext, HubBus};
    use crate::config::BusConfig;
    use crate::protocol::command::packet_id;
    use crate::testutil::ScriptedHub;

    fn setup(hub: &ScriptedHub) -> (HubBus, ControllerContext, I2cDevice) {
        let mut config = BusConfig::default();
        config.await_interval_ms = 150;
        config.retransmit_interval_ms = 40;
        config.keep_alive_interval_ms = 60_000;
        // Short transaction deadline so stuck-busy tests finish quickly
        config.i2c.transaction_deadline_ms = 80;
        let context = ControllerContext::default();
        let bus = HubBus::open("TESTBUS", Arc::new(hub.transport()), config, &context).unwrap();
        let module = bus.add_module(1, true).unwrap();
        let device = I2cDevice::new(module, 0, 0x3C, "sensor", context.warnings.clone());
        (bus, context, device)
    }

    #[test]
    fn test_write_sends_register_and_data() {
        let hub = ScriptedHub::new(&[(1, true)]);
        let (_bus, _context, device) = setup(&hub);

        device.configure(I2cBusSpeed::Fast400K).unwrap();
        device.write(0x3D, &[0x0C]).unwrap();

        let writes = hub.with_module(1, |m| m.i2c_writes.clone());
        assert_eq!(writes, vec![vec![0x3D, 0x0C]]);
    }

    #[test]
    fn test_combined_read() {
        let hub = ScriptedHub::new(&[(1, true)]);
        let (_bus, _context, device) = setup(&hub);

        hub.with_module(1, |m| m.i2c_read_data = vec![0xAB]);
        assert_eq!(device.read(0x00, 1).unwrap(), vec![0xAB]);
        assert!(hub
            .received_packet_ids(1)
            .contains(&packet_id::I2C_WRITE_READ_MULTIPLE_BYTES));
    }

    #[test]
    fn test_two_command_read_for_old_firmware() {
        let hub = ScriptedHub::new(&[(1, true)]);
        let (_bus, _context, mut device) = setup(&hub);
        device.set_combined_write_read(false);

        hub.with_module(1, |m| m.i2c_read_data = vec![1, 2]);
        assert_eq!(device.read(0x20, 2).unwrap(), vec![1, 2]);

        let received = hub.received_packet_ids(1);
        // Register addressing goes out as a bare single-byte write, then
        // the multi-byte read follows.
        assert!(received.contains(&packet_id::I2C_WRITE_SINGLE_BYTE));
        assert!(received.contains(&packet_id::I2C_READ_MULTIPLE_BYTES));
        assert!(!received.contains(&packet_id::I2C_WRITE_READ_MULTIPLE_BYTES));
    }

    #[test]
    fn test_retries_while_controller_busy() {
        let hub = ScriptedHub::new(&[(1, true)]);
        let (_bus, _context, device) = setup(&hub);

        hub.with_module(1, |m| m.i2c_busy_nacks = 3);
        device.write(0x10, &[0x55]).unwrap();

        let attempts = hub
            .received_packet_ids(1)
            .iter()
            .filter(|&&id| id == packet_id::I2C_WRITE_MULTIPLE_BYTES)
            .count();
        assert_eq!(attempts, 4, "three busy refusals then one success");
    }

    #[test]
    fn test_read_waits_out_in_progress_polls() {
        let hub = ScriptedHub::new(&[(1, true)]);
        let (_bus, _context, device) = setup(&hub);

        hub.with_module(1, |m| {
            m.i2c_read_in_progress_polls = 2;
            m.i2c_read_data = vec![7];
        });
        assert_eq!(device.read(0x00, 1).unwrap(), vec![7]);

        let polls = hub
            .received_packet_ids(1)
            .iter()
            .filter(|&&id| id == packet_id::I2C_READ_STATUS_QUERY)
            .count();
        assert!(polls >= 3);
    }

    #[test]
    fn test_device_fault_yields_placeholder_and_warning() {
        let hub = ScriptedHub::new(&[(1, true)]);
        let (_bus, context, device) = setup(&hub);

        hub.with_module(1, |m| m.i2c_target_nack = true);
        assert_eq!(device.read(0x00, 2).unwrap(), vec![0, 0]);
        assert!(context.warnings.is_problem_i2c_device("sensor"));

        // Next healthy read clears the warning.
        hub.with_module(1, |m| {
            m.i2c_target_nack = false;
            m.i2c_read_data = vec![5, 6];
        });
        assert_eq!(device.read(0x00, 2).unwrap(), vec![5, 6]);
        assert!(!context.warnings.is_problem_i2c_device("sensor"));
    }

    #[test]
    fn test_unexpected_read_nack_yields_placeholder() {
        let hub = ScriptedHub::new(&[(1, true)]);
        let (_bus, context, device) = setup(&hub);

        // Controller claims no transaction is pending (code 12): fake data
        // and a warning, not an error.
        hub.with_module(1, |m| m.i2c_read_status_nack = Some(12));
        assert_eq!(device.read(0x00, 2).unwrap(), vec![0, 0]);
        assert!(context.warnings.is_problem_i2c_device("sensor"));
    }

    #[test]
    fn test_write_no_results_pending_ends_wait() {
        let hub = ScriptedHub::new(&[(1, true)]);
        let (_bus, context, device) = setup(&hub);

        // The controller already retired the write; that is completion.
        hub.with_module(1, |m| m.i2c_write_status_nack = Some(12));
        device.write(0x10, &[0x55]).unwrap();
        assert!(!context.warnings.is_problem_i2c_device("sensor"));
    }

    #[test]
    fn test_write_target_nack_marks_device_and_returns() {
        let hub = ScriptedHub::new(&[(1, true)]);
        let (_bus, context, device) = setup(&hub);

        hub.with_module(1, |m| m.i2c_target_nack = true);
        device.write(0x10, &[0x55]).unwrap();
        assert!(context.warnings.is_problem_i2c_device("sensor"));
    }

    #[test]
    fn test_controller_stuck_busy_yields_placeholder() {
        let hub = ScriptedHub::new(&[(1, true)]);
        let (_bus, context, device) = setup(&hub);

        // Busy refusals past the transaction deadline degrade like any
        // other device fault.
        hub.with_module(1, |m| m.i2c_busy_nacks = u32::MAX);
        assert_eq!(device.read(0x00, 1).unwrap(), vec![0]);
        assert!(context.warnings.is_problem_i2c_device("sensor"));
    }

    #[test]
    fn test_fire_and_forget_write_skips_status_poll() {
        let hub = ScriptedHub::new(&[(1, true)]);
        let (_bus, _context, device) = setup(&hub);

        device
            .write_with_control(0x3D, &[0x0C], I2cWaitControl::None)
            .unwrap();
        assert!(!hub
            .received_packet_ids(1)
            .contains(&packet_id::I2C_WRITE_STATUS_QUERY));
    }

    #[test]
    fn test_zero_byte_read_rejected() {
        let hub = ScriptedHub::new(&[(1, true)]);
        let (_bus, _context, device) = setup(&hub);
        assert!(device.read(0x00, 0).is_err());
    }
}
