//! The hub bus: module registry, discovery, address management, shutdown
//!
//! A `HubBus` owns one transport and everything that shares it: the incoming
//! datagram poller, the transmission lock, the registered modules, and the
//! keep-alive timer that stops idle modules from fail-safing.

mod lock;
mod poller;

pub use lock::TransmissionLock;

use crate::config::BusConfig;
use crate::discovery::{ImuType, ModuleMeta, ModuleMetaList};
use crate::error::{Error, Result};
use crate::i2c::I2cDevice;
use crate::module::HubModule;
use crate::protocol::command::{packet_id, Command, I2cBusSpeed, NackReason};
use crate::protocol::datagram::BROADCAST_ADDRESS;
use crate::protocol::{Datagram, Message, MessageId, RESPONSE_BIT};
use crate::transport::Transport;
use crate::warning::WarningAggregator;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// BNO055 and BHI260 both answer at this 7-bit address
const IMU_I2C_ADDRESS: u8 = 0x28;
const BNO055_CHIP_ID_REGISTER: u8 = 0x00;
const BNO055_CHIP_ID: u8 = 0xA0;
const BHI260_PRODUCT_ID_REGISTER: u8 = 0x2B;
const BHI260_PRODUCT_ID: u8 = 0x89;

/// Keep-alive timer granularity
const KEEP_ALIVE_POLL: Duration = Duration::from_millis(50);

/// Cross-bus state shared by everything attached to one controller:
/// the warning surface and the one-firmware-update-at-a-time flag.
/// Passed in explicitly; nothing in this crate is process-global.
#[derive(Clone, Default)]
pub struct ControllerContext {
    pub warnings: WarningAggregator,
    pub firmware_update_in_progress: Arc<AtomicBool>,
}

/// State shared between the bus handle, its modules, and its threads
pub(crate) struct BusInner {
    serial_number: String,
    transport: Arc<dyn Transport>,
    pub(crate) config: BusConfig,
    pub(crate) lock: TransmissionLock,
    pub(crate) warnings: WarningAggregator,
    next_message_id: AtomicU64,
    engaged: AtomicBool,
    shutdown: AtomicBool,
    /// Registered modules by current address
    modules: Mutex<HashMap<u8, Arc<HubModule>>>,
    /// During an address change, the module is also reachable here under its
    /// new address so replies from either address still route
    modules_changing: Mutex<HashMap<u8, Arc<HubModule>>>,
    /// Accumulates (address, parent) pairs while a discovery pass is active
    discovered: Mutex<Option<Vec<(u8, bool)>>>,
}

impl BusInner {
    pub(crate) fn serial_number(&self) -> &str {
        &self.serial_number
    }

    pub(crate) fn transport(&self) -> Arc<dyn Transport> {
        self.transport.clone()
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub(crate) fn allocate_message_id(&self) -> MessageId {
        MessageId(self.next_message_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Put one message's bytes on the wire. Returns `Ok(false)` when the bus
    /// is disengaged and the transmission was pretended instead.
    pub(crate) fn transmit_datagram(&self, message: &Message) -> Result<bool> {
        if self.is_shut_down() {
            return Err(Error::BusShutDown);
        }
        if !self.engaged.load(Ordering::SeqCst) {
            log::trace!(
                "{}: pretending transmission of msg#{} to #{}",
                self.serial_number,
                message.message_number,
                message.destination
            );
            return Ok(false);
        }
        match self.transport.write(&message.wire_bytes()) {
            Ok(()) => Ok(true),
            Err(e) => {
                self.note_transport_failure("USB device no longer writable");
                Err(e)
            }
        }
    }

    /// Fire-and-forget broadcast; no reply bookkeeping
    fn transmit_broadcast(&self, command: Command) -> Result<()> {
        let message = Message::new(self.allocate_message_id(), BROADCAST_ADDRESS, 1, command);
        self.lock.acquire(message.id);
        let result = self.transmit_datagram(&message).map(|_| ());
        self.lock.release(message.id);
        message.finish();
        result
    }

    pub(crate) fn route_incoming(&self, datagram: Datagram) {
        if datagram.packet_id == packet_id::DISCOVERY | RESPONSE_BIT {
            let parent = datagram.payload.first().copied().unwrap_or(0) != 0;
            match self.discovered.lock().as_mut() {
                Some(accumulator) => accumulator.push((datagram.source, parent)),
                None => log::debug!(
                    "{}: unsolicited discovery response from #{}",
                    self.serial_number,
                    datagram.source
                ),
            }
            return;
        }

        let module = {
            let modules = self.modules.lock();
            modules.get(&datagram.source).cloned()
        }
        .or_else(|| self.modules_changing.lock().get(&datagram.source).cloned());

        match module {
            Some(module) => module.on_incoming_datagram(datagram),
            None => log::warn!(
                "{}: reply from unregistered module #{} dropped",
                self.serial_number,
                datagram.source
            ),
        }
    }

    fn user_modules(&self) -> Vec<Arc<HubModule>> {
        self.modules
            .lock()
            .values()
            .filter(|m| m.is_user_module())
            .cloned()
            .collect()
    }

    fn all_modules(&self) -> Vec<Arc<HubModule>> {
        let mut all: Vec<_> = self.modules.lock().values().cloned().collect();
        all.extend(self.modules_changing.lock().values().cloned());
        all
    }

    /// The transport died under us: warn, then shut the bus down so every
    /// waiting thread unblocks promptly.
    pub(crate) fn note_transport_failure(&self, what: &str) {
        self.warnings
            .set_global_warning(&self.serial_number, what.to_string());
        self.begin_shutdown();
    }

    fn begin_shutdown(&self) {
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        log::info!("{}: shutting down", self.serial_number);
        for module in self.all_modules() {
            module.fail_all_pending(NackReason::AbandonedWaitingForAck);
        }
        self.transport.request_read_interrupt(true);
        self.transport.close();
    }
}

/// Handle to one bus of daisy-chained hub modules
pub struct HubBus {
    inner: Arc<BusInner>,
    /// Serializes discovery, address changes, and other whole-bus operations
    system_operations: Mutex<()>,
    poller_thread: Mutex<Option<JoinHandle<()>>>,
    keep_alive_thread: Mutex<Option<JoinHandle<()>>>,
}

impl HubBus {
    /// Bring up a bus on an open transport and start its service threads
    pub fn open(
        serial_number: &str,
        transport: Arc<dyn Transport>,
        config: BusConfig,
        context: &ControllerContext,
    ) -> Result<HubBus> {
        if !transport.is_open() {
            return Err(Error::InitializationFailed(format!(
                "{}: transport is not open",
                serial_number
            )));
        }

        let inner = Arc::new(BusInner {
            serial_number: serial_number.to_string(),
            transport,
            lock: TransmissionLock::new(config.lock_acquisition_timeout()),
            config,
            warnings: context.warnings.clone(),
            next_message_id: AtomicU64::new(1),
            engaged: AtomicBool::new(true),
            shutdown: AtomicBool::new(false),
            modules: Mutex::new(HashMap::new()),
            modules_changing: Mutex::new(HashMap::new()),
            discovered: Mutex::new(None),
        });

        let poller_thread = {
            let inner = inner.clone();
            thread::Builder::new()
                .name(format!("{}-poller", serial_number))
                .spawn(move || poller::run(inner))?
        };

        let keep_alive_thread = {
            let inner = inner.clone();
            thread::Builder::new()
                .name(format!("{}-keepalive", serial_number))
                .spawn(move || keep_alive_loop(inner))?
        };

        log::info!("bus {} up", serial_number);
        Ok(HubBus {
            inner,
            system_operations: Mutex::new(()),
            poller_thread: Mutex::new(Some(poller_thread)),
            keep_alive_thread: Mutex::new(Some(keep_alive_thread)),
        })
    }

    pub fn serial_number(&self) -> &str {
        self.inner.serial_number()
    }

    pub fn warnings(&self) -> &WarningAggregator {
        &self.inner.warnings
    }

    /// Register a module the application will talk to. Serialized with
    /// system operations so registration never races a transient module
    /// occupying the same address.
    pub fn add_module(&self, address: u8, user_module: bool) -> Result<Arc<HubModule>> {
        if address == BROADCAST_ADDRESS {
            return Err(Error::InvalidParameter(
                "address 0 is reserved for broadcast".to_string(),
            ));
        }
        let _guard = self.system_operations.lock();
        let mut modules = self.inner.modules.lock();
        if modules.contains_key(&address) {
            return Err(Error::InvalidParameter(format!(
                "module address #{} already registered",
                address
            )));
        }
        let module = HubModule::new(Arc::downgrade(&self.inner), address, user_module);
        modules.insert(address, module.clone());
        Ok(module)
    }

    pub fn get_module(&self, address: u8) -> Option<Arc<HubModule>> {
        let _guard = self.system_operations.lock();
        self.inner.modules.lock().get(&address).cloned()
    }

    pub fn remove_module(&self, address: u8) -> Option<Arc<HubModule>> {
        let _guard = self.system_operations.lock();
        self.inner.modules.lock().remove(&address)
    }

    /// Broadcast a discovery request and collect every reply that arrives
    /// within the configured window. Repeatable: each call starts from a
    /// fresh accumulator, so stale replies from an earlier pass are ignored.
    pub fn discover_modules(&self, check_for_imus: bool) -> Result<ModuleMetaList> {
        let _guard = self.system_operations.lock();

        *self.inner.discovered.lock() = Some(Vec::new());
        let broadcast_result = self.inner.transmit_broadcast(Command::Discovery);
        if let Err(e) = &broadcast_result {
            *self.inner.discovered.lock() = None;
            log::error!("{}: discovery broadcast failed: {}", self.serial_number(), e);
        }
        broadcast_result?;

        thread::sleep(self.inner.config.discovery.reply_window());
        let replies = self.inner.discovered.lock().take().unwrap_or_default();

        let mut list = ModuleMetaList::default();
        for (address, parent) in replies {
            if list.modules.iter().any(|m| m.address == address) {
                log::warn!(
                    "{}: duplicate discovery reply from #{}",
                    self.serial_number(),
                    address
                );
                continue;
            }
            list.modules.push(ModuleMeta {
                address,
                parent,
                imu_type: ImuType::Unknown,
            });
        }
        log::info!(
            "{}: discovered {} module(s)",
            self.serial_number(),
            list.len()
        );

        if check_for_imus {
            for meta in &mut list.modules {
                meta.imu_type = self.probe_imu(meta.address);
            }
        }
        Ok(list)
    }

    /// Identify the IMU on a module's internal I2C bus, if any. Both
    /// supported parts answer at the same address; the chip id register
    /// tells them apart.
    fn probe_imu(&self, address: u8) -> ImuType {
        let warnings = self.inner.warnings.clone();
        let probed = self.with_temporary_module(address, |module| {
            let imu = I2cDevice::new(
                module.clone(),
                0,
                IMU_I2C_ADDRESS,
                "imu-probe",
                warnings.clone(),
            );
            imu.configure(I2cBusSpeed::Fast400K)?;
            let chip_id = imu.read(BNO055_CHIP_ID_REGISTER, 1)?;
            if chip_id.first() == Some(&BNO055_CHIP_ID) {
                return Ok(ImuType::Bno055);
            }
            let product_id = imu.read(BHI260_PRODUCT_ID_REGISTER, 1)?;
            if product_id.first() == Some(&BHI260_PRODUCT_ID) {
                return Ok(ImuType::Bhi260);
            }
            Ok(ImuType::None)
        });
        // A module without an IMU trips the probe device's fault path; that
        // is expected and must not linger in the warning surface.
        self.inner.warnings.clear_problem_i2c_device("imu-probe");
        match probed {
            Ok(imu_type) => imu_type,
            Err(e) => {
                log::debug!("imu probe of #{} failed: {}", address, e);
                ImuType::None
            }
        }
    }

    /// Run `op` against a module address without requiring the caller to
    /// have registered it. Serialized with other system operations.
    pub fn perform_system_operation<T>(
        &self,
        address: u8,
        op: impl FnOnce(&Arc<HubModule>) -> Result<T>,
    ) -> Result<T> {
        let _guard = self.system_operations.lock();
        self.with_temporary_module(address, op)
    }

    fn with_temporary_module<T>(
        &self,
        address: u8,
        op: impl FnOnce(&Arc<HubModule>) -> Result<T>,
    ) -> Result<T> {
        let (module, temporary) = {
            let mut modules = self.inner.modules.lock();
            match modules.get(&address) {
                Some(existing) => (existing.clone(), false),
                None => {
                    let module = HubModule::new(Arc::downgrade(&self.inner), address, false);
                    modules.insert(address, module.clone());
                    (module, true)
                }
            }
        };
        let result = op(&module);
        if temporary {
            self.inner.modules.lock().remove(&address);
        }
        result
    }

    /// Change a module's bus address. Two-phase: while the command is in
    /// flight the module is reachable under both addresses, because its ack
    /// may be sourced from either one.
    pub fn change_module_address(&self, module: &Arc<HubModule>, new_address: u8) -> Result<()> {
        if new_address == BROADCAST_ADDRESS {
            return Err(Error::InvalidParameter(
                "address 0 is reserved for broadcast".to_string(),
            ));
        }
        let _guard = self.system_operations.lock();
        let old_address = module.address();
        if old_address == new_address {
            return Ok(());
        }
        if self.inner.modules.lock().contains_key(&new_address) {
            return Err(Error::InvalidParameter(format!(
                "module address #{} already registered",
                new_address
            )));
        }

        self.inner
            .modules_changing
            .lock()
            .insert(new_address, module.clone());
        let result = module.send(Command::SetModuleAddress { new_address });
        if result.is_ok() {
            module.set_address(new_address);
            let mut modules = self.inner.modules.lock();
            if modules.remove(&old_address).is_some() {
                modules.insert(new_address, module.clone());
            }
            log::info!(
                "{}: module address changed #{} -> #{}",
                self.serial_number(),
                old_address,
                new_address
            );
        }
        self.inner.modules_changing.lock().remove(&new_address);
        result
    }

    /// Drive every user module to its safe state
    pub fn fail_safe(&self) {
        for module in self.inner.user_modules() {
            if let Err(e) = module.fail_safe() {
                log::warn!(
                    "{}: fail-safe of module #{} failed: {}",
                    self.serial_number(),
                    module.address(),
                    e
                );
            }
        }
    }

    /// Stop putting bytes on the wire; transmissions are pretended instead.
    /// Used around firmware updates, which own the line exclusively.
    pub fn disengage(&self) {
        log::info!("{}: disengaged", self.serial_number());
        self.inner.engaged.store(false, Ordering::SeqCst);
    }

    pub fn engage(&self) {
        log::info!("{}: engaged", self.serial_number());
        self.inner.engaged.store(true, Ordering::SeqCst);
    }

    pub fn is_engaged(&self) -> bool {
        self.inner.engaged.load(Ordering::SeqCst)
    }

    /// Something fatal happened (typically the USB device vanishing):
    /// record a warning and tear the bus down without the fail-safe pass.
    pub fn shutdown_abnormally(&self, what: &str) {
        self.inner.note_transport_failure(what);
        self.join_threads();
    }

    /// Orderly shutdown: fail-safe the modules, then stop the threads
    pub fn close(&self) {
        if !self.inner.is_shut_down() {
            self.fail_safe();
            self.inner.begin_shutdown();
        }
        self.join_threads();
    }

    fn join_threads(&self) {
        if let Some(handle) = self.poller_thread.lock().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.keep_alive_thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for HubBus {
    fn drop(&mut self) {
        self.close();
    }
}

/// Ping user modules that have been quiet for a full keep-alive interval,
/// so the hub's 2.5 s fail-safe watchdog never fires while we are healthy.
fn keep_alive_loop(bus: Arc<BusInner>) {
    while !bus.is_shut_down() {
        thread::sleep(KEEP_ALIVE_POLL);
        if bus.is_shut_down() || !bus.engaged.load(Ordering::SeqCst) {
            continue;
        }
        let interval = bus.config.keep_alive_interval();
        for module in bus.user_modules() {
            if module.idle_since().elapsed() >= interval {
                if let Err(e) = module.ping() {
                    log::debug!("keep-alive of module #{} failed: {}", module.address(), e);
                }
            }
        }
    }
}
