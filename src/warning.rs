//! User-facing warning aggregation
//!
//! Faults in the protocol stack must never crash the control loop; instead
//! they surface here as warnings that the surrounding application can render.
//! The aggregator is an explicit, clone-able handle injected into
//! constructors rather than process-global state.

use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Shared warning aggregator handle
#[derive(Clone, Default)]
pub struct WarningAggregator {
    inner: Arc<WarningInner>,
}

#[derive(Default)]
struct WarningInner {
    /// Global warnings keyed by source (e.g. bus serial number)
    global: Mutex<BTreeMap<String, String>>,
    /// Names of I2C devices currently misbehaving
    problem_i2c_devices: Mutex<BTreeSet<String>>,
    /// Addresses of modules currently not responding
    unresponsive_modules: Mutex<BTreeSet<u8>>,
}

impl WarningAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set (or replace) the global warning attributed to `source`.
    pub fn set_global_warning(&self, source: &str, message: String) {
        log::warn!("{}: {}", source, message);
        self.inner.global.lock().insert(source.to_string(), message);
    }

    pub fn clear_global_warning(&self, source: &str) {
        self.inner.global.lock().remove(source);
    }

    /// Flag an I2C device as misbehaving. Cleared automatically by the next
    /// successful transaction on that device.
    pub fn note_problem_i2c_device(&self, name: &str) {
        let mut devices = self.inner.problem_i2c_devices.lock();
        if devices.insert(name.to_string()) {
            log::warn!("I2C device '{}' is reporting problems", name);
        }
    }

    pub fn clear_problem_i2c_device(&self, name: &str) {
        self.inner.problem_i2c_devices.lock().remove(name);
    }

    pub fn is_problem_i2c_device(&self, name: &str) -> bool {
        self.inner.problem_i2c_devices.lock().contains(name)
    }

    pub fn note_unresponsive_module(&self, address: u8) {
        let mut modules = self.inner.unresponsive_modules.lock();
        if modules.insert(address) {
            log::warn!("module #{} is not responding", address);
        }
    }

    pub fn clear_unresponsive_module(&self, address: u8) {
        self.inner.unresponsive_modules.lock().remove(&address);
    }

    /// Compose all current warnings into one user-visible string.
    pub fn compose(&self) -> String {
        let mut parts: Vec<String> = self.inner.global.lock().values().cloned().collect();
        for address in self.inner.unresponsive_modules.lock().iter() {
            parts.push(format!("Module #{} is not responding", address));
        }
        let problem_devices = self.inner.problem_i2c_devices.lock();
        if !problem_devices.is_empty() {
            let names: Vec<&str> = problem_devices.iter().map(String::as_str).collect();
            parts.push(format!("Problem with I2C device(s): {}", names.join(", ")));
        }
        parts.join("; ")
    }

    pub fn is_empty(&self) -> bool {
        self.inner.global.lock().is_empty()
            && self.inner.problem_i2c_devices.lock().is_empty()
            && self.inner.unresponsive_modules.lock().is_empty()
    }
}
