//! Discovery results
//!
//! What a discovery broadcast learned about the chain. The list is
//! serializable because, in the full system, it crosses a process boundary
//! to the UI that asks the user to resolve address collisions.

use serde::{Deserialize, Serialize};

/// Kind of IMU found on a module's internal I2C bus, if probing was requested
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ImuType {
    /// Probing was not performed
    #[default]
    Unknown,
    /// Probed and nothing recognizable answered
    None,
    Bno055,
    Bhi260,
}

/// One module found by discovery
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleMeta {
    pub address: u8,
    /// True for the module wired directly to USB; its siblings hang off its
    /// RS-485 port
    pub parent: bool,
    pub imu_type: ImuType,
}

/// Everything one discovery pass learned
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModuleMetaList {
    pub modules: Vec<ModuleMeta>,
}

impl ModuleMetaList {
    pub fn parent(&self) -> Option<&ModuleMeta> {
        self.modules.iter().find(|m| m.parent)
    }

    pub fn children(&self) -> impl Iterator<Item = &ModuleMeta> {
        self.modules.iter().filter(|m| !m.parent)
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn to_json(&self) -> crate::error::Result<String> {
        serde_json::to_string(self).map_err(|e| crate::error::Error::Other(e.to_string()))
    }

    pub fn from_json(json: &str) -> crate::error::Result<Self> {
        serde_json::from_str(json).map_err(|e| crate::error::Error::Other(e.to_string()))
    }
}
