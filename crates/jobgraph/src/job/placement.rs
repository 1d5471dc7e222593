use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceTag {
    Cpu,
    Gpu,
}

impl fmt::Display for DeviceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceTag::Cpu => f.write_str("cpu"),
            DeviceTag::Gpu => f.write_str("gpu"),
        }
    }
}

/// Devices an op is placed on.
///
/// Each device name is `<machine>:<device>` or `<machine>:<first>-<last>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParallelConf {
    pub device_tag: DeviceTag,
    pub device_names: Vec<String>,
}

impl ParallelConf {
    pub fn new(device_tag: DeviceTag, device_names: Vec<String>) -> Self {
        Self {
            device_tag,
            device_names,
        }
    }

    /// Single CPU device 0 on machine 0 (the master).
    pub fn cpu_zero_on_master() -> Self {
        Self::new(DeviceTag::Cpu, vec!["0:0".to_string()])
    }
}

impl fmt::Display for ParallelConf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@[{}]", self.device_tag, self.device_names.join(","))
    }
}
