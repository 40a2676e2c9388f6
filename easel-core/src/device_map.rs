use serde::{Deserialize, Serialize};

/// Requested placement for a model load.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

/// The device a model actually ended up on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComputeDevice {
    Cpu,
    Cuda(usize),
    Metal(usize),
}

impl ComputeDevice {
    pub fn is_gpu(&self) -> bool {
        !matches!(self, ComputeDevice::Cpu)
    }

    /// Resolves what `select_best_device` would pick, without allocating a device.
    pub fn resolve(device_map: DeviceMap) -> Self {
        use candle_core::utils::{cuda_is_available, metal_is_available};

        match device_map {
            DeviceMap::ForceCpu => ComputeDevice::Cpu,
            DeviceMap::Ordinal(ordinal) if cuda_is_available() => ComputeDevice::Cuda(ordinal),
            DeviceMap::Ordinal(ordinal) if metal_is_available() => ComputeDevice::Metal(ordinal),
            DeviceMap::Ordinal(_) => ComputeDevice::Cpu,
        }
    }
}

impl std::fmt::Display for ComputeDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComputeDevice::Cpu => write!(f, "CPU"),
            ComputeDevice::Cuda(ordinal) => write!(f, "CUDA:{ordinal}"),
            ComputeDevice::Metal(ordinal) => write!(f, "METAL:{ordinal}"),
        }
    }
}
