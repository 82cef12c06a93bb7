//! System-level types for hardware monitoring

/// Framebuffer memory usage, MiB
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MemoryReading {
    pub total: f64,
    pub used: f64,
    pub free: f64,
}

/// Utilization, percent
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UtilizationReading {
    pub gpu: f64,
    pub memory: f64,
}

/// Temperatures, Celsius
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TemperatureReading {
    pub current: f64,
    pub max_threshold: f64,
    pub slow_threshold: f64,
}

/// Power, Watts
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PowerReading {
    pub draw: f64,
    pub limit: f64,
}

/// Clock frequencies, MHz
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClockReading {
    pub graphics: f64,
    pub sm: f64,
    pub memory: f64,
    pub video: f64,
}

/// One GPU's telemetry as reported in a single nvidia-smi document.
///
/// Numeric fields hold [`crate::SENTINEL`] when the source field was
/// absent or unparseable.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceReading {
    /// Position of the `<gpu>` block in the document. Not stable across polls.
    pub index: usize,
    pub uuid: String,
    pub product_name: String,
    pub pci_bus: String,
    pub fan_speed: f64,
    pub memory: MemoryReading,
    pub utilization: UtilizationReading,
    pub temperature: TemperatureReading,
    pub power: PowerReading,
    pub clocks: ClockReading,
    pub max_clocks: ClockReading,
}

impl DeviceReading {
    /// The `minor` label value for this device.
    pub fn minor(&self) -> String {
        self.index.to_string()
    }
}

/// Everything one poll cycle learned about the host.
#[derive(Debug, Clone, PartialEq)]
pub struct SystemSnapshot {
    pub driver_version: String,
    pub attached_gpus: f64,
    pub devices: Vec<DeviceReading>,
}

impl SystemSnapshot {
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }
}
