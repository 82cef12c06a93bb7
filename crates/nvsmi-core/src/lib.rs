pub mod config;
pub mod error;
pub mod parser;
pub mod sanitize;
pub mod system;

pub use config::{
    CollectorConfig, ExporterConfig, FailurePolicy, SmiConfig, StalePolicy,
    DEFAULT_FIXTURE_PATH, DEFAULT_LISTEN_ADDRESS, DEFAULT_POLL_INTERVAL_SECS, DEFAULT_SMI_PATH,
};
pub use error::{ConfigError, ParseError, Result};
pub use parser::parse_snapshot;
pub use sanitize::{sanitize, SENTINEL};
pub use system::{
    ClockReading, DeviceReading, MemoryReading, PowerReading, SystemSnapshot, TemperatureReading,
    UtilizationReading,
};
