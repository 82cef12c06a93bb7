use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:9202";
pub const DEFAULT_SMI_PATH: &str = "/usr/bin/nvidia-smi";
pub const DEFAULT_FIXTURE_PATH: &str = "test.xml";
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExporterConfig {
    pub listen_address: String,
    /// Read `smi.fixture_path` instead of running the binary
    pub test_mode: bool,
    pub smi: SmiConfig,
    pub collector: CollectorConfig,
}

impl Default for ExporterConfig {
    fn default() -> Self {
        Self {
            listen_address: DEFAULT_LISTEN_ADDRESS.to_string(),
            test_mode: false,
            smi: SmiConfig::default(),
            collector: CollectorConfig::default(),
        }
    }
}

impl ExporterConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Resolves `listen_address`, accepting the Go-style `":9202"` shorthand.
    pub fn listen_socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let address = self.listen_address.trim();
        let address = match address.strip_prefix(':') {
            Some(port) => format!("0.0.0.0:{}", port),
            None => address.to_string(),
        };

        if let Ok(addr) = address.parse::<SocketAddr>() {
            return Ok(addr);
        }

        address
            .to_socket_addrs()
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| ConfigError::InvalidListenAddress(self.listen_address.clone()))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmiConfig {
    pub binary: PathBuf,
    pub args: Vec<String>,
    /// Relative paths resolve against the working directory
    pub fixture_path: PathBuf,
}

impl Default for SmiConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from(DEFAULT_SMI_PATH),
            args: vec!["-q".to_string(), "-x".to_string()],
            fixture_path: PathBuf::from(DEFAULT_FIXTURE_PATH),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Pause between the end of one poll and the start of the next
    pub interval_secs: u64,
    pub failure_policy: FailurePolicy,
    pub stale_policy: StalePolicy,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            failure_policy: FailurePolicy::default(),
            stale_policy: StalePolicy::default(),
        }
    }
}

impl CollectorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }
}

/// What the collector does when nvidia-smi cannot be run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Stop collecting on the first invocation failure
    #[default]
    FailStop,
    /// Retry with a doubling delay; give up after `max_attempts`
    /// consecutive failures (0 = never)
    Backoff { max_attempts: u32, max_delay_secs: u64 },
    /// Keep polling at the normal interval
    RetryForever,
}

/// What happens to series of a device that stops being reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StalePolicy {
    /// Keep the last values forever
    #[default]
    Retain,
    /// Drop the device's series after this many consecutive snapshots without it
    ExpireAfter(u32),
}
