use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use nvsmi_core::{ExporterConfig, FailurePolicy, StalePolicy};

const DEFAULT_MAX_ATTEMPTS: u32 = 5;
const DEFAULT_MAX_BACKOFF_SECS: u64 = 300;

#[derive(Parser, Debug)]
#[command(name = "nvsmi-exporter")]
#[command(about = "Prometheus exporter for nvidia-smi", long_about = None)]
pub struct Cli {
    /// JSON config file; flags and environment variables override it
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Address to serve on, e.g. 0.0.0.0:9202 or :9202
    #[arg(long, env = "LISTEN_ADDRESS")]
    pub listen_address: Option<String>,

    /// Read the fixture file instead of running nvidia-smi
    #[arg(
        long,
        env = "TEST_MODE",
        value_parser = parse_switch,
        num_args = 0..=1,
        default_missing_value = "true"
    )]
    pub test_mode: Option<bool>,

    /// Path to the nvidia-smi binary
    #[arg(long, env = "NVIDIA_SMI_PATH")]
    pub smi_path: Option<PathBuf>,

    /// Captured `nvidia-smi -q -x` output used in test mode
    #[arg(long, env = "FIXTURE_PATH")]
    pub fixture: Option<PathBuf>,

    /// Seconds between polls
    #[arg(long, env = "POLL_INTERVAL_SECS")]
    pub interval_secs: Option<u64>,

    /// What to do when nvidia-smi cannot be run
    #[arg(long, env = "ON_FAILURE", value_enum)]
    pub on_failure: Option<FailureMode>,

    /// Consecutive failures before backoff gives up (0 = never)
    #[arg(long, env = "MAX_ATTEMPTS")]
    pub max_attempts: Option<u32>,

    /// Upper bound for the backoff delay
    #[arg(long, env = "MAX_BACKOFF_SECS")]
    pub max_backoff_secs: Option<u64>,

    /// Drop a vanished GPU's series after this many snapshots (0 = keep forever)
    #[arg(long, env = "EXPIRE_AFTER")]
    pub expire_after: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum FailureMode {
    FailStop,
    Backoff,
    Retry,
}

/// Accepts the usual truthy spellings; anything else is off.
fn parse_switch(value: &str) -> Result<bool, String> {
    Ok(matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    ))
}

impl Cli {
    /// Loads the config file, if any, and layers flags and env on top.
    pub fn into_config(self) -> Result<ExporterConfig> {
        let mut config = match &self.config {
            Some(path) => ExporterConfig::from_json_file(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => ExporterConfig::default(),
        };
        self.apply(&mut config);
        Ok(config)
    }

    fn apply(self, config: &mut ExporterConfig) {
        if let Some(address) = self.listen_address {
            config.listen_address = address;
        }
        if let Some(test_mode) = self.test_mode {
            config.test_mode = test_mode;
        }
        if let Some(binary) = self.smi_path {
            config.smi.binary = binary;
        }
        if let Some(fixture) = self.fixture {
            config.smi.fixture_path = fixture;
        }
        if let Some(interval) = self.interval_secs {
            config.collector.interval_secs = interval;
        }

        let collector = &mut config.collector;
        let (attempts, delay) = match collector.failure_policy {
            FailurePolicy::Backoff {
                max_attempts,
                max_delay_secs,
            } => (max_attempts, max_delay_secs),
            _ => (DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_BACKOFF_SECS),
        };
        let backoff = FailurePolicy::Backoff {
            max_attempts: self.max_attempts.unwrap_or(attempts),
            max_delay_secs: self.max_backoff_secs.unwrap_or(delay),
        };

        match self.on_failure {
            Some(FailureMode::FailStop) => collector.failure_policy = FailurePolicy::FailStop,
            Some(FailureMode::Retry) => collector.failure_policy = FailurePolicy::RetryForever,
            Some(FailureMode::Backoff) => collector.failure_policy = backoff,
            None if matches!(collector.failure_policy, FailurePolicy::Backoff { .. }) => {
                collector.failure_policy = backoff;
            }
            None => {}
        }

        match self.expire_after {
            Some(0) => collector.stale_policy = StalePolicy::Retain,
            Some(n) => collector.stale_policy = StalePolicy::ExpireAfter(n),
            None => {}
        }
    }
}
