use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use nvsmi_core::{parse_snapshot, CollectorConfig, FailurePolicy, ParseError, StalePolicy, SystemSnapshot};
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::metrics::{DeviceInfoLabels, GpuMetrics};
use crate::source::{SmiSource, SourceError};

#[derive(Error, Debug)]
pub enum CollectorError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("Failed to parse nvidia-smi output: {0}")]
    Parse(#[from] ParseError),
}

impl CollectorError {
    pub fn is_invocation_failure(&self) -> bool {
        matches!(self, CollectorError::Source(_))
    }

    /// Value of the `kind` label on `nvidia_smi_poll_failures_total`
    pub fn kind(&self) -> &'static str {
        if self.is_invocation_failure() {
            "invocation"
        } else {
            "parse"
        }
    }
}

/// Why the collector loop stopped.
#[derive(Debug)]
pub enum CollectorExit {
    /// The failure policy gave up on the data source
    Failed {
        error: CollectorError,
        consecutive_failures: u32,
    },
}

/// Polls nvidia-smi and keeps the registry current.
pub struct Collector {
    source: Arc<dyn SmiSource>,
    metrics: GpuMetrics,
    config: CollectorConfig,
    tracker: Option<DeviceTracker>,
}

impl Collector {
    pub fn new(source: Arc<dyn SmiSource>, metrics: GpuMetrics, config: CollectorConfig) -> Self {
        let tracker = match config.stale_policy {
            StalePolicy::ExpireAfter(limit) if limit > 0 => Some(DeviceTracker::new(limit)),
            _ => None,
        };

        Self {
            source,
            metrics,
            config,
            tracker,
        }
    }

    /// Runs a single poll cycle against the source.
    pub async fn poll_once(&mut self) -> Result<SystemSnapshot, CollectorError> {
        info!("Querying SMI...");

        let result = self.collect().await;
        if let Err(e) = &result {
            self.metrics.record_failure(e.kind());
            if e.is_invocation_failure() {
                error!(source = %self.source.describe(), "SMI query failed: {}", e);
            } else {
                warn!("Discarding SMI output: {}", e);
            }
        }
        result
    }

    async fn collect(&mut self) -> Result<SystemSnapshot, CollectorError> {
        let raw = self.source.query().await?;
        let snapshot = parse_snapshot(&raw)?;

        self.metrics.apply(&snapshot);
        if let Some(tracker) = self.tracker.as_mut() {
            tracker.observe(&snapshot, &self.metrics);
        }
        self.metrics.mark_success(SystemTime::now());

        debug!(devices = snapshot.device_count(), "Applied SMI snapshot");
        Ok(snapshot)
    }

    /// Polls until the failure policy gives up. Under `RetryForever` this
    /// never returns.
    pub async fn run(mut self) -> CollectorExit {
        let interval = self.config.interval();
        let policy = self.config.failure_policy;
        let mut failures: u32 = 0;

        info!(
            source = %self.source.describe(),
            interval_secs = interval.as_secs(),
            "Starting SMI collector"
        );
        self.metrics.set_collector_up(true);

        loop {
            let delay = match self.poll_once().await {
                Ok(_) => {
                    failures = 0;
                    interval
                }
                Err(e) if e.is_invocation_failure() => {
                    failures = failures.saturating_add(1);
                    match policy {
                        FailurePolicy::FailStop => return self.stop(e, failures),
                        FailurePolicy::Backoff {
                            max_attempts,
                            max_delay_secs,
                        } => {
                            if max_attempts != 0 && failures >= max_attempts {
                                return self.stop(e, failures);
                            }
                            let delay = backoff_delay(
                                interval,
                                Duration::from_secs(max_delay_secs),
                                failures,
                            );
                            warn!(attempt = failures, delay_secs = delay.as_secs(), "Backing off");
                            delay
                        }
                        FailurePolicy::RetryForever => interval,
                    }
                }
                Err(_) => {
                    failures = 0;
                    interval
                }
            };

            tokio::time::sleep(delay).await;
        }
    }

    pub fn spawn(self) -> JoinHandle<CollectorExit> {
        tokio::spawn(self.run())
    }

    fn stop(&self, error: CollectorError, consecutive_failures: u32) -> CollectorExit {
        self.metrics.set_collector_up(false);
        error!(
            consecutive_failures,
            "SMI collector stopped, metrics will no longer update"
        );
        CollectorExit::Failed {
            error,
            consecutive_failures,
        }
    }
}

/// Delay before retry `attempt` (1-based): `interval` doubled per prior
/// failure, never above `max(max_delay, interval)`.
fn backoff_delay(interval: Duration, max_delay: Duration, attempt: u32) -> Duration {
    let cap = max_delay.max(interval);
    let factor = 1u32
        .checked_shl(attempt.saturating_sub(1))
        .unwrap_or(u32::MAX);
    interval.saturating_mul(factor).min(cap)
}

struct TrackedDevice {
    info: DeviceInfoLabels,
    misses: u32,
}

/// Expires the series of devices missing from too many snapshots in a row.
struct DeviceTracker {
    limit: u32,
    devices: BTreeMap<String, TrackedDevice>,
    driver_version: Option<String>,
}

impl DeviceTracker {
    fn new(limit: u32) -> Self {
        Self {
            limit,
            devices: BTreeMap::new(),
            driver_version: None,
        }
    }

    fn observe(&mut self, snapshot: &SystemSnapshot, metrics: &GpuMetrics) {
        if let Some(previous) = self.driver_version.replace(snapshot.driver_version.clone()) {
            if previous != snapshot.driver_version {
                metrics.remove_driver_info(&previous);
            }
        }

        let mut present = HashSet::new();
        for device in &snapshot.devices {
            let minor = device.minor();
            let info = DeviceInfoLabels::of(device);
            let tracked = TrackedDevice {
                info: info.clone(),
                misses: 0,
            };

            if let Some(old) = self.devices.insert(minor.clone(), tracked) {
                if old.info != info {
                    metrics.remove_info(&minor, &old.info);
                }
            }
            present.insert(minor);
        }

        let limit = self.limit;
        self.devices.retain(|minor, tracked| {
            if present.contains(minor) {
                return true;
            }
            tracked.misses += 1;
            if tracked.misses < limit {
                return true;
            }
            info!(minor = minor.as_str(), "Expiring series of vanished GPU");
            metrics.remove_device(minor, Some(&tracked.info));
            false
        });
    }
}
