//! Prometheus registry for nvidia-smi readings
//!
//! Metric names and label keys match the long-standing
//! `nvidia_smi_exporter` output so existing dashboards keep working.

use std::string::FromUtf8Error;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use nvsmi_core::{DeviceReading, SystemSnapshot};
use prometheus::proto::MetricFamily;
use prometheus::{Encoder, Gauge, GaugeVec, IntCounterVec, Opts, Registry, TextEncoder};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum MetricsError {
    #[error("Registry error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("Failed to convert metrics to string: {0}")]
    Encoding(#[from] FromUtf8Error),
}

pub type Result<T> = std::result::Result<T, MetricsError>;

/// Identity labels carried by `nvidia_info` besides `minor`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfoLabels {
    pub uuid: String,
    pub product_name: String,
}

impl DeviceInfoLabels {
    pub fn of(device: &DeviceReading) -> Self {
        Self {
            uuid: device.uuid.clone(),
            product_name: device.product_name.clone(),
        }
    }
}

type Reading = fn(&DeviceReading) -> f64;

/// Handle to the exporter's metric series. Clones share the same series.
#[derive(Clone)]
pub struct GpuMetrics {
    inner: Arc<GpuMetricsInner>,
}

struct GpuMetricsInner {
    registry: Registry,

    driver_info: GaugeVec,
    device_count: Gauge,
    info: GaugeVec,

    fanspeed: GaugeVec,
    memory_total: GaugeVec,
    memory_used: GaugeVec,
    memory_free: GaugeVec,
    utilization_gpu: GaugeVec,
    utilization_memory: GaugeVec,
    temperatures: GaugeVec,
    temperatures_max: GaugeVec,
    temperatures_slow: GaugeVec,
    power_usage: GaugeVec,
    power_limit: GaugeVec,
    clock_graphics: GaugeVec,
    clock_graphics_max: GaugeVec,
    clock_sm: GaugeVec,
    clock_sm_max: GaugeVec,
    clock_mem: GaugeVec,
    clock_mem_max: GaugeVec,
    clock_video: GaugeVec,
    clock_video_max: GaugeVec,

    collector_up: Gauge,
    last_success: Gauge,
    poll_failures: IntCounterVec,
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> prometheus::Result<GaugeVec> {
    let vec = GaugeVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(vec.clone()))?;
    Ok(vec)
}

fn per_device(registry: &Registry, name: &str, help: &str) -> prometheus::Result<GaugeVec> {
    gauge_vec(registry, name, help, &["minor"])
}

fn gauge(registry: &Registry, name: &str, help: &str) -> prometheus::Result<Gauge> {
    let gauge = Gauge::with_opts(Opts::new(name, help))?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

impl GpuMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let r = Registry::new();

        let poll_failures = IntCounterVec::new(
            Opts::new("nvidia_smi_poll_failures_total", "Failed poll cycles by kind."),
            &["kind"],
        )?;
        r.register(Box::new(poll_failures.clone()))?;

        let inner = GpuMetricsInner {
            driver_info: gauge_vec(&r, "nvidia_driver_info", "DriverVersion Information.", &["version"])?,
            device_count: gauge(&r, "nvidia_device_count", "Device Count.")?,
            info: gauge_vec(&r, "nvidia_info", "Device Information.", &["minor", "uuid", "productName"])?,

            fanspeed: per_device(&r, "nvidia_fanspeed", "Fan speed (rpm).")?,
            memory_total: per_device(&r, "nvidia_memory_total", "Total Memory.")?,
            memory_used: per_device(&r, "nvidia_memory_used", "Memory in use.")?,
            memory_free: per_device(&r, "nvidia_memory_free", "Memory free.")?,
            utilization_gpu: per_device(&r, "nvidia_utilization_gpu", "GPU Utilization.")?,
            utilization_memory: per_device(&r, "nvidia_utilization_memory", "Memory utilization.")?,
            temperatures: per_device(&r, "nvidia_temperatures", "Current temperature.")?,
            temperatures_max: per_device(&r, "nvidia_temperatures_max", "Max temperature.")?,
            temperatures_slow: per_device(&r, "nvidia_temperatures_slow", "Throttle temperature.")?,
            power_usage: per_device(&r, "nvidia_power_usage", "Current power consumption.")?,
            power_limit: per_device(&r, "nvidia_power_limit", "Max power consumption.")?,
            clock_graphics: per_device(&r, "nvidia_clock_graphics", "Current graphics clock frequency.")?,
            clock_graphics_max: per_device(&r, "nvidia_clock_graphics_max", "Max graphics clock frequency.")?,
            clock_sm: per_device(&r, "nvidia_clock_sm", "Current SM clock frequency.")?,
            clock_sm_max: per_device(&r, "nvidia_clock_sm_max", "Max graphics SM frequency.")?,
            clock_mem: per_device(&r, "nvidia_clock_mem", "Current DRAM clock frequency.")?,
            clock_mem_max: per_device(&r, "nvidia_clock_mem_max", "Max DRAM clock frequency.")?,
            clock_video: per_device(&r, "nvidia_clock_video", "Current video clock frequency.")?,
            clock_video_max: per_device(&r, "nvidia_clock_video_max", "Max video clock frequency.")?,

            collector_up: gauge(&r, "nvidia_smi_collector_up", "1 while the nvidia-smi collector is running.")?,
            last_success: gauge(
                &r,
                "nvidia_smi_last_success_timestamp_seconds",
                "Unix time of the last successfully applied nvidia-smi snapshot.",
            )?,
            poll_failures,
            registry: r,
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Every series labelled only by `minor`, paired with the reading that feeds it.
    fn device_series(&self) -> [(&GaugeVec, Reading); 19] {
        let m = &self.inner;
        [
            (&m.fanspeed, |d| d.fan_speed),
            (&m.memory_total, |d| d.memory.total),
            (&m.memory_used, |d| d.memory.used),
            (&m.memory_free, |d| d.memory.free),
            (&m.utilization_gpu, |d| d.utilization.gpu),
            (&m.utilization_memory, |d| d.utilization.memory),
            (&m.temperatures, |d| d.temperature.current),
            (&m.temperatures_max, |d| d.temperature.max_threshold),
            (&m.temperatures_slow, |d| d.temperature.slow_threshold),
            (&m.power_usage, |d| d.power.draw),
            (&m.power_limit, |d| d.power.limit),
            (&m.clock_graphics, |d| d.clocks.graphics),
            (&m.clock_graphics_max, |d| d.max_clocks.graphics),
            (&m.clock_sm, |d| d.clocks.sm),
            (&m.clock_sm_max, |d| d.max_clocks.sm),
            (&m.clock_mem, |d| d.clocks.memory),
            (&m.clock_mem_max, |d| d.max_clocks.memory),
            (&m.clock_video, |d| d.clocks.video),
            (&m.clock_video_max, |d| d.max_clocks.video),
        ]
    }

    /// Sets every series from one snapshot. Label sets not in the
    /// snapshot are left as they are.
    pub fn apply(&self, snapshot: &SystemSnapshot) {
        let m = &self.inner;

        m.driver_info
            .with_label_values(&[snapshot.driver_version.as_str()])
            .set(1.0);
        m.device_count.set(snapshot.attached_gpus);

        for device in &snapshot.devices {
            let minor = device.minor();
            m.info
                .with_label_values(&[
                    minor.as_str(),
                    device.uuid.as_str(),
                    device.product_name.as_str(),
                ])
                .set(1.0);
            for (series, read) in self.device_series() {
                series.with_label_values(&[minor.as_str()]).set(read(device));
            }
        }
    }

    /// Drops every `minor`-labelled series of one device, plus its
    /// `nvidia_info` series when the identity labels are known.
    pub fn remove_device(&self, minor: &str, info: Option<&DeviceInfoLabels>) {
        for (series, _) in self.device_series() {
            let _ = series.remove_label_values(&[minor]);
        }
        if let Some(info) = info {
            self.remove_info(minor, info);
        }
        debug!(minor, "Removed device series");
    }

    pub fn remove_info(&self, minor: &str, info: &DeviceInfoLabels) {
        let _ = self
            .inner
            .info
            .remove_label_values(&[minor, info.uuid.as_str(), info.product_name.as_str()]);
    }

    pub fn remove_driver_info(&self, version: &str) {
        let _ = self.inner.driver_info.remove_label_values(&[version]);
    }

    pub fn set_collector_up(&self, up: bool) {
        self.inner.collector_up.set(if up { 1.0 } else { 0.0 });
    }

    pub fn mark_success(&self, at: SystemTime) {
        let seconds = at
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        self.inner.last_success.set(seconds);
    }

    pub fn record_failure(&self, kind: &str) {
        self.inner.poll_failures.with_label_values(&[kind]).inc();
    }

    pub fn gather(&self) -> Vec<MetricFamily> {
        self.inner.registry.gather()
    }

    /// Renders the registry in the Prometheus text exposition format.
    pub fn encode(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    /// Current value of the series with exactly this label set.
    #[cfg(test)]
    pub(crate) fn value(&self, name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        let family = self.gather().into_iter().find(|f| f.get_name() == name)?;
        let kind = family.get_field_type();

        family
            .get_metric()
            .iter()
            .find(|metric| {
                let pairs = metric.get_label();
                pairs.len() == labels.len()
                    && labels.iter().all(|(key, value)| {
                        pairs
                            .iter()
                            .any(|p| p.get_name() == *key && p.get_value() == *value)
                    })
            })
            .map(|metric| match kind {
                prometheus::proto::MetricType::COUNTER => metric.get_counter().get_value(),
                _ => metric.get_gauge().get_value(),
            })
    }

    /// Number of label sets currently held for a series.
    #[cfg(test)]
    pub(crate) fn series_count(&self, name: &str) -> usize {
        self.gather()
            .iter()
            .find(|f| f.get_name() == name)
            .map(|f| f.get_metric().len())
            .unwrap_or(0)
    }
}
