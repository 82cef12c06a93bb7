mod collector;
mod metrics;
mod source;

pub use collector::{Collector, CollectorError, CollectorExit};
pub use metrics::{DeviceInfoLabels, GpuMetrics, MetricsError};
pub use source::{build_source, CommandSource, FixtureSource, SmiSource, SourceError};

// Re-export core types so the server only depends on this crate for the pipeline
pub use nvsmi_core::{CollectorConfig, ExporterConfig, FailurePolicy, StalePolicy, SystemSnapshot};
