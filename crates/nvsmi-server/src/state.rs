use nvsmi_services::GpuMetrics;

#[derive(Clone)]
pub struct AppState {
    pub metrics: GpuMetrics,
}

impl AppState {
    pub fn new(metrics: GpuMetrics) -> Self {
        Self { metrics }
    }
}
