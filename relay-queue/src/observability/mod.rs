pub mod metrics;

pub use metrics::{JobMetrics, MetricsSnapshot, WorkerMetrics};
