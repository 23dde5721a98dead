//! Time-series aggregation and Prometheus export.

pub mod collector;
pub mod prometheus;

pub use collector::{MetricSample, MetricsCollector, MetricsConfig, MetricsSnapshot, Rollup, SampleKind};
pub use prometheus::{init_metrics, prometheus_handle, render_metrics};
