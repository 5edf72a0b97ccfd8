//! 可观测性
//!
//! - 指标采集（`metrics` 门面，由进程安装具体的导出器）
//! - 结构化日志事件

pub mod metrics_collector;
pub mod structured_logger;

pub use metrics_collector::MetricsCollector;
pub use structured_logger::StructuredLogger;
